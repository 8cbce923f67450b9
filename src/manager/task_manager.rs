use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::unbounded;
use log::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::models::message::ControlMessage;
use crate::models::module::Module;
use crate::models::tab::{normalize_tab_name, Tab};
use crate::models::task::{OutputSnapshot, Task, TaskStatus, TaskSummary};
use crate::registry::{resolve, ModuleRegistry};
use crate::store::Store;
use crate::worker::lock;
use crate::worker::process::ProcessLauncher;
use crate::worker::worker::{
    spawn_supervisor, Supervisor, SupervisorHandle, SupervisorTable, TaskTable,
};

/// Timing and sizing knobs shared by every supervisor.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workspace: PathBuf,
    pub stop_grace: Duration,
    pub kill_wait: Duration,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("workspace"),
            stop_grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(1),
            max_output_bytes: 8 * 1024 * 1024,
        }
    }
}

pub struct TaskManager {
    tasks: TaskTable,
    supervisors: SupervisorTable,
    store: Arc<Store>,
    registry: Arc<ModuleRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    settings: EngineSettings,
}

impl TaskManager {
    /// Loads persisted tasks. Tasks a previous engine left `running` are
    /// failed, since their processes are no longer supervised.
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ModuleRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
        settings: EngineSettings,
    ) -> Result<Self> {
        let mut tasks = HashMap::new();
        for mut task in store.load_tasks()? {
            if task.status == TaskStatus::Running {
                warn!("Task '{}' was running when the engine stopped.", task.id);
                task.append_diagnostic("engine restarted while task was running");
                task.status = TaskStatus::Failed;
                task.marker = Some("interrupted".to_string());
                task.pid = None;
                task.ended_at = Some(Utc::now());
                store.update_task(&task)?;
            }
            tasks.insert(task.id, task);
        }
        info!("Task manager ready with {} task(s).", tasks.len());

        Ok(TaskManager {
            tasks: Arc::new(Mutex::new(tasks)),
            supervisors: Arc::new(Mutex::new(HashMap::new())),
            store,
            registry,
            launcher,
            settings,
        })
    }

    // --- modules ---

    pub fn list_modules(&self) -> Arc<Vec<Module>> {
        self.registry.list()
    }

    pub fn reload_modules(&self) -> usize {
        self.registry.reload()
    }

    // --- tabs ---

    pub fn list_tabs(&self) -> Result<Vec<Tab>> {
        Ok(self.store.list_tabs()?)
    }

    pub fn get_tab(&self, id: u64) -> Result<Tab> {
        self.store
            .get_tab(id)?
            .ok_or_else(|| EngineError::tab_not_found(id))
    }

    pub fn create_tab(&self, name: &str) -> Result<Tab> {
        let tab = self.store.create_tab(&normalize_tab_name(name))?;
        info!("Tab '{}' created ({}).", tab.id, tab.name);
        Ok(tab)
    }

    pub fn rename_tab(&self, id: u64, name: &str) -> Result<()> {
        if !self.store.rename_tab(id, &normalize_tab_name(name))? {
            return Err(EngineError::tab_not_found(id));
        }
        Ok(())
    }

    /// Deletes a tab and every task in it, stopping running ones first.
    pub fn delete_tab(&self, id: u64) -> Result<()> {
        self.get_tab(id)?;
        let task_ids: Vec<u64> = lock(&self.tasks)
            .values()
            .filter(|task| task.tab_id == id)
            .map(|task| task.id)
            .collect();
        for task_id in task_ids {
            self.delete_task(task_id)?;
        }
        self.store.delete_tab(id)?;
        info!("Tab '{}' deleted.", id);
        Ok(())
    }

    // --- tasks ---

    pub fn create_task(
        &self,
        tab_id: u64,
        module_id: &str,
        inputs: &HashMap<String, String>,
    ) -> Result<u64> {
        if self.store.get_tab(tab_id)?.is_none() {
            return Err(EngineError::tab_not_found(tab_id));
        }
        let module = self.registry.get(module_id)?;
        let globals = self.store.global_vars()?;
        let resolution = resolve(&module, inputs, &globals)?;

        let mut task = Task {
            id: 0,
            tab_id,
            module_id: module.id.clone(),
            module_name: module.name.clone(),
            kind: module.kind,
            target: resolution.target,
            command: resolution.command,
            status: TaskStatus::Pending,
            output: String::new(),
            truncated: false,
            plan: module.plan(),
            steps: Vec::new(),
            context: resolution.context,
            env: resolution.env,
            workdir: module.workdir.clone(),
            pid: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit: None,
            marker: None,
        };
        task.id = self.store.insert_task(&task)?;
        let id = task.id;
        lock(&self.tasks).insert(id, task);
        info!("Task '{}' created from module '{}'.", id, module.id);
        Ok(id)
    }

    /// Moves a pending task to `running` and hands it to a new supervisor.
    /// Returns before the process is launched.
    pub fn start_task(&self, id: u64) -> Result<()> {
        let (control_tx, control_rx) = unbounded();
        let task = {
            let mut tasks = lock(&self.tasks);
            let task = tasks
                .get_mut(&id)
                .ok_or_else(|| EngineError::task_not_found(id))?;
            if !task.status.can_transition_to(TaskStatus::Running) {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is {}, only pending tasks can be started",
                    id, task.status
                )));
            }
            // a stop that observes `running` must find the control channel
            lock(&self.supervisors).insert(
                id,
                SupervisorHandle {
                    control: control_tx,
                    thread: None,
                },
            );
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.clone()
        };

        if let Err(e) = self.store.update_task(&task) {
            let mut tasks = lock(&self.tasks);
            lock(&self.supervisors).remove(&id);
            if let Some(task) = tasks.get_mut(&id) {
                task.status = TaskStatus::Pending;
                task.started_at = None;
            }
            return Err(e.into());
        }

        let supervisor = Supervisor::new(
            id,
            Arc::clone(&self.tasks),
            Arc::clone(&self.supervisors),
            Arc::clone(&self.store),
            Arc::clone(&self.launcher),
            self.settings.clone(),
            control_rx,
        );

        match spawn_supervisor(supervisor) {
            Ok(thread) => {
                if let Some(handle) = lock(&self.supervisors).get_mut(&id) {
                    handle.thread = Some(thread);
                }
                info!("Task '{}' started.", id);
                Ok(())
            }
            Err(e) => {
                error!("Task '{}' supervisor could not be spawned: {}", id, e);
                lock(&self.supervisors).remove(&id);
                self.fail_unsupervised(id, &format!("failed to start supervisor: {}", e));
                Err(EngineError::Internal(e.to_string()))
            }
        }
    }

    /// Requests termination of a running task. A no-op for any other status.
    pub fn stop_task(&self, id: u64) -> Result<()> {
        let status = lock(&self.tasks)
            .get(&id)
            .map(|task| task.status)
            .ok_or_else(|| EngineError::task_not_found(id))?;
        if status != TaskStatus::Running {
            debug!("Task '{}' is {}, nothing to stop.", id, status);
            return Ok(());
        }
        self.signal_stop(id);
        Ok(())
    }

    /// Removes a task, stopping it first if it is running. Unknown ids are
    /// accepted so repeated deletes succeed.
    pub fn delete_task(&self, id: u64) -> Result<()> {
        let status = lock(&self.tasks).get(&id).map(|task| task.status);
        let Some(status) = status else {
            debug!("Task '{}' already deleted.", id);
            return Ok(());
        };
        if status == TaskStatus::Running {
            self.signal_stop(id);
        }
        lock(&self.tasks).remove(&id);
        self.store.delete_task(id)?;
        info!("Task '{}' deleted.", id);
        Ok(())
    }

    pub fn get_task(&self, id: u64) -> Result<Task> {
        lock(&self.tasks)
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::task_not_found(id))
    }

    /// Full output buffer with the status it belongs to.
    pub fn read_output(&self, id: u64) -> Result<OutputSnapshot> {
        lock(&self.tasks)
            .get(&id)
            .map(Task::snapshot)
            .ok_or_else(|| EngineError::task_not_found(id))
    }

    /// Output appended since `offset`, where `offset` is a `next_offset`
    /// returned by an earlier read.
    pub fn read_output_from(&self, id: u64, offset: usize) -> Result<OutputSnapshot> {
        let tasks = lock(&self.tasks);
        let task = tasks
            .get(&id)
            .ok_or_else(|| EngineError::task_not_found(id))?;
        let Some(tail) = task.output.get(offset..) else {
            return Err(EngineError::InvalidState(format!(
                "offset {} is not a valid position in the output of task '{}' ({} bytes)",
                offset,
                id,
                task.output.len()
            )));
        };
        Ok(OutputSnapshot {
            status: task.status,
            output: tail.to_string(),
            marker: task.marker.clone(),
            truncated: task.truncated,
            next_offset: task.output.len(),
        })
    }

    /// Tasks of one tab in creation order.
    pub fn list_tasks(&self, tab_id: u64) -> Result<Vec<TaskSummary>> {
        if self.store.get_tab(tab_id)?.is_none() {
            return Err(EngineError::tab_not_found(tab_id));
        }
        let mut tasks: Vec<TaskSummary> = lock(&self.tasks)
            .values()
            .filter(|task| task.tab_id == tab_id)
            .map(Task::summary)
            .collect();
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }

    // --- global variables ---

    pub fn global_vars(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.store.global_vars()?)
    }

    pub fn set_global_var(&self, key: &str, value: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(EngineError::InvalidState(
                "variable name must not be empty".to_string(),
            ));
        }
        self.store.set_global_var(key, value)?;
        Ok(())
    }

    pub fn delete_global_var(&self, key: &str) -> Result<()> {
        self.store.delete_global_var(key)?;
        Ok(())
    }

    /// Stops every running task and waits for its supervisor.
    pub fn shutdown(&self) {
        let handles: Vec<(u64, SupervisorHandle)> = lock(&self.supervisors).drain().collect();
        if handles.is_empty() {
            return;
        }
        info!("Stopping {} running task(s).", handles.len());
        for (_, handle) in &handles {
            let _ = handle.control.send(ControlMessage::Stop);
        }
        for (id, handle) in handles {
            drop(handle.control);
            if let Some(thread) = handle.thread {
                if thread.join().is_err() {
                    error!("Supervisor of task '{}' panicked.", id);
                }
            }
        }
    }

    fn signal_stop(&self, id: u64) {
        match lock(&self.supervisors).get(&id) {
            Some(handle) => {
                if handle.control.send(ControlMessage::Stop).is_err() {
                    debug!("Supervisor of task '{}' already finished.", id);
                }
            }
            None => debug!("Task '{}' has no supervisor, it already finished.", id),
        }
    }

    fn fail_unsupervised(&self, id: u64, reason: &str) {
        let record = {
            let mut tasks = lock(&self.tasks);
            let Some(task) = tasks.get_mut(&id) else {
                return;
            };
            task.append_diagnostic(reason);
            task.status = TaskStatus::Failed;
            task.marker = Some("launch failed".to_string());
            task.ended_at = Some(Utc::now());
            task.clone()
        };
        if let Err(e) = self.store.update_task(&record) {
            error!("Task '{}' result not persisted: {}", id, e);
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
