use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{self, BufRead, BufReader},
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Instant,
};

use chrono::Utc;
use crossbeam_channel::{bounded, never, select, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use regex::Regex;

use crate::error::EngineError;
use crate::manager::task_manager::EngineSettings;
use crate::models::{
    message::{ControlMessage, OutputMessage},
    module::ModuleStep,
    task::{ExitOutcome, StepRecord, Task, TaskStatus},
};
use crate::registry::template::render;
use crate::store::Store;
use crate::worker::lock;
use crate::worker::process::{LaunchSpec, OutputStream, ProcessHandle, ProcessLauncher};

pub type TaskTable = Arc<Mutex<HashMap<u64, Task>>>;
pub type SupervisorTable = Arc<Mutex<HashMap<u64, SupervisorHandle>>>;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// The manager's side of a running supervisor.
pub struct SupervisorHandle {
    pub control: Sender<ControlMessage>,
    pub thread: Option<JoinHandle<()>>,
}

/// Owns one running task: launches each step, captures its output and
/// writes the terminal state. Nothing else mutates the task's status or
/// output while it runs.
pub struct Supervisor {
    pub task_id: u64,
    pub tasks: TaskTable,
    pub supervisors: SupervisorTable,
    pub store: Arc<Store>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub settings: EngineSettings,
    pub control: Receiver<ControlMessage>,
    stopping: bool,
}

struct Outcome {
    status: TaskStatus,
    exit: Option<ExitOutcome>,
    marker: String,
}

enum StepEnd {
    Exited(ExitOutcome),
    Stopped(Option<ExitOutcome>),
    WaitFailed(String),
}

enum Event {
    Control(Option<ControlMessage>),
    Output(Option<OutputMessage>),
    Tick,
}

pub fn spawn_supervisor(supervisor: Supervisor) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("task-{}", supervisor.task_id))
        .spawn(move || supervisor.run())
}

impl Supervisor {
    pub fn new(
        task_id: u64,
        tasks: TaskTable,
        supervisors: SupervisorTable,
        store: Arc<Store>,
        launcher: Arc<dyn ProcessLauncher>,
        settings: EngineSettings,
        control: Receiver<ControlMessage>,
    ) -> Self {
        Self {
            task_id,
            tasks,
            supervisors,
            store,
            launcher,
            settings,
            control,
            stopping: false,
        }
    }

    fn run(mut self) {
        let snapshot = lock(&self.tasks).get(&self.task_id).map(|task| {
            (
                task.plan.clone(),
                task.context.clone(),
                task.env.clone(),
                task.workdir.clone(),
            )
        });

        if let Some((plan, mut context, env, workdir)) = snapshot {
            let outcome = self.run_plan(&plan, &mut context, &env, workdir.as_deref());
            self.finish(outcome, context);
        } else {
            debug!("Task '{}' vanished before its supervisor started.", self.task_id);
        }

        lock(&self.supervisors).remove(&self.task_id);
    }

    fn run_plan(
        &mut self,
        plan: &[ModuleStep],
        context: &mut BTreeMap<String, String>,
        env: &BTreeMap<String, String>,
        workdir: Option<&str>,
    ) -> Outcome {
        let dir = self.working_dir(workdir);
        if let Err(e) = fs::create_dir_all(&dir) {
            self.append_line(&format!(
                "failed to create working directory '{}': {}",
                dir.display(),
                e
            ));
            return Outcome::failed(None, "launch failed");
        }

        let mut last_exit = None;
        for (index, step) in plan.iter().enumerate() {
            self.poll_control();
            if self.stopping {
                return Outcome::stopped(last_exit);
            }

            let name = step.display_name(index);
            if let Some(condition) = &step.condition {
                let ready = render(condition, |n| context.get(n).cloned())
                    .map(|rendered| !rendered.trim().is_empty())
                    .unwrap_or(false);
                if !ready {
                    info!("Task '{}' skipping step '{}'.", self.task_id, name);
                    continue;
                }
            }

            let command = match render(&step.command, |n| context.get(n).cloned()) {
                Ok(command) => command,
                Err(e) => {
                    self.append_line(&format!("cannot run step '{}': {}", name, e));
                    return Outcome::failed(None, "missing input");
                }
            };

            let offset = self.record_step(index, &name, &command);
            let spec = LaunchSpec {
                command: command.clone(),
                workdir: dir.clone(),
                env: env.clone(),
            };
            let mut handle = match self.launcher.launch(&spec) {
                Ok(handle) => handle,
                Err(e) => {
                    let failure = EngineError::SpawnFailure(format!("{}: {}", command, e));
                    error!("Task '{}' {}", self.task_id, failure);
                    self.append_line(&failure.to_string());
                    return Outcome::failed(None, "launch failed");
                }
            };
            self.set_pid(handle.pid());
            info!(
                "Task '{}' step '{}' running (pid {:?}).",
                self.task_id,
                name,
                handle.pid()
            );

            match self.pump(handle.as_mut()) {
                StepEnd::Exited(exit) if exit.success() => {
                    last_exit = Some(exit);
                    self.extract(step, offset, context);
                }
                StepEnd::Exited(exit) => return Outcome::failed(Some(exit), &exit.to_string()),
                StepEnd::Stopped(exit) => return Outcome::stopped(exit),
                StepEnd::WaitFailed(reason) => {
                    let failure = EngineError::RuntimeFailure(reason);
                    error!("Task '{}' {}", self.task_id, failure);
                    self.append_line(&failure.to_string());
                    return Outcome::failed(None, "wait failed");
                }
            }
        }

        let marker = match last_exit {
            Some(exit) => exit.to_string(),
            None => "all steps skipped".to_string(),
        };
        Outcome {
            status: TaskStatus::Completed,
            exit: last_exit,
            marker,
        }
    }

    /// Runs one live process to its end, relaying output and stop requests.
    fn pump(&mut self, handle: &mut dyn ProcessHandle) -> StepEnd {
        let (tx, rx) = bounded::<OutputMessage>(OUTPUT_CHANNEL_CAPACITY);
        let mut open_streams = 0usize;
        for (n, stream) in handle.take_output().into_iter().enumerate() {
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("task-{}-out{}", self.task_id, n))
                .spawn(move || forward_output(stream, tx));
            match spawned {
                Ok(_) => open_streams += 1,
                Err(e) => error!("Task '{}' cannot read output: {}", self.task_id, e),
            }
        }
        drop(tx);

        let mut control = self.control.clone();
        let mut output = rx;
        let mut stop_deadline: Option<Instant> = None;
        let mut kill_deadline: Option<Instant> = None;
        let mut leader_exit: Option<ExitOutcome> = None;

        let exit = loop {
            let event = select! {
                recv(control) -> msg => Event::Control(msg.ok()),
                recv(output) -> msg => Event::Output(msg.ok()),
                default(self.settings.poll_interval) => Event::Tick,
            };
            match event {
                Event::Control(Some(ControlMessage::Stop)) => self.stopping = true,
                Event::Control(None) => {
                    // manager is gone; nobody can observe this task anymore
                    self.stopping = true;
                    control = never();
                }
                Event::Output(Some(OutputMessage::Chunk(chunk))) => self.append(&chunk),
                Event::Output(Some(OutputMessage::Closed)) => {
                    open_streams = open_streams.saturating_sub(1)
                }
                Event::Output(None) => output = never(),
                Event::Tick => {}
            }

            if self.stopping && stop_deadline.is_none() {
                info!("Stopping task '{}'.", self.task_id);
                if let Err(e) = handle.terminate() {
                    warn!("Task '{}' terminate failed: {}", self.task_id, e);
                }
                stop_deadline = Some(Instant::now() + self.settings.stop_grace);
            }

            if leader_exit.is_none() {
                match handle.try_wait() {
                    Ok(Some(exit)) => leader_exit = Some(exit),
                    Ok(None) => {}
                    Err(e) => {
                        let _ = handle.kill();
                        break Err(e.to_string());
                    }
                }
            }
            if let Some(exit) = leader_exit {
                if !self.stopping {
                    break Ok(Some(exit));
                }
                // a stop is only done once no member of the group is left
                match handle.group_alive() {
                    Ok(true) => {}
                    Ok(false) => break Ok(Some(exit)),
                    Err(e) => {
                        warn!("Task '{}' group check failed: {}", self.task_id, e);
                        break Ok(Some(exit));
                    }
                }
            }

            let now = Instant::now();
            if kill_deadline.is_none() && stop_deadline.is_some_and(|d| now >= d) {
                warn!(
                    "Task '{}' ignored termination, killing process group.",
                    self.task_id
                );
                if let Err(e) = handle.kill() {
                    error!("Task '{}' kill failed: {}", self.task_id, e);
                }
                kill_deadline = Some(now + self.settings.kill_wait);
            }
            if kill_deadline.is_some_and(|d| now >= d) {
                if leader_exit.is_some() {
                    warn!(
                        "Task '{}' group still listed after kill, assuming unreaped members.",
                        self.task_id
                    );
                    break Ok(leader_exit);
                }
                error!("Task '{}' process was not reaped after kill.", self.task_id);
                break Ok(None);
            }
        };

        let drain_deadline = Instant::now() + self.settings.drain_timeout;
        while open_streams > 0 {
            match output.recv_deadline(drain_deadline) {
                Ok(OutputMessage::Chunk(chunk)) => self.append(&chunk),
                Ok(OutputMessage::Closed) => open_streams -= 1,
                Err(_) => break,
            }
        }

        match exit {
            Ok(exit) if self.stopping => StepEnd::Stopped(exit),
            Ok(Some(exit)) => StepEnd::Exited(exit),
            Ok(None) => StepEnd::WaitFailed("process did not exit".to_string()),
            Err(reason) => StepEnd::WaitFailed(reason),
        }
    }

    fn poll_control(&mut self) {
        match self.control.try_recv() {
            Ok(ControlMessage::Stop) | Err(TryRecvError::Disconnected) => self.stopping = true,
            Err(TryRecvError::Empty) => {}
        }
    }

    fn working_dir(&self, workdir: Option<&str>) -> PathBuf {
        let scoped = workdir.filter(|dir| {
            let path = Path::new(dir);
            path.components()
                .all(|component| matches!(component, Component::Normal(_)))
        });
        match scoped {
            Some(dir) => self.settings.workspace.join(dir),
            None => self
                .settings
                .workspace
                .join("tasks")
                .join(self.task_id.to_string()),
        }
    }

    fn append(&self, chunk: &str) {
        if let Some(task) = lock(&self.tasks).get_mut(&self.task_id) {
            task.append_output(chunk, self.settings.max_output_bytes);
        }
    }

    fn append_line(&self, line: &str) {
        if let Some(task) = lock(&self.tasks).get_mut(&self.task_id) {
            task.append_diagnostic(line);
        }
    }

    fn record_step(&self, index: usize, name: &str, command: &str) -> usize {
        let mut tasks = lock(&self.tasks);
        let Some(task) = tasks.get_mut(&self.task_id) else {
            return 0;
        };
        let offset = task.output.len();
        task.steps.push(StepRecord {
            index,
            name: name.to_string(),
            command: command.to_string(),
            offset,
        });
        offset
    }

    fn set_pid(&self, pid: Option<u32>) {
        if let Some(task) = lock(&self.tasks).get_mut(&self.task_id) {
            task.pid = pid;
        }
    }

    fn extract(&self, step: &ModuleStep, offset: usize, context: &mut BTreeMap<String, String>) {
        if step.extract.is_empty() {
            return;
        }
        let output = match lock(&self.tasks).get(&self.task_id) {
            Some(task) => task.output.get(offset..).unwrap_or_default().to_string(),
            None => return,
        };
        for (var, pattern) in &step.extract {
            let re = match Regex::new(pattern) {
                Ok(re) => re,
                Err(e) => {
                    warn!("Task '{}' bad extract pattern '{}': {}", self.task_id, var, e);
                    continue;
                }
            };
            if let Some(caps) = re.captures(&output) {
                let found = caps.get(1).or_else(|| caps.get(0));
                if let Some(value) = found {
                    debug!("Task '{}' extracted {}={}", self.task_id, var, value.as_str());
                    context.insert(var.clone(), value.as_str().trim().to_string());
                }
            }
        }
    }

    fn finish(&self, outcome: Outcome, context: BTreeMap<String, String>) {
        let record = {
            let mut tasks = lock(&self.tasks);
            let Some(task) = tasks.get_mut(&self.task_id) else {
                info!("Task '{}' finished after being deleted.", self.task_id);
                return;
            };
            if !task.status.can_transition_to(outcome.status) {
                warn!(
                    "Task '{}' cannot move from {} to {}.",
                    self.task_id, task.status, outcome.status
                );
                return;
            }
            task.status = outcome.status;
            task.exit = outcome.exit;
            task.marker = Some(outcome.marker);
            task.context = context;
            task.pid = None;
            task.ended_at = Some(Utc::now());
            task.clone()
        };

        info!(
            "Task '{}' {} ({}).",
            self.task_id,
            record.status,
            record.marker.as_deref().unwrap_or_default()
        );
        if let Err(e) = self.store.update_task(&record) {
            error!("Task '{}' result not persisted: {}", self.task_id, e);
        }
    }
}

impl Outcome {
    fn failed(exit: Option<ExitOutcome>, marker: &str) -> Self {
        Self {
            status: TaskStatus::Failed,
            exit,
            marker: marker.to_string(),
        }
    }

    fn stopped(exit: Option<ExitOutcome>) -> Self {
        Self {
            status: TaskStatus::Stopped,
            exit,
            marker: "stopped by operator".to_string(),
        }
    }
}

/// Relays one output stream line by line until EOF.
fn forward_output(stream: OutputStream, tx: Sender<OutputMessage>) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&line).into_owned();
                if tx.send(OutputMessage::Chunk(chunk)).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Output stream read failed: {}", e);
                break;
            }
        }
    }
    let _ = tx.send(OutputMessage::Closed);
}
