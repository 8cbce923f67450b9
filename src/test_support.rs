//! Shared fixtures for unit tests: a sample task and a scripted process
//! launcher that never touches the operating system.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::models::module::{ModuleStep, TaskKind};
use crate::models::task::{ExitOutcome, Task, TaskStatus};
use crate::worker::process::{LaunchSpec, OutputStream, ProcessHandle, ProcessLauncher};

pub(crate) fn sample_task(tab_id: u64, command: &str) -> Task {
    Task {
        id: 0,
        tab_id,
        module_id: "ping-sweep".to_string(),
        module_name: "Ping sweep".to_string(),
        kind: TaskKind::Scan,
        target: None,
        command: command.to_string(),
        status: TaskStatus::Pending,
        output: String::new(),
        truncated: false,
        plan: vec![ModuleStep {
            name: None,
            command: command.to_string(),
            condition: None,
            extract: BTreeMap::new(),
        }],
        steps: Vec::new(),
        context: BTreeMap::new(),
        env: BTreeMap::new(),
        workdir: None,
        pid: None,
        created_at: Utc::now(),
        started_at: None,
        ended_at: None,
        exit: None,
        marker: None,
    }
}

/// Polls `check` until it returns true or `limit` elapses.
pub(crate) fn eventually<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

/// What one fake process does once launched.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBehavior {
    pub output: Vec<String>,
    /// `None` keeps the process running until it is signalled.
    pub exit: Option<ExitOutcome>,
    pub ignore_terminate: bool,
    /// Another group member survives SIGTERM after the leader exits.
    pub straggler: bool,
    pub fail_launch: Option<String>,
}

impl FakeBehavior {
    pub fn exits(code: i32, output: &[&str]) -> Self {
        Self {
            output: output.iter().map(|s| s.to_string()).collect(),
            exit: Some(ExitOutcome::Code(code)),
            ..Self::default()
        }
    }

    pub fn hangs() -> Self {
        Self::default()
    }

    pub fn stubborn() -> Self {
        Self {
            ignore_terminate: true,
            ..Self::default()
        }
    }

    pub fn with_straggler() -> Self {
        Self {
            straggler: true,
            ..Self::default()
        }
    }

    pub fn unlaunchable(reason: &str) -> Self {
        Self {
            fail_launch: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct FakeState {
    exit: Option<ExitOutcome>,
    output: Option<Sender<Vec<u8>>>,
    terminate_calls: usize,
    kill_calls: usize,
    straggler_alive: bool,
}

impl FakeState {
    fn finish(&mut self, outcome: ExitOutcome) {
        self.leader_exits(outcome);
        self.straggler_alive = false;
    }

    fn leader_exits(&mut self, outcome: ExitOutcome) {
        if self.exit.is_none() {
            self.exit = Some(outcome);
        }
        self.output = None;
    }
}

/// Test-side control over one launched fake process.
#[derive(Clone)]
pub(crate) struct FakeProcessControl {
    pub spec: LaunchSpec,
    state: Arc<Mutex<FakeState>>,
}

impl FakeProcessControl {
    pub fn emit(&self, chunk: &str) {
        if let Some(tx) = &self.state.lock().unwrap().output {
            let _ = tx.send(chunk.as_bytes().to_vec());
        }
    }

    pub fn exit(&self, code: i32) {
        self.state.lock().unwrap().finish(ExitOutcome::Code(code));
    }

    /// True while the leader or any straggler is still running.
    pub fn is_alive(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.exit.is_none() || state.straggler_alive
    }

    pub fn terminate_calls(&self) -> usize {
        self.state.lock().unwrap().terminate_calls
    }

    pub fn kill_calls(&self) -> usize {
        self.state.lock().unwrap().kill_calls
    }
}

#[derive(Default)]
pub(crate) struct FakeLauncher {
    script: Mutex<VecDeque<FakeBehavior>>,
    launched: Mutex<Vec<FakeProcessControl>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, behavior: FakeBehavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    pub fn launched(&self) -> Vec<FakeProcessControl> {
        self.launched.lock().unwrap().clone()
    }

    /// Waits for the `index`-th launch.
    pub fn process(&self, index: usize) -> FakeProcessControl {
        assert!(
            eventually(Duration::from_secs(5), || self.launched().len() > index),
            "process {} was never launched",
            index
        );
        self.launched()[index].clone()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ProcessHandle>> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| FakeBehavior::exits(0, &[]));
        if let Some(reason) = behavior.fail_launch {
            return Err(io::Error::new(io::ErrorKind::NotFound, reason));
        }

        let (tx, rx) = unbounded();
        for chunk in &behavior.output {
            let _ = tx.send(chunk.as_bytes().to_vec());
        }
        let mut state = FakeState {
            output: Some(tx),
            straggler_alive: behavior.straggler,
            ..FakeState::default()
        };
        if let Some(outcome) = behavior.exit {
            state.finish(outcome);
        }
        let state = Arc::new(Mutex::new(state));
        self.launched.lock().unwrap().push(FakeProcessControl {
            spec: spec.clone(),
            state: Arc::clone(&state),
        });

        Ok(Box::new(FakeProcess {
            state,
            reader: Some(ChannelReader {
                rx,
                pending: Vec::new(),
            }),
            ignore_terminate: behavior.ignore_terminate,
            straggler: behavior.straggler,
        }))
    }
}

struct FakeProcess {
    state: Arc<Mutex<FakeState>>,
    reader: Option<ChannelReader>,
    ignore_terminate: bool,
    straggler: bool,
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn take_output(&mut self) -> Vec<OutputStream> {
        self.reader
            .take()
            .map(|reader| vec![Box::new(reader) as OutputStream])
            .unwrap_or_default()
    }

    fn terminate(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.terminate_calls += 1;
        if self.straggler {
            state.leader_exits(ExitOutcome::Signal(libc::SIGTERM));
        } else if !self.ignore_terminate {
            state.finish(ExitOutcome::Signal(libc::SIGTERM));
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.kill_calls += 1;
        state.finish(ExitOutcome::Signal(libc::SIGKILL));
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(self.state.lock().unwrap().exit)
    }

    fn group_alive(&self) -> io::Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.exit.is_none() || state.straggler_alive)
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}
