//! Process lifecycle behind a capability interface.
//!
//! The supervisor only talks to `ProcessLauncher` and `ProcessHandle`, so its
//! state machine runs the same against real children and the scripted fake
//! used in tests.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use crate::models::task::ExitOutcome;

/// Everything needed to launch one step of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
}

pub type OutputStream = Box<dyn Read + Send>;

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ProcessHandle>>;
}

pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Hands over the output streams; later calls return nothing.
    fn take_output(&mut self) -> Vec<OutputStream>;

    /// Polite termination request.
    fn terminate(&mut self) -> io::Result<()>;

    fn kill(&mut self) -> io::Result<()>;

    /// Non-blocking exit check. Reaps the process once it has exited.
    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>>;

    /// Whether any member of the process's group still exists. Stays
    /// meaningful after the leader itself was reaped.
    fn group_alive(&self) -> io::Result<bool>;
}

/// Runs commands through `<shell> -c`, each in its own process group.
pub struct ShellLauncher {
    shell: String,
}

impl ShellLauncher {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl ProcessLauncher for ShellLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ProcessHandle>> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.workdir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    fn signal_group(&self, signal: libc::c_int) -> io::Result<()> {
        let rc = unsafe { libc::killpg(self.pgid(), signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // the group is already gone
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    fn pgid(&self) -> libc::pid_t {
        self.child.id() as libc::pid_t
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn take_output(&mut self) -> Vec<OutputStream> {
        let mut streams: Vec<OutputStream> = Vec::new();
        if let Some(stdout) = self.child.stdout.take() {
            streams.push(Box::new(stdout));
        }
        if let Some(stderr) = self.child.stderr.take() {
            streams.push(Box::new(stderr));
        }
        streams
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.signal_group(libc::SIGTERM)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.signal_group(libc::SIGKILL)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(|status| match status.code() {
            Some(code) => ExitOutcome::Code(code),
            None => ExitOutcome::Signal(status.signal().unwrap_or(0)),
        }))
    }

    fn group_alive(&self) -> io::Result<bool> {
        let rc = unsafe { libc::killpg(self.pgid(), 0) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(false),
            Some(libc::EPERM) => Ok(true),
            _ => Err(err),
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // never leave a running group behind a dropped handle
        if let Ok(None) = self.child.try_wait() {
            let _ = self.signal_group(libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}
