use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use super::module::{ModuleStep, TaskKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub tab_id: u64,
    pub module_id: String,
    pub module_name: String,
    pub kind: TaskKind,
    pub target: Option<String>,
    pub command: String,
    pub status: TaskStatus,
    pub output: String,
    pub truncated: bool,
    pub plan: Vec<ModuleStep>,
    pub steps: Vec<StepRecord>,
    pub context: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit: Option<ExitOutcome>,
    pub marker: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
}

/// One executed step of a task, with the byte offset in the task output
/// where that step's output begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub command: String,
    pub offset: usize,
}

/// A consistent `(status, output)` view of a task at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSnapshot {
    pub status: TaskStatus,
    pub output: String,
    pub marker: Option<String>,
    pub truncated: bool,
    pub next_offset: usize,
}

/// Row shape of the per-tab task listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: u64,
    pub module: String,
    pub module_id: String,
    pub status: TaskStatus,
    pub cmd: String,
    pub time: String,
    pub target: Option<String>,
    pub kind: TaskKind,
    pub pid: Option<u32>,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }

    /// Edges of the task state machine. Terminal states are absorbing.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Stopped)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "stopped" => Ok(TaskStatus::Stopped),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Code(0))
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "exit code {}", code),
            ExitOutcome::Signal(signal) => write!(f, "killed by signal {}", signal),
        }
    }
}

impl Task {
    /// Appends process output, keeping the buffer under `limit` bytes.
    ///
    /// Once the limit is hit the buffer is frozen and `truncated` is set;
    /// bytes already appended are never rewritten.
    pub fn append_output(&mut self, chunk: &str, limit: usize) {
        if self.truncated || chunk.is_empty() {
            return;
        }
        let room = limit.saturating_sub(self.output.len());
        if chunk.len() <= room {
            self.output.push_str(chunk);
            return;
        }
        let mut cut = room;
        while cut > 0 && !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.output.push_str(&chunk[..cut]);
        self.truncated = true;
    }

    /// Appends an engine diagnostic on a line of its own. Diagnostics are
    /// few and always kept, even past the output cap.
    pub fn append_diagnostic(&mut self, line: &str) {
        if !self.output.is_empty() && !self.output.ends_with('\n') {
            self.output.push('\n');
        }
        self.output.push_str(line);
        self.output.push('\n');
    }

    pub fn snapshot(&self) -> OutputSnapshot {
        OutputSnapshot {
            status: self.status,
            output: self.output.clone(),
            marker: self.marker.clone(),
            truncated: self.truncated,
            next_offset: self.output.len(),
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            module: self.module_name.clone(),
            module_id: self.module_id.clone(),
            status: self.status,
            cmd: self.command.clone(),
            time: self
                .created_at
                .with_timezone(&Local)
                .format("%H:%M:%S")
                .to_string(),
            target: self.target.clone(),
            kind: self.kind,
            pid: self.pid,
        }
    }
}
