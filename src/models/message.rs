/// Requests sent from the task manager to a task's supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Stop,
}

/// Messages from a process's output reader threads to its supervisor.
#[derive(Debug)]
pub enum OutputMessage {
    Chunk(String),
    Closed,
}
