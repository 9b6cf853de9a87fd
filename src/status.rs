//! Invocation lifecycle states.
//!
//! Every invocation walks `Initialization -> Pending -> Running` and then
//! lands on exactly one terminal state. Terminal states are absorbing: the
//! store refuses transitions out of them.

/// Status of a single task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Initialization,
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Manual,
    Panic,
    CallError,
    NoWorker,
    TaskNotFound,
}

impl TaskStatus {
    /// Stable wire code, mirroring the proto enum.
    pub fn code(&self) -> i32 {
        match self {
            Self::Initialization => 0,
            Self::Pending => 1,
            Self::Running => 2,
            Self::Success => 3,
            Self::Failed => 4,
            Self::Timeout => 5,
            Self::Manual => 6,
            Self::Panic => 7,
            Self::CallError => 8,
            Self::NoWorker => 9,
            Self::TaskNotFound => 10,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Initialization),
            1 => Some(Self::Pending),
            2 => Some(Self::Running),
            3 => Some(Self::Success),
            4 => Some(Self::Failed),
            5 => Some(Self::Timeout),
            6 => Some(Self::Manual),
            7 => Some(Self::Panic),
            8 => Some(Self::CallError),
            9 => Some(Self::NoWorker),
            10 => Some(Self::TaskNotFound),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Manual => "manual",
            Self::Panic => "panic",
            Self::CallError => "call_error",
            Self::NoWorker => "no_worker",
            Self::TaskNotFound => "task_not_found",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialization" => Some(Self::Initialization),
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "manual" => Some(Self::Manual),
            "panic" => Some(Self::Panic),
            "call_error" => Some(Self::CallError),
            "no_worker" => Some(Self::NoWorker),
            "task_not_found" => Some(Self::TaskNotFound),
            _ => None,
        }
    }

    /// Whether this status ends the invocation lifecycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initialization | Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
