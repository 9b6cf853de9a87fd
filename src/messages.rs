//! Generated protobuf types for the dispatch and worker services.

use crate::status::TaskStatus;

/// Re-export generated protobuf types
pub mod proto {
    // Dispatch and worker RPC surfaces
    tonic::include_proto!("foreman.rpc");
}

impl From<TaskStatus> for proto::TaskStatus {
    fn from(status: TaskStatus) -> Self {
        // Wire codes are defined to match; a valid code cannot miss.
        proto::TaskStatus::try_from(status.code()).unwrap_or(proto::TaskStatus::Initialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_proto() {
        assert_eq!(
            proto::TaskStatus::from(TaskStatus::Success) as i32,
            TaskStatus::Success.code()
        );
        assert_eq!(
            proto::TaskStatus::from(TaskStatus::Panic) as i32,
            TaskStatus::Panic.code()
        );
        assert_eq!(
            proto::TaskStatus::from(TaskStatus::TaskNotFound) as i32,
            TaskStatus::TaskNotFound.code()
        );
    }
}
