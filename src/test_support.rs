//! In-process doubles for exercising the worker runtime without a network.

use std::sync::{Arc, Mutex};

use tonic::async_trait;

use crate::status::TaskStatus;
use crate::worker::sink::{DispatchSink, LogStream, SinkError};

/// Dispatch sink that records every status report and log line.
#[derive(Clone, Default)]
pub struct RecordingSink {
    statuses: Arc<Mutex<Vec<(String, TaskStatus)>>>,
    logs: Arc<Mutex<Vec<(String, String)>>>,
    /// When set, every status report fails. For exercising the
    /// swallow-after-retries path.
    fail_status: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses_for(&self, unique_id: &str) -> Vec<TaskStatus> {
        self.statuses
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .filter(|(id, _)| id == unique_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn logs_for(&self, unique_id: &str) -> Vec<String> {
        self.logs
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .filter(|(id, _)| id == unique_id)
            .map(|(_, content)| content.clone())
            .collect()
    }

    pub fn set_fail_status(&self, fail: bool) {
        *self.fail_status.lock().expect("sink lock poisoned") = fail;
    }
}

#[async_trait]
impl DispatchSink for RecordingSink {
    async fn report_status(&self, unique_id: &str, status: TaskStatus) -> Result<(), SinkError> {
        if *self.fail_status.lock().expect("sink lock poisoned") {
            return Err(SinkError::Rejected);
        }
        self.statuses
            .lock()
            .expect("sink lock poisoned")
            .push((unique_id.to_string(), status));
        Ok(())
    }

    async fn open_log_stream(&self) -> Result<Box<dyn LogStream>, SinkError> {
        Ok(Box::new(RecordingStream {
            logs: Arc::clone(&self.logs),
        }))
    }
}

struct RecordingStream {
    logs: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl LogStream for RecordingStream {
    async fn append(&mut self, unique_id: &str, content: &str) -> Result<bool, SinkError> {
        self.logs
            .lock()
            .expect("sink lock poisoned")
            .push((unique_id.to_string(), content.to_string()));
        Ok(true)
    }
}
