use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::checksum::ChecksumRequest;
use crate::error::{CoreError, CoreResult};

pub const DEFAULT_MAX_PARALLEL_CONNECTIONS: u32 = 4;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub const UNSET: TaskId = TaskId(0);

    pub fn is_set(&self) -> bool {
        *self != Self::UNSET
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Waiting,
    Downloading,
    Merging,
    Finished,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Waiting => "waiting",
            TaskState::Downloading => "downloading",
            TaskState::Merging => "merging",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(TaskState::Idle),
            "waiting" => Some(TaskState::Waiting),
            "downloading" => Some(TaskState::Downloading),
            "merging" => Some(TaskState::Merging),
            "finished" => Some(TaskState::Finished),
            "failed" => Some(TaskState::Failed),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical download. Records are values: every change produces a new
/// `Task` that is handed back to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    id: TaskId,
    url: String,
    file_path: String,
    length: Option<u64>,
    resumable: bool,
    max_parallel_connections: u32,
    payload: Option<String>,
    checksum: Option<ChecksumRequest>,
    state: TaskState,
    message: Option<String>,
}

impl Task {
    pub fn builder(url: impl Into<String>, file_path: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(url, file_path)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    pub fn max_parallel_connections(&self) -> u32 {
        self.max_parallel_connections
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn checksum(&self) -> Option<&ChecksumRequest> {
        self.checksum.as_ref()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    pub(crate) fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub(crate) fn with_state(mut self, state: TaskState) -> Self {
        self.state = state;
        self
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub(crate) fn with_content(mut self, length: Option<u64>, resumable: bool) -> Self {
        self.length = length;
        self.resumable = resumable;
        self
    }

    pub(crate) fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TaskBuilder {
    url: String,
    file_path: String,
    length: Option<u64>,
    max_parallel_connections: u32,
    payload: Option<String>,
    checksum: Option<(String, String)>,
}

impl TaskBuilder {
    pub fn new(url: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_path: file_path.into(),
            length: None,
            max_parallel_connections: DEFAULT_MAX_PARALLEL_CONNECTIONS,
            payload: None,
            checksum: None,
        }
    }

    pub fn max_parallel_connections(mut self, n: u32) -> Self {
        self.max_parallel_connections = n;
        self
    }

    /// A known length skips the probe and marks the task resumable.
    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn checksum(mut self, algorithm: impl Into<String>, digest: impl Into<String>) -> Self {
        self.checksum = Some((algorithm.into(), digest.into()));
        self
    }

    pub fn build(self) -> CoreResult<Task> {
        if self.url.trim().is_empty() || self.file_path.trim().is_empty() {
            return Err(CoreError::InvalidArgument(
                "file path and url can't be empty".to_string(),
            ));
        }
        Url::parse(&self.url)
            .map_err(|err| CoreError::InvalidArgument(format!("invalid url {}: {}", self.url, err)))?;
        if self.max_parallel_connections == 0 {
            return Err(CoreError::InvalidArgument(
                "max parallel connections must be > 0".to_string(),
            ));
        }
        let checksum = match self.checksum {
            Some((algorithm, digest)) => Some(ChecksumRequest::new(&algorithm, digest)?),
            None => None,
        };
        let resumable = self.length.map(|length| length > 0).unwrap_or(false);
        Ok(Task {
            id: TaskId::UNSET,
            url: self.url,
            file_path: self.file_path,
            length: self.length,
            resumable,
            max_parallel_connections: self.max_parallel_connections,
            payload: self.payload,
            checksum,
            state: TaskState::Idle,
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_idle_unassigned_task() {
        let task = Task::builder("https://example.com/file.zip", "/tmp/file.zip")
            .max_parallel_connections(8)
            .payload("opaque")
            .build()
            .expect("build task");
        assert_eq!(task.id(), TaskId::UNSET);
        assert_eq!(task.state(), TaskState::Idle);
        assert_eq!(task.length(), None);
        assert!(!task.is_resumable());
        assert_eq!(task.max_parallel_connections(), 8);
        assert_eq!(task.payload(), Some("opaque"));
    }

    #[test]
    fn builder_rejects_bad_input() {
        assert!(Task::builder("", "/tmp/a").build().is_err());
        assert!(Task::builder("https://example.com/a", "").build().is_err());
        assert!(Task::builder("not a url", "/tmp/a").build().is_err());
        assert!(Task::builder("https://example.com/a", "/tmp/a")
            .max_parallel_connections(0)
            .build()
            .is_err());
        assert!(matches!(
            Task::builder("https://example.com/a", "/tmp/a")
                .checksum("whirlpool", "00")
                .build(),
            Err(CoreError::Unsupported(_))
        ));
    }

    #[test]
    fn preset_length_marks_task_resumable() {
        let task = Task::builder("https://example.com/a", "/tmp/a")
            .length(1024)
            .build()
            .unwrap();
        assert_eq!(task.length(), Some(1024));
        assert!(task.is_resumable());
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            TaskState::Idle,
            TaskState::Waiting,
            TaskState::Downloading,
            TaskState::Merging,
            TaskState::Finished,
            TaskState::Failed,
        ] {
            assert_eq!(TaskState::from_str(state.as_str()), Some(state));
        }
        assert!(TaskState::Finished.is_done());
        assert!(TaskState::Failed.is_done());
        assert!(!TaskState::Merging.is_done());
    }
}
