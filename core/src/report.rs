use serde::Serialize;

use crate::chunk::Chunk;
use crate::files::FileStore;
use crate::task::{Task, TaskState};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChunkReport {
    pub chunk: Chunk,
    pub downloaded_length: u64,
}

impl ChunkReport {
    pub fn new(chunk: Chunk, files: &dyn FileStore) -> Self {
        let downloaded_length = if chunk.is_finished() && chunk.is_resumable() {
            chunk.length()
        } else {
            chunk.file().map(|file| files.size(file)).unwrap_or(0)
        };
        Self {
            chunk,
            downloaded_length,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskReport {
    pub task: Task,
    pub chunk_reports: Vec<ChunkReport>,
}

impl TaskReport {
    pub fn new(task: Task, chunks: Vec<Chunk>, files: &dyn FileStore) -> Self {
        let chunk_reports = chunks
            .into_iter()
            .map(|chunk| ChunkReport::new(chunk, files))
            .collect();
        Self {
            task,
            chunk_reports,
        }
    }

    pub fn downloaded_length(&self) -> u64 {
        self.chunk_reports
            .iter()
            .map(|report| report.downloaded_length)
            .sum()
    }

    /// Whole-number progress. Only resumable tasks with a known length report
    /// partial progress; the rest jump from 0 to 100.
    pub fn percent_downloaded(&self) -> u8 {
        match self.task.state() {
            TaskState::Idle | TaskState::Failed => 0,
            TaskState::Merging | TaskState::Finished => 100,
            TaskState::Waiting | TaskState::Downloading => match self.task.length() {
                Some(length) if self.task.is_resumable() && length > 0 => {
                    (self.downloaded_length().min(length) * 100 / length) as u8
                }
                _ => 0,
            },
        }
    }
}
