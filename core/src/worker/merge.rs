use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::checksum::Digester;
use crate::chunk::Chunk;
use crate::error::{CoreError, CoreResult};
use crate::files::FileStore;
use crate::moderator::CancelToken;
use crate::task::Task;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Finished {
        length: u64,
        digest: Option<String>,
    },
    ChecksumMismatch {
        algorithm: String,
        expected: String,
        found: String,
        length: u64,
    },
    Failed {
        reason: String,
        error: CoreError,
    },
    Interrupted,
}

pub struct MergeJob {
    pub task: Task,
    pub chunks: Vec<Chunk>,
    pub files: Arc<dyn FileStore>,
    pub buffer_size: usize,
}

enum MergeEnd {
    Merged { length: u64, digest: Option<String> },
    Interrupted,
}

pub struct MergeWorker {
    serial: u64,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    pub fn spawn<F>(serial: u64, job: MergeJob, on_done: F) -> CoreResult<Self>
    where
        F: FnOnce(MergeOutcome) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let thread_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("merge-worker-{}", serial))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| merge(&job, &thread_cancel)))
                    .unwrap_or_else(|_| Err(CoreError::InvalidState("merge worker panicked".to_string())));
                on_done(outcome(&job.task, result));
            })
            .map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(Self {
            serial,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn outcome(task: &Task, result: CoreResult<MergeEnd>) -> MergeOutcome {
    match result {
        Ok(MergeEnd::Interrupted) => MergeOutcome::Interrupted,
        Ok(MergeEnd::Merged { length, digest }) => match (task.checksum(), digest) {
            (Some(request), Some(found)) if !request.matches(&found) => {
                MergeOutcome::ChecksumMismatch {
                    algorithm: request.checksum_type.as_str().to_string(),
                    expected: request.expected_hex.clone(),
                    found,
                    length,
                }
            }
            (_, digest) => MergeOutcome::Finished { length, digest },
        },
        Err(error) => MergeOutcome::Failed {
            reason: format!("Failed to merge {}", task.id()),
            error,
        },
    }
}

/// Concatenates chunk files in range order into the destination, feeding the
/// digester as bytes stream past.
fn merge(job: &MergeJob, cancel: &CancelToken) -> CoreResult<MergeEnd> {
    let mut chunks = job.chunks.clone();
    chunks.sort_by_key(|chunk| chunk.range().map(|range| range.begin()).unwrap_or(0));

    debug!(task = %job.task.id(), chunks = chunks.len(), "merge started");
    let mut out = job.files.open_write(job.task.file_path(), false)?;
    let mut digester = job
        .task
        .checksum()
        .map(|request| Digester::new(request.checksum_type));
    let mut buffer = vec![0u8; job.buffer_size.max(1)];
    let mut length = 0u64;

    for chunk in &chunks {
        if cancel.is_cancelled() {
            return Ok(MergeEnd::Interrupted);
        }
        let file = chunk
            .file()
            .ok_or_else(|| CoreError::InvalidState(format!("{} has no backing file", chunk.id())))?;
        if chunk.is_resumable() {
            let found = job.files.size(file);
            if found != chunk.length() {
                return Err(CoreError::ChunkSizeMismatch {
                    chunk: chunk.id(),
                    expected: chunk.length(),
                    found,
                });
            }
        }
        let mut input = job.files.open_read(file)?;
        loop {
            if cancel.is_cancelled() {
                return Ok(MergeEnd::Interrupted);
            }
            let read = input
                .read(&mut buffer)
                .map_err(|err| CoreError::Io(err.to_string()))?;
            if read == 0 {
                break;
            }
            out.write_all(&buffer[..read])
                .map_err(|err| CoreError::Io(err.to_string()))?;
            if let Some(digester) = digester.as_mut() {
                digester.update(&buffer[..read]);
            }
            length += read as u64;
        }
    }
    out.flush().map_err(|err| CoreError::Io(err.to_string()))?;

    Ok(MergeEnd::Merged {
        length,
        digest: digester.map(Digester::finalize_hex),
    })
}
