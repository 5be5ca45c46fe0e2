pub mod checksum;
pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod files;
pub mod moderator;
pub mod net;
pub mod report;
pub mod speed;
pub mod storage;
pub mod task;
pub mod worker;

pub use crate::chunk::{Chunk, ChunkId, ChunkRange};
pub use crate::config::EngineConfig;
pub use crate::engine::{ChecksumMismatchPolicy, DownloadEngine};
pub use crate::error::{CoreError, CoreResult};
pub use crate::events::{EventListener, Executor, InlineExecutor, ListenerId};
pub use crate::report::{ChunkReport, TaskReport};
pub use crate::task::{Task, TaskBuilder, TaskId, TaskState};
