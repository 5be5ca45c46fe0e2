use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Chunks are never planned or split below this size unless the whole
/// resource is smaller.
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 250 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_workers: usize,
    pub max_parallel_connections: u32,
    pub min_chunk_size_bytes: u64,
    pub buffer_size_bytes: usize,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_redirects: usize,
    pub chunk_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_parallel_connections: 4,
            min_chunk_size_bytes: DEFAULT_MIN_CHUNK_SIZE,
            buffer_size_bytes: 64 * 1024,
            user_agent: "chunkflow/0.1".to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 10,
            max_redirects: 10,
            chunk_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_workers == 0 {
            return Err(CoreError::InvalidArgument(
                "number of workers must be > 0".to_string(),
            ));
        }
        if self.max_parallel_connections == 0 {
            return Err(CoreError::InvalidArgument(
                "max parallel connections must be > 0".to_string(),
            ));
        }
        if self.min_chunk_size_bytes == 0 {
            return Err(CoreError::InvalidArgument(
                "minimum chunk size must be > 0".to_string(),
            ));
        }
        if self.buffer_size_bytes == 0 {
            return Err(CoreError::InvalidArgument(
                "buffer size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
