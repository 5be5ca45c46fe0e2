use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::chunk::ChunkId;
use crate::error::{CoreError, CoreResult};
use crate::task::Task;

pub trait FileStore: Send + Sync {
    fn open_write(&self, path: &str, append: bool) -> CoreResult<Box<dyn Write + Send>>;
    fn open_read(&self, path: &str) -> CoreResult<Box<dyn Read + Send>>;
    fn exists(&self, path: &str) -> bool;
    /// Size in bytes, 0 when the file does not exist.
    fn size(&self, path: &str) -> u64;
    /// Deleting a missing file is not an error.
    fn delete(&self, path: &str) -> CoreResult<()>;
    fn chunk_file(&self, task: &Task, chunk_id: ChunkId) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct LocalFileStore {
    chunk_dir: Option<PathBuf>,
}

impl LocalFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_dir(chunk_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_dir: Some(chunk_dir.into()),
        }
    }
}

impl FileStore for LocalFileStore {
    fn open_write(&self, path: &str, append: bool) -> CoreResult<Box<dyn Write + Send>> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
            }
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options
            .open(path)
            .map_err(|err| CoreError::Io(format!("{}: {}", path, err)))?;
        Ok(Box::new(file))
    }

    fn open_read(&self, path: &str) -> CoreResult<Box<dyn Read + Send>> {
        let file = File::open(path).map_err(|err| CoreError::Io(format!("{}: {}", path, err)))?;
        Ok(Box::new(file))
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn size(&self, path: &str) -> u64 {
        fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
    }

    fn delete(&self, path: &str) -> CoreResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::Io(format!("{}: {}", path, err))),
        }
    }

    fn chunk_file(&self, task: &Task, chunk_id: ChunkId) -> String {
        match &self.chunk_dir {
            Some(dir) => dir
                .join(format!("task{}.chunk{}.part", task.id().0, chunk_id.0))
                .to_string_lossy()
                .to_string(),
            None => format!("{}.task{}.chunk{}", task.file_path(), task.id().0, chunk_id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    #[test]
    fn append_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.bin");
        let path = path.to_str().unwrap();
        let store = LocalFileStore::new();

        store.open_write(path, true).unwrap().write_all(b"abc").unwrap();
        store.open_write(path, true).unwrap().write_all(b"def").unwrap();
        assert_eq!(store.size(path), 6);

        store.open_write(path, false).unwrap().write_all(b"x").unwrap();
        let mut content = String::new();
        store
            .open_read(path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "x");
    }

    #[test]
    fn missing_file_has_zero_size_and_deletes_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        let path = path.to_str().unwrap();
        let store = LocalFileStore::new();
        assert!(!store.exists(path));
        assert_eq!(store.size(path), 0);
        assert!(store.delete(path).is_ok());
        assert!(store.open_read(path).is_err());
    }

    #[test]
    fn chunk_file_naming() {
        let task = Task::builder("https://example.com/a", "/data/a.iso")
            .build()
            .unwrap()
            .with_id(TaskId(3));
        assert_eq!(
            LocalFileStore::new().chunk_file(&task, ChunkId(9)),
            "/data/a.iso.task3.chunk9"
        );
        assert_eq!(
            LocalFileStore::with_chunk_dir("/var/tmp").chunk_file(&task, ChunkId(9)),
            "/var/tmp/task3.chunk9.part"
        );
    }
}
