use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::chunk::{Chunk, ChunkId};
use crate::error::{CoreError, CoreResult};
use crate::task::{Task, TaskId};

/// Persistence of task and chunk records. Implementations synchronize
/// internally; the engine's moderator is the only writer of state
/// transitions but readers may come from any thread.
pub trait TaskStore: Send + Sync {
    fn insert_task(&self, task: Task) -> CoreResult<Task>;
    fn update_task(&self, task: Task) -> CoreResult<Task>;
    fn remove_task(&self, id: TaskId) -> CoreResult<()>;
    fn find_task(&self, id: TaskId) -> CoreResult<Option<Task>>;
    fn list_tasks(&self) -> CoreResult<Vec<Task>>;

    fn insert_chunk(&self, chunk: Chunk) -> CoreResult<Chunk>;
    fn update_chunk(&self, chunk: Chunk) -> CoreResult<Chunk>;
    fn remove_chunk(&self, id: ChunkId) -> CoreResult<()>;
    fn find_chunk(&self, id: ChunkId) -> CoreResult<Option<Chunk>>;
    fn chunks_of_task(&self, task_id: TaskId) -> CoreResult<Vec<Chunk>>;
    fn remove_chunks_of_task(&self, task_id: TaskId) -> CoreResult<()>;

    fn unfinished_tasks(&self) -> CoreResult<Vec<Task>>;
    fn finished_tasks(&self) -> CoreResult<Vec<Task>>;
    fn clean_up_finished_tasks(&self) -> CoreResult<()>;
}

#[derive(Default)]
struct Records {
    last_task_id: u64,
    last_chunk_id: u64,
    tasks: BTreeMap<TaskId, Task>,
    chunks: BTreeMap<ChunkId, Chunk>,
}

impl Records {
    fn chunk_ids_of(&self, task_id: TaskId) -> Vec<ChunkId> {
        self.chunks
            .values()
            .filter(|chunk| chunk.task_id() == task_id)
            .map(|chunk| chunk.id())
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<Records>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> CoreResult<RwLockReadGuard<'_, Records>> {
        self.records
            .read()
            .map_err(|_| CoreError::Storage("storage lock poisoned".to_string()))
    }

    fn write(&self) -> CoreResult<RwLockWriteGuard<'_, Records>> {
        self.records
            .write()
            .map_err(|_| CoreError::Storage("storage lock poisoned".to_string()))
    }
}

impl TaskStore for MemoryStorage {
    fn insert_task(&self, task: Task) -> CoreResult<Task> {
        if task.id().is_set() {
            return Err(CoreError::InvalidArgument(
                "can't insert task that already has an id".to_string(),
            ));
        }
        let mut records = self.write()?;
        records.last_task_id += 1;
        let task = task.with_id(TaskId(records.last_task_id));
        records.tasks.insert(task.id(), task.clone());
        Ok(task)
    }

    fn update_task(&self, task: Task) -> CoreResult<Task> {
        let mut records = self.write()?;
        match records.tasks.get_mut(&task.id()) {
            Some(slot) => {
                *slot = task.clone();
                Ok(task)
            }
            None => Err(CoreError::TaskNotFound(task.id())),
        }
    }

    fn remove_task(&self, id: TaskId) -> CoreResult<()> {
        self.write()?.tasks.remove(&id);
        Ok(())
    }

    fn find_task(&self, id: TaskId) -> CoreResult<Option<Task>> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    fn list_tasks(&self) -> CoreResult<Vec<Task>> {
        Ok(self.read()?.tasks.values().cloned().collect())
    }

    fn insert_chunk(&self, chunk: Chunk) -> CoreResult<Chunk> {
        if chunk.id().is_set() {
            return Err(CoreError::InvalidArgument(
                "can't insert chunk that already has an id".to_string(),
            ));
        }
        let mut records = self.write()?;
        records.last_chunk_id += 1;
        let chunk = chunk.with_id(ChunkId(records.last_chunk_id));
        records.chunks.insert(chunk.id(), chunk.clone());
        Ok(chunk)
    }

    fn update_chunk(&self, chunk: Chunk) -> CoreResult<Chunk> {
        let mut records = self.write()?;
        match records.chunks.get_mut(&chunk.id()) {
            Some(slot) => {
                *slot = chunk.clone();
                Ok(chunk)
            }
            None => Err(CoreError::NotFound(chunk.id().to_string())),
        }
    }

    fn remove_chunk(&self, id: ChunkId) -> CoreResult<()> {
        self.write()?.chunks.remove(&id);
        Ok(())
    }

    fn find_chunk(&self, id: ChunkId) -> CoreResult<Option<Chunk>> {
        Ok(self.read()?.chunks.get(&id).cloned())
    }

    fn chunks_of_task(&self, task_id: TaskId) -> CoreResult<Vec<Chunk>> {
        Ok(self
            .read()?
            .chunks
            .values()
            .filter(|chunk| chunk.task_id() == task_id)
            .cloned()
            .collect())
    }

    fn remove_chunks_of_task(&self, task_id: TaskId) -> CoreResult<()> {
        let mut records = self.write()?;
        for id in records.chunk_ids_of(task_id) {
            records.chunks.remove(&id);
        }
        Ok(())
    }

    fn unfinished_tasks(&self) -> CoreResult<Vec<Task>> {
        Ok(self
            .read()?
            .tasks
            .values()
            .filter(|task| !task.is_done())
            .cloned()
            .collect())
    }

    fn finished_tasks(&self) -> CoreResult<Vec<Task>> {
        Ok(self
            .read()?
            .tasks
            .values()
            .filter(|task| task.is_done())
            .cloned()
            .collect())
    }

    fn clean_up_finished_tasks(&self) -> CoreResult<()> {
        let mut records = self.write()?;
        let done: Vec<TaskId> = records
            .tasks
            .values()
            .filter(|task| task.is_done())
            .map(|task| task.id())
            .collect();
        for task_id in done {
            records.tasks.remove(&task_id);
            for chunk_id in records.chunk_ids_of(task_id) {
                records.chunks.remove(&chunk_id);
            }
        }
        Ok(())
    }
}
