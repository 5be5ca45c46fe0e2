pub mod chunk;
pub mod merge;

use std::collections::HashMap;

use crate::chunk::ChunkId;
use crate::task::TaskId;

pub use chunk::{ChunkJob, ChunkOutcome, ChunkWorker};
pub use merge::{MergeJob, MergeOutcome, MergeWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKey {
    Chunk(ChunkId),
    Merge(TaskId),
}

pub enum Worker {
    Chunk { task_id: TaskId, worker: ChunkWorker },
    Merge { task_id: TaskId, worker: MergeWorker },
}

impl Worker {
    pub fn task_id(&self) -> TaskId {
        match self {
            Worker::Chunk { task_id, .. } | Worker::Merge { task_id, .. } => *task_id,
        }
    }

    pub fn serial(&self) -> u64 {
        match self {
            Worker::Chunk { worker, .. } => worker.serial(),
            Worker::Merge { worker, .. } => worker.serial(),
        }
    }

    pub fn interrupt(&self) {
        match self {
            Worker::Chunk { worker, .. } => worker.interrupt(),
            Worker::Merge { worker, .. } => worker.interrupt(),
        }
    }

    pub fn join(&mut self) {
        match self {
            Worker::Chunk { worker, .. } => worker.join(),
            Worker::Merge { worker, .. } => worker.join(),
        }
    }
}

/// Live workers keyed by what they work on. Only touched from moderator jobs.
#[derive(Default)]
pub struct WorkerPool {
    workers: HashMap<WorkerKey, Worker>,
    next_serial: u64,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn contains(&self, key: &WorkerKey) -> bool {
        self.workers.contains_key(key)
    }

    pub fn insert(&mut self, key: WorkerKey, worker: Worker) {
        self.workers.insert(key, worker);
    }

    /// Removes the entry only if it is still the worker with `serial`.
    pub fn retire(&mut self, key: &WorkerKey, serial: u64) -> Option<Worker> {
        match self.workers.get(key) {
            Some(worker) if worker.serial() == serial => self.workers.remove(key),
            _ => None,
        }
    }

    pub fn chunk_workers_of(&self, task_id: TaskId) -> Vec<&ChunkWorker> {
        self.workers
            .values()
            .filter_map(|worker| match worker {
                Worker::Chunk { task_id: owner, worker } if *owner == task_id => Some(worker),
                _ => None,
            })
            .collect()
    }

    pub fn drain_task(&mut self, task_id: TaskId) -> Vec<Worker> {
        let keys: Vec<WorkerKey> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.task_id() == task_id)
            .map(|(key, _)| *key)
            .collect();
        keys.iter()
            .filter_map(|key| self.workers.remove(key))
            .collect()
    }

    pub fn drain_all(&mut self) -> Vec<Worker> {
        self.workers.drain().map(|(_, worker)| worker).collect()
    }
}

/// Interrupts all workers first so they wind down in parallel, then waits.
pub fn stop_all(mut workers: Vec<Worker>) {
    for worker in &workers {
        worker.interrupt();
    }
    for worker in &mut workers {
        worker.join();
    }
}
