use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tracing::{debug, info, warn};

use crate::chunk::{plan_chunks, Chunk};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventDispatcher, EventListener, Executor, ListenerId};
use crate::files::{FileStore, LocalFileStore};
use crate::moderator::{CancelToken, Moderator};
use crate::net::{NetClient, ReqwestNetClient};
use crate::report::TaskReport;
use crate::speed::SpeedMeter;
use crate::storage::{MemoryStorage, TaskStore};
use crate::task::{Task, TaskBuilder, TaskId, TaskState};
use crate::worker::{
    stop_all, ChunkJob, ChunkOutcome, ChunkWorker, MergeJob, MergeOutcome, MergeWorker, Worker,
    WorkerKey, WorkerPool,
};

pub const SUCCESS_MESSAGE: &str = "Successful";
pub const CANCELLED_MESSAGE: &str = "Cancelled";
pub const MISSING_CHUNKS_MESSAGE: &str = "Failed to resume task: no chunks recorded";

/// Decides what happens to a merged file whose digest did not match.
pub trait ChecksumMismatchPolicy: Send + Sync {
    fn should_delete(&self, task: &Task, algorithm: &str, expected: &str, found: &str) -> bool;
}

impl<F> ChecksumMismatchPolicy for F
where
    F: Fn(&Task, &str, &str, &str) -> bool + Send + Sync,
{
    fn should_delete(&self, task: &Task, algorithm: &str, expected: &str, found: &str) -> bool {
        self(task, algorithm, expected, found)
    }
}

fn delete_on_mismatch(_task: &Task, _algorithm: &str, _expected: &str, _found: &str) -> bool {
    true
}

#[derive(Clone)]
struct Collaborators {
    store: Arc<dyn TaskStore>,
    net: Arc<dyn NetClient>,
    files: Arc<dyn FileStore>,
}

struct Flags {
    running: bool,
    released: bool,
    max_workers: usize,
}

struct EngineInner {
    config: EngineConfig,
    flags: Mutex<Flags>,
    collaborators: RwLock<Option<Collaborators>>,
    speed: Arc<SpeedMeter>,
    events: EventDispatcher,
    moderator: Moderator,
    pool: Mutex<WorkerPool>,
    checksum_policy: RwLock<Arc<dyn ChecksumMismatchPolicy>>,
}

/// The public download engine. Every decision about workers and task state
/// runs on the engine's moderator; the methods here only validate input and
/// post work to it.
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        config.validate()?;
        let net = ReqwestNetClient::new(&config)?;
        let files = match &config.chunk_dir {
            Some(dir) => LocalFileStore::with_chunk_dir(dir),
            None => LocalFileStore::new(),
        };
        let collaborators = Collaborators {
            store: Arc::new(MemoryStorage::new()),
            net: Arc::new(net),
            files: Arc::new(files),
        };
        let max_workers = config.max_workers;
        let checksum_policy: Arc<dyn ChecksumMismatchPolicy> = Arc::new(delete_on_mismatch);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                flags: Mutex::new(Flags {
                    running: false,
                    released: false,
                    max_workers,
                }),
                collaborators: RwLock::new(Some(collaborators)),
                speed: Arc::new(SpeedMeter::new()),
                events: EventDispatcher::new(),
                moderator: Moderator::new("download-moderator"),
                pool: Mutex::new(WorkerPool::new()),
                checksum_policy: RwLock::new(checksum_policy),
            }),
        })
    }

    pub fn with_storage(self, store: Box<dyn TaskStore>) -> Self {
        let store: Arc<dyn TaskStore> = Arc::from(store);
        self.inner.replace_collaborator(|c| c.store = store);
        self
    }

    pub fn with_net_client(self, net: Box<dyn NetClient>) -> Self {
        let net: Arc<dyn NetClient> = Arc::from(net);
        self.inner.replace_collaborator(|c| c.net = net);
        self
    }

    pub fn with_file_store(self, files: Box<dyn FileStore>) -> Self {
        let files: Arc<dyn FileStore> = Arc::from(files);
        self.inner.replace_collaborator(|c| c.files = files);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn task_builder(&self, url: impl Into<String>, file_path: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(url, file_path)
            .max_parallel_connections(self.inner.config.max_parallel_connections)
    }

    pub fn start(&self) -> CoreResult<()> {
        {
            let mut flags = self.inner.flags();
            if flags.released {
                return Err(CoreError::Released);
            }
            if flags.running {
                return Ok(());
            }
            flags.running = true;
        }
        info!("download engine started");
        self.inner.speed.start();
        self.inner.post(|inner, token| {
            inner.events.dispatch(Event::Resumed);
            inner.rescan(token)
        });
        Ok(())
    }

    /// Stops every worker, demotes in-flight tasks to WAITING and shuts the
    /// moderator down. Returns once all workers have exited.
    ///
    /// Fails with `InvalidState` when called from a listener running on the
    /// moderator thread.
    pub fn pause(&self) -> CoreResult<()> {
        self.inner.ensure_off_moderator("pause")?;
        {
            let mut flags = self.inner.flags();
            if flags.released {
                return Err(CoreError::Released);
            }
            if !flags.running {
                return Ok(());
            }
            flags.running = false;
        }
        self.inner.pause_internal()
    }

    pub fn release(&self) -> CoreResult<()> {
        self.inner.ensure_off_moderator("release")?;
        let was_running = {
            let mut flags = self.inner.flags();
            if flags.released {
                return Ok(());
            }
            let was_running = flags.running;
            flags.running = false;
            flags.released = true;
            was_running
        };
        if was_running {
            self.inner.pause_internal()?;
        }
        self.inner.moderator.interrupt();
        if let Ok(mut collaborators) = self.inner.collaborators.write() {
            *collaborators = None;
        }
        self.inner.events.clear();
        info!("download engine released");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn is_released(&self) -> bool {
        self.inner.flags().released
    }

    pub fn add_task(&self, task: Task) -> CoreResult<Task> {
        let c = self.inner.collaborators()?;
        let task = c.store.insert_task(task)?;
        debug!(task = %task.id(), url = task.url(), "task added");
        self.inner.events.dispatch(Event::TaskAdded(task.clone()));
        if self.is_running() {
            self.inner.post_rescan();
        }
        Ok(task)
    }

    pub fn cancel_task(&self, id: TaskId) -> CoreResult<()> {
        let c = self.inner.collaborators()?;
        if c.store.find_task(id)?.is_none() {
            return Err(CoreError::TaskNotFound(id));
        }
        self.inner.post(move |inner, _| match inner.collaborators() {
            Ok(c) => inner.fail_task(&c, id, CANCELLED_MESSAGE.to_string(), true),
            Err(_) => Ok(()),
        });
        Ok(())
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers()
    }

    pub fn set_max_workers(&self, max_workers: usize) -> CoreResult<()> {
        if max_workers == 0 {
            return Err(CoreError::InvalidArgument(
                "max workers must be > 0".to_string(),
            ));
        }
        let running = {
            let mut flags = self.inner.flags();
            if flags.released {
                return Err(CoreError::Released);
            }
            flags.max_workers = max_workers;
            flags.running
        };
        if running {
            self.inner.post_rescan();
        }
        Ok(())
    }

    pub fn register_listener(
        &self,
        executor: Arc<dyn Executor>,
        listener: Arc<dyn EventListener>,
    ) -> CoreResult<ListenerId> {
        self.inner.ensure_not_released()?;
        Ok(self.inner.events.register(executor, listener))
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.events.unregister(id)
    }

    pub fn clear_listeners(&self) {
        self.inner.events.clear();
    }

    pub fn set_checksum_mismatch_policy<P>(&self, policy: P)
    where
        P: ChecksumMismatchPolicy + 'static,
    {
        if let Ok(mut slot) = self.inner.checksum_policy.write() {
            *slot = Arc::new(policy);
        }
    }

    pub fn speed(&self) -> u64 {
        self.inner.speed.speed()
    }

    pub fn task_report(&self, id: TaskId) -> CoreResult<TaskReport> {
        let c = self.inner.collaborators()?;
        let task = c.store.find_task(id)?.ok_or(CoreError::TaskNotFound(id))?;
        EngineInner::report(&c, task)
    }

    pub fn task_reports(&self, ids: &[TaskId]) -> CoreResult<Vec<TaskReport>> {
        ids.iter().map(|id| self.task_report(*id)).collect()
    }

    pub fn list_tasks(&self) -> CoreResult<Vec<Task>> {
        self.inner.collaborators()?.store.list_tasks()
    }

    pub fn store(&self) -> CoreResult<Arc<dyn TaskStore>> {
        Ok(self.inner.collaborators()?.store)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.pool().len()
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "release on drop failed");
        }
    }
}

impl EngineInner {
    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pool(&self) -> MutexGuard<'_, WorkerPool> {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_running(&self) -> bool {
        self.flags().running
    }

    fn max_workers(&self) -> usize {
        self.flags().max_workers
    }

    fn ensure_not_released(&self) -> CoreResult<()> {
        if self.flags().released {
            return Err(CoreError::Released);
        }
        Ok(())
    }

    fn ensure_off_moderator(&self, operation: &str) -> CoreResult<()> {
        if self.moderator.is_current_thread() {
            return Err(CoreError::InvalidState(format!(
                "can't {} from the moderator thread",
                operation
            )));
        }
        Ok(())
    }

    fn collaborators(&self) -> CoreResult<Collaborators> {
        self.collaborators
            .read()
            .map_err(|_| CoreError::Storage("collaborator lock poisoned".to_string()))?
            .clone()
            .ok_or(CoreError::Released)
    }

    fn replace_collaborator<F>(&self, apply: F)
    where
        F: FnOnce(&mut Collaborators),
    {
        if let Ok(mut guard) = self.collaborators.write() {
            if let Some(collaborators) = guard.as_mut() {
                apply(collaborators);
            }
        }
    }

    fn checksum_policy(&self) -> Arc<dyn ChecksumMismatchPolicy> {
        match self.checksum_policy.read() {
            Ok(policy) => Arc::clone(&policy),
            Err(_) => Arc::new(delete_on_mismatch),
        }
    }

    fn post<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce(&Arc<EngineInner>, &CancelToken) -> CoreResult<()> + Send + 'static,
    {
        let weak: Weak<EngineInner> = Arc::downgrade(self);
        self.moderator.submit(move |token| match weak.upgrade() {
            Some(inner) => job(&inner, token),
            None => Ok(()),
        });
    }

    fn post_rescan(self: &Arc<Self>) {
        self.post(|inner, token| inner.rescan(token));
    }

    fn report(c: &Collaborators, task: Task) -> CoreResult<TaskReport> {
        let chunks = c.store.chunks_of_task(task.id())?;
        Ok(TaskReport::new(task, chunks, c.files.as_ref()))
    }

    fn terminal_report(c: &Collaborators, task: Task) -> TaskReport {
        match c.store.chunks_of_task(task.id()) {
            Ok(chunks) => TaskReport::new(task, chunks, c.files.as_ref()),
            Err(err) => {
                warn!(task = %task.id(), error = %err, "can't load chunks for report");
                TaskReport {
                    task,
                    chunk_reports: Vec::new(),
                }
            }
        }
    }

    fn emit(&self, c: &Collaborators, event: fn(TaskReport) -> Event, task: Task) {
        match Self::report(c, task) {
            Ok(report) => self.events.dispatch(event(report)),
            Err(err) => warn!(error = %err, "can't build task report"),
        }
    }

    fn pause_internal(self: &Arc<Self>) -> CoreResult<()> {
        info!("download engine paused");
        self.speed.pause();
        let inner = Arc::clone(self);
        let result = self.moderator.run_blocking(move |_| inner.stop_everything());
        self.moderator.interrupt();
        result
    }

    fn stop_everything(&self) -> CoreResult<()> {
        let workers = self.pool().drain_all();
        debug!(workers = workers.len(), "stopping all workers");
        stop_all(workers);
        if let Ok(c) = self.collaborators() {
            for task in c.store.unfinished_tasks()? {
                if matches!(task.state(), TaskState::Downloading | TaskState::Merging) {
                    let task = c.store.update_task(task.with_state(TaskState::Waiting))?;
                    self.emit(&c, Event::TaskUpdated, task);
                }
            }
        }
        self.events.dispatch(Event::Paused);
        Ok(())
    }

    fn rescan(self: &Arc<Self>, token: &CancelToken) -> CoreResult<()> {
        let Ok(c) = self.collaborators() else {
            return Ok(());
        };
        for task in c.store.unfinished_tasks()? {
            if token.is_cancelled() || !self.is_running() {
                break;
            }
            let task = if task.state() == TaskState::Idle {
                match self.initialize(&c, task) {
                    Some(task) => task,
                    None => continue,
                }
            } else {
                task
            };

            let capacity = self.max_workers();
            if self.pool().len() >= capacity {
                continue;
            }
            let chunks = c.store.chunks_of_task(task.id())?;
            if chunks.is_empty() {
                warn!(task = %task.id(), state = %task.state(), "planned task has no chunks");
                self.fail_task(&c, task.id(), MISSING_CHUNKS_MESSAGE.to_string(), false)?;
                continue;
            }
            if chunks.iter().all(Chunk::is_finished) {
                self.spawn_merge(&c, task, chunks)?;
            } else {
                self.spawn_chunks(&c, task, chunks, capacity)?;
            }
        }
        Ok(())
    }

    /// IDLE -> WAITING, or FAILED when the task can't be planned.
    fn initialize(&self, c: &Collaborators, task: Task) -> Option<Task> {
        match self.plan(c, &task) {
            Ok(task) => {
                debug!(task = %task.id(), length = ?task.length(), resumable = task.is_resumable(), "task initialized");
                self.emit(c, Event::TaskUpdated, task.clone());
                Some(task)
            }
            Err(err) => {
                warn!(task = %task.id(), error = %err, "task initialization failed");
                let failed = task
                    .with_state(TaskState::Failed)
                    .with_message(format!("Failed to initialize task: {}", err));
                match c.store.update_task(failed) {
                    Ok(failed) => self.emit(c, Event::TaskFailed, failed),
                    Err(err) => warn!(error = %err, "can't store failed task"),
                }
                None
            }
        }
    }

    fn plan(&self, c: &Collaborators, task: &Task) -> CoreResult<Task> {
        Self::delete_chunks(c, task.id())?;

        let task = match task.length() {
            Some(length) if length > 0 => task.clone(),
            _ => {
                let description = c.net.probe(task);
                task.clone()
                    .with_content(description.length, description.resumable())
            }
        };

        let ranges = match task.length() {
            Some(length) if task.is_resumable() => plan_chunks(
                length,
                task.max_parallel_connections(),
                self.config.min_chunk_size_bytes,
            )
            .into_iter()
            .map(Some)
            .collect(),
            _ => vec![None],
        };
        for range in ranges {
            let chunk = c.store.insert_chunk(Chunk::new(task.id(), range))?;
            let file = c.files.chunk_file(&task, chunk.id());
            c.store.update_chunk(chunk.with_file(file))?;
        }
        c.store.update_task(task.with_state(TaskState::Waiting))
    }

    fn spawn_merge(self: &Arc<Self>, c: &Collaborators, task: Task, chunks: Vec<Chunk>) -> CoreResult<()> {
        let task_id = task.id();
        let key = WorkerKey::Merge(task_id);
        {
            let mut pool = self.pool();
            if pool.contains(&key) {
                return Ok(());
            }
            let serial = pool.next_serial();
            let weak = Arc::downgrade(self);
            let job = MergeJob {
                task: task.clone(),
                chunks,
                files: Arc::clone(&c.files),
                buffer_size: self.config.buffer_size_bytes,
            };
            let worker = MergeWorker::spawn(serial, job, move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    inner.post(move |inner, _| inner.on_merge_outcome(task_id, serial, outcome));
                }
            })?;
            debug!(task = %task_id, worker = serial, "merge worker spawned");
            pool.insert(key, Worker::Merge { task_id, worker });
        }
        if task.state() != TaskState::Merging {
            let task = c.store.update_task(task.with_state(TaskState::Merging))?;
            self.emit(c, Event::TaskUpdated, task);
        }
        Ok(())
    }

    fn spawn_chunks(
        self: &Arc<Self>,
        c: &Collaborators,
        task: Task,
        chunks: Vec<Chunk>,
        capacity: usize,
    ) -> CoreResult<()> {
        let mut spawned = 0usize;
        {
            let mut pool = self.pool();
            for chunk in chunks.into_iter().filter(|chunk| !chunk.is_finished()) {
                if pool.len() >= capacity {
                    break;
                }
                if pool.contains(&WorkerKey::Chunk(chunk.id())) {
                    continue;
                }
                self.spawn_chunk(&mut pool, c, &task, chunk)?;
                spawned += 1;
            }
            if task.is_resumable() {
                self.rebalance(&mut pool, c, &task, capacity)?;
            }
        }
        if spawned > 0 && task.state() != TaskState::Downloading {
            let task = c.store.update_task(task.with_state(TaskState::Downloading))?;
            self.emit(c, Event::TaskUpdated, task);
        }
        Ok(())
    }

    fn spawn_chunk(
        self: &Arc<Self>,
        pool: &mut WorkerPool,
        c: &Collaborators,
        task: &Task,
        chunk: Chunk,
    ) -> CoreResult<()> {
        let task_id = task.id();
        let key = WorkerKey::Chunk(chunk.id());
        let serial = pool.next_serial();
        let weak = Arc::downgrade(self);
        let job = ChunkJob {
            task: task.clone(),
            chunk,
            net: Arc::clone(&c.net),
            files: Arc::clone(&c.files),
            speed: Arc::clone(&self.speed),
            buffer_size: self.config.buffer_size_bytes,
        };
        let worker = ChunkWorker::spawn(serial, job, move |outcome| {
            if let Some(inner) = weak.upgrade() {
                inner.post(move |inner, _| inner.on_chunk_outcome(key, serial, outcome));
            }
        })?;
        debug!(task = %task_id, worker = serial, key = ?key, "chunk worker spawned");
        pool.insert(key, Worker::Chunk { task_id, worker });
        Ok(())
    }

    /// Hands the unread tail of the busiest worker to a new worker until the
    /// pool or the task's connection limit is full.
    fn rebalance(
        self: &Arc<Self>,
        pool: &mut WorkerPool,
        c: &Collaborators,
        task: &Task,
        capacity: usize,
    ) -> CoreResult<()> {
        let max_connections = task.max_parallel_connections() as usize;
        loop {
            let running = pool.chunk_workers_of(task.id());
            let budget = capacity
                .saturating_sub(pool.len())
                .min(max_connections.saturating_sub(running.len()));
            if budget == 0 {
                return Ok(());
            }
            let Some(target) = running.into_iter().max_by_key(|worker| worker.remaining_bytes()) else {
                return Ok(());
            };
            let split = target.split(
                task,
                self.config.min_chunk_size_bytes,
                c.store.as_ref(),
                c.files.as_ref(),
            )?;
            let Some(tail) = split else {
                return Ok(());
            };
            self.spawn_chunk(pool, c, task, tail)?;
        }
    }

    fn on_chunk_outcome(
        self: &Arc<Self>,
        key: WorkerKey,
        serial: u64,
        outcome: ChunkOutcome,
    ) -> CoreResult<()> {
        let Ok(c) = self.collaborators() else {
            return Ok(());
        };
        let retired = self.pool().retire(&key, serial).is_some();
        if !retired {
            return Ok(());
        }
        match outcome {
            ChunkOutcome::Finished(chunk) => {
                debug!(task = %chunk.task_id(), chunk = %chunk.id(), worker = serial, "chunk finished");
                c.store.update_chunk(chunk)?;
                self.post_rescan();
                Ok(())
            }
            ChunkOutcome::Failed {
                chunk,
                reason,
                error,
            } => {
                warn!(task = %chunk.task_id(), chunk = %chunk.id(), reason = %reason, error = %error, "chunk worker failed");
                self.fail_task(&c, chunk.task_id(), format!("{}: {}", reason, error), false)
            }
            ChunkOutcome::Interrupted(chunk) => {
                debug!(chunk = %chunk.id(), worker = serial, "chunk worker interrupted");
                Ok(())
            }
        }
    }

    fn on_merge_outcome(
        self: &Arc<Self>,
        task_id: TaskId,
        serial: u64,
        outcome: MergeOutcome,
    ) -> CoreResult<()> {
        let Ok(c) = self.collaborators() else {
            return Ok(());
        };
        let retired = self
            .pool()
            .retire(&WorkerKey::Merge(task_id), serial)
            .is_some();
        if !retired {
            return Ok(());
        }
        let Some(task) = c.store.find_task(task_id)? else {
            return Ok(());
        };
        if task.is_done() {
            return Ok(());
        }
        match outcome {
            MergeOutcome::Finished { length, .. } => {
                let task = c.store.update_task(
                    task.with_length(length)
                        .with_state(TaskState::Finished)
                        .with_message(SUCCESS_MESSAGE),
                )?;
                let report = Self::terminal_report(&c, task);
                Self::discard_files(&c, task_id, None);
                info!(task = %task_id, length, "task finished");
                self.events.dispatch(Event::TaskFinished(report));
                self.post_rescan();
                Ok(())
            }
            MergeOutcome::ChecksumMismatch {
                algorithm,
                expected,
                found,
                ..
            } => {
                let message = format!(
                    "Checksum mismatch ({}): expected {} but found {}",
                    algorithm, expected, found
                );
                warn!(task = %task_id, reason = %message, "task failed");
                let failed = c.store.update_task(
                    task.clone()
                        .with_state(TaskState::Failed)
                        .with_message(message),
                )?;
                let report = Self::terminal_report(&c, failed);
                let delete_output = self
                    .checksum_policy()
                    .should_delete(&task, &algorithm, &expected, &found);
                Self::discard_files(&c, task_id, delete_output.then_some(task.file_path()));
                self.events.dispatch(Event::TaskFailed(report));
                self.post_rescan();
                Ok(())
            }
            MergeOutcome::Failed { reason, error } => {
                self.fail_task(&c, task_id, format!("{}: {}", reason, error), false)
            }
            MergeOutcome::Interrupted => Ok(()),
        }
    }

    /// Stops and joins every worker of the task and marks it FAILED, then
    /// removes its chunks and partial output.
    fn fail_task(
        self: &Arc<Self>,
        c: &Collaborators,
        task_id: TaskId,
        message: String,
        cancelled: bool,
    ) -> CoreResult<()> {
        let Some(task) = c.store.find_task(task_id)? else {
            return Ok(());
        };
        if task.is_done() {
            return Ok(());
        }
        let workers = self.pool().drain_task(task_id);
        stop_all(workers);

        let output = task.file_path().to_string();
        let task = c.store.update_task(
            task.with_state(TaskState::Failed)
                .with_message(message),
        )?;
        let report = Self::terminal_report(c, task);
        Self::discard_files(c, task_id, Some(&output));
        if cancelled {
            info!(task = %task_id, "task cancelled");
            self.events.dispatch(Event::TaskCancelled(report));
        } else {
            warn!(task = %task_id, reason = report.task.message().unwrap_or_default(), "task failed");
            self.events.dispatch(Event::TaskFailed(report));
        }
        self.post_rescan();
        Ok(())
    }

    fn delete_chunks(c: &Collaborators, task_id: TaskId) -> CoreResult<()> {
        for chunk in c.store.chunks_of_task(task_id)? {
            if let Some(file) = chunk.file() {
                if let Err(err) = c.files.delete(file) {
                    warn!(task = %task_id, chunk = %chunk.id(), error = %err, "can't delete chunk file");
                }
            }
        }
        c.store.remove_chunks_of_task(task_id)
    }

    /// Runs after the terminal state is stored, so failures here only leave
    /// files behind.
    fn discard_files(c: &Collaborators, task_id: TaskId, output: Option<&str>) {
        if let Err(err) = Self::delete_chunks(c, task_id) {
            warn!(task = %task_id, error = %err, "can't remove chunks");
        }
        if let Some(path) = output {
            if let Err(err) = c.files.delete(path) {
                warn!(task = %task_id, error = %err, "can't delete output file");
            }
        }
    }
}
