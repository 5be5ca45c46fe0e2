use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::chunk::{split_range, Chunk, ChunkRange};
use crate::error::{CoreError, CoreResult};
use crate::files::FileStore;
use crate::moderator::CancelToken;
use crate::net::NetClient;
use crate::speed::SpeedMeter;
use crate::storage::TaskStore;
use crate::task::Task;

#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    Finished(Chunk),
    Failed {
        chunk: Chunk,
        reason: String,
        error: CoreError,
    },
    Interrupted(Chunk),
}

pub struct ChunkJob {
    pub task: Task,
    pub chunk: Chunk,
    pub net: Arc<dyn NetClient>,
    pub files: Arc<dyn FileStore>,
    pub speed: Arc<SpeedMeter>,
    pub buffer_size: usize,
}

/// Shared between the download loop and the scheduler. `position` is the next
/// absolute byte to write; `reserved_end` is the last byte of a read that is
/// in progress. Nothing at or below `reserved_end` may be given away.
#[derive(Debug)]
struct Cursor {
    chunk: Chunk,
    position: u64,
    reserved_end: Option<u64>,
    done: bool,
}

impl Cursor {
    fn first_free(&self) -> u64 {
        match self.reserved_end {
            Some(end) => self.position.max(end + 1),
            None => self.position,
        }
    }
}

enum RunEnd {
    Finished,
    Interrupted,
}

pub struct ChunkWorker {
    serial: u64,
    cursor: Arc<Mutex<Cursor>>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl ChunkWorker {
    /// Starts downloading on a new thread. `on_done` runs on that thread once
    /// the worker stops.
    pub fn spawn<F>(serial: u64, job: ChunkJob, on_done: F) -> CoreResult<Self>
    where
        F: FnOnce(ChunkOutcome) + Send + 'static,
    {
        let position = match (job.chunk.range(), job.chunk.file()) {
            (Some(range), Some(file)) => range.begin() + job.files.size(file),
            _ => 0,
        };
        let cursor = Arc::new(Mutex::new(Cursor {
            chunk: job.chunk.clone(),
            position,
            reserved_end: None,
            done: false,
        }));
        let cancel = CancelToken::new();

        let thread_cursor = Arc::clone(&cursor);
        let thread_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("chunk-worker-{}", serial))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    download(&job, &thread_cursor, &thread_cancel)
                }))
                .unwrap_or_else(|_| Err(CoreError::InvalidState("chunk worker panicked".to_string())));
                let chunk = {
                    let mut cursor = lock(&thread_cursor);
                    cursor.done = true;
                    cursor.chunk.clone()
                };
                let outcome = match result {
                    Ok(RunEnd::Finished) => ChunkOutcome::Finished(chunk.finished()),
                    Ok(RunEnd::Interrupted) => ChunkOutcome::Interrupted(chunk),
                    Err(error) => ChunkOutcome::Failed {
                        reason: format!("Failed to download {}", chunk.id()),
                        chunk,
                        error,
                    },
                };
                on_done(outcome);
            })
            .map_err(|err| CoreError::Io(err.to_string()))?;

        Ok(Self {
            serial,
            cursor,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn chunk(&self) -> Chunk {
        lock(&self.cursor).chunk.clone()
    }

    pub fn remaining_bytes(&self) -> u64 {
        let cursor = lock(&self.cursor);
        match cursor.chunk.range() {
            Some(range) if !cursor.done => (range.end() + 1).saturating_sub(cursor.first_free()),
            _ => 0,
        }
    }

    /// Gives away the unclaimed upper half of the remaining range as a new
    /// stored chunk. Returns `None` when the worker is done, unranged, or the
    /// freed tail would fall below `min_chunk_size`.
    pub fn split(
        &self,
        task: &Task,
        min_chunk_size: u64,
        store: &dyn TaskStore,
        files: &dyn FileStore,
    ) -> CoreResult<Option<Chunk>> {
        let mut cursor = lock(&self.cursor);
        if cursor.done {
            return Ok(None);
        }
        let Some(range) = cursor.chunk.range() else {
            return Ok(None);
        };
        let Some((head, tail)) = split_range(range, cursor.first_free(), min_chunk_size) else {
            return Ok(None);
        };

        // Head before tail: a failed rollback leaves a gap, never an overlap.
        let shrunk = store.update_chunk(cursor.chunk.clone().with_range(head))?;
        let created = match add_tail(task, tail, store, files) {
            Ok(created) => created,
            Err(err) => {
                if let Err(undo) = store.update_chunk(cursor.chunk.clone()) {
                    warn!(chunk = %shrunk.id(), error = %undo, "can't restore chunk after failed split");
                }
                return Err(err);
            }
        };
        debug!(
            task = %task.id(),
            chunk = %shrunk.id(),
            head = %head,
            tail = %tail,
            "split chunk"
        );
        cursor.chunk = shrunk;
        Ok(Some(created))
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

fn add_tail(
    task: &Task,
    tail: ChunkRange,
    store: &dyn TaskStore,
    files: &dyn FileStore,
) -> CoreResult<Chunk> {
    let created = store.insert_chunk(Chunk::new(task.id(), Some(tail)))?;
    let file = files.chunk_file(task, created.id());
    match store.update_chunk(created.clone().with_file(file)) {
        Ok(created) => Ok(created),
        Err(err) => {
            if let Err(undo) = store.remove_chunk(created.id()) {
                warn!(chunk = %created.id(), error = %undo, "can't remove orphaned split chunk");
            }
            Err(err)
        }
    }
}

fn lock(cursor: &Mutex<Cursor>) -> MutexGuard<'_, Cursor> {
    cursor
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn download(job: &ChunkJob, cursor: &Mutex<Cursor>, cancel: &CancelToken) -> CoreResult<RunEnd> {
    let file = job
        .chunk
        .file()
        .ok_or_else(|| CoreError::InvalidState(format!("{} has no backing file", job.chunk.id())))?;
    match job.chunk.range() {
        Some(range) => download_range(job, file, range, cursor, cancel),
        None => download_stream(job, file, cancel),
    }
}

fn download_range(
    job: &ChunkJob,
    file: &str,
    range: ChunkRange,
    cursor: &Mutex<Cursor>,
    cancel: &CancelToken,
) -> CoreResult<RunEnd> {
    let existing = job.files.size(file);
    if existing > range.len() {
        return Err(CoreError::ChunkSizeMismatch {
            chunk: job.chunk.id(),
            expected: range.len(),
            found: existing,
        });
    }
    let start = range.begin() + existing;
    if start > range.end() {
        return Ok(RunEnd::Finished);
    }
    if cancel.is_cancelled() {
        return Ok(RunEnd::Interrupted);
    }

    debug!(task = %job.task.id(), chunk = %job.chunk.id(), offset = start, "chunk worker started");
    let mut stream = job.net.open(&job.task, Some(start))?;
    let mut out = job.files.open_write(file, true)?;
    let mut buffer = vec![0u8; job.buffer_size.max(1)];

    loop {
        if cancel.is_cancelled() {
            out.flush().map_err(|err| CoreError::Io(err.to_string()))?;
            return Ok(RunEnd::Interrupted);
        }
        let (position, want) = {
            let mut cursor = lock(cursor);
            let end = cursor.chunk.range().map(|range| range.end()).unwrap_or(range.end());
            if cursor.position > end {
                cursor.done = true;
                break;
            }
            let want = (end - cursor.position + 1).min(buffer.len() as u64) as usize;
            cursor.reserved_end = Some(cursor.position + want as u64 - 1);
            (cursor.position, want)
        };

        let read = stream
            .read(&mut buffer[..want])
            .map_err(|err| CoreError::Network(err.to_string()))?;
        if read == 0 {
            return Err(CoreError::Network(format!(
                "connection closed at byte {} before end of {}",
                position,
                job.chunk.id()
            )));
        }
        out.write_all(&buffer[..read])
            .map_err(|err| CoreError::Io(err.to_string()))?;

        {
            let mut cursor = lock(cursor);
            cursor.position += read as u64;
            cursor.reserved_end = None;
        }
        job.speed.record(read as u64);
    }

    out.flush().map_err(|err| CoreError::Io(err.to_string()))?;
    Ok(RunEnd::Finished)
}

fn download_stream(job: &ChunkJob, file: &str, cancel: &CancelToken) -> CoreResult<RunEnd> {
    debug!(task = %job.task.id(), chunk = %job.chunk.id(), "unranged chunk worker started");
    let mut stream = job.net.open(&job.task, None)?;
    let mut out = job.files.open_write(file, false)?;
    let mut buffer = vec![0u8; job.buffer_size.max(1)];
    loop {
        if cancel.is_cancelled() {
            return Ok(RunEnd::Interrupted);
        }
        let read = stream
            .read(&mut buffer)
            .map_err(|err| CoreError::Network(err.to_string()))?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])
            .map_err(|err| CoreError::Io(err.to_string()))?;
        job.speed.record(read as u64);
    }
    out.flush().map_err(|err| CoreError::Io(err.to_string()))?;
    Ok(RunEnd::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkId;
    use crate::files::LocalFileStore;
    use crate::net::ContentDescription;
    use crate::storage::MemoryStorage;
    use crate::task::TaskId;
    use std::io::Cursor as IoCursor;
    use std::sync::mpsc;
    use std::time::Duration;

    struct SlowReader {
        inner: IoCursor<Vec<u8>>,
        delay: Duration,
    }

    impl Read for SlowReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            thread::sleep(self.delay);
            let limit = buf.len().min(1024);
            self.inner.read(&mut buf[..limit])
        }
    }

    struct BytesNet {
        body: Vec<u8>,
        delay: Duration,
    }

    impl NetClient for BytesNet {
        fn probe(&self, _task: &Task) -> ContentDescription {
            ContentDescription {
                length: Some(self.body.len() as u64),
                accept_ranges: true,
            }
        }

        fn open(&self, _task: &Task, offset: Option<u64>) -> CoreResult<Box<dyn Read + Send>> {
            let start = offset.unwrap_or(0) as usize;
            Ok(Box::new(SlowReader {
                inner: IoCursor::new(self.body[start..].to_vec()),
                delay: self.delay,
            }))
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 251) as u8).collect()
    }

    fn setup(
        len: usize,
        delay: Duration,
    ) -> (tempfile::TempDir, Task, Arc<MemoryStorage>, Arc<LocalFileStore>, Arc<BytesNet>) {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let store = Arc::new(MemoryStorage::new());
        let task = store
            .insert_task(
                Task::builder("https://example.com/out.bin", dest.to_str().unwrap())
                    .length(len as u64)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let files = Arc::new(LocalFileStore::with_chunk_dir(dir.path()));
        let net = Arc::new(BytesNet {
            body: body(len),
            delay,
        });
        (dir, task, store, files, net)
    }

    fn stored_chunk(task: &Task, range: ChunkRange, store: &MemoryStorage, files: &LocalFileStore) -> Chunk {
        let chunk = store.insert_chunk(Chunk::new(task.id(), Some(range))).unwrap();
        let file = files.chunk_file(task, chunk.id());
        store.update_chunk(chunk.with_file(file)).unwrap()
    }

    fn job(task: &Task, chunk: Chunk, files: &Arc<LocalFileStore>, net: &Arc<BytesNet>) -> ChunkJob {
        ChunkJob {
            task: task.clone(),
            chunk,
            net: net.clone(),
            files: files.clone(),
            speed: Arc::new(SpeedMeter::new()),
            buffer_size: 4096,
        }
    }

    fn read_file(path: &str) -> Vec<u8> {
        std::fs::read(path).unwrap()
    }

    #[test]
    fn downloads_its_range() {
        let (_dir, task, store, files, net) = setup(10_000, Duration::ZERO);
        let chunk = stored_chunk(&task, ChunkRange::new(2_000, 5_999).unwrap(), &store, &files);
        let (tx, rx) = mpsc::channel();
        let mut worker = ChunkWorker::spawn(1, job(&task, chunk, &files, &net), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
        worker.join();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            ChunkOutcome::Finished(chunk) => {
                assert!(chunk.is_finished());
                assert_eq!(read_file(chunk.file().unwrap()), body(10_000)[2_000..6_000].to_vec());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn resumes_after_existing_bytes() {
        let (_dir, task, store, files, net) = setup(8_000, Duration::ZERO);
        let chunk = stored_chunk(&task, ChunkRange::new(0, 7_999).unwrap(), &store, &files);
        files
            .open_write(chunk.file().unwrap(), false)
            .unwrap()
            .write_all(&body(8_000)[..3_000])
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let mut worker = ChunkWorker::spawn(1, job(&task, chunk.clone(), &files, &net), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
        worker.join();
        assert!(matches!(rx.recv().unwrap(), ChunkOutcome::Finished(_)));
        assert_eq!(read_file(chunk.file().unwrap()), body(8_000));
    }

    #[test]
    fn oversized_chunk_file_is_an_error() {
        let (_dir, task, store, files, net) = setup(1_000, Duration::ZERO);
        let chunk = stored_chunk(&task, ChunkRange::new(0, 99).unwrap(), &store, &files);
        files
            .open_write(chunk.file().unwrap(), false)
            .unwrap()
            .write_all(&[0u8; 200])
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let mut worker = ChunkWorker::spawn(1, job(&task, chunk, &files, &net), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
        worker.join();
        match rx.recv().unwrap() {
            ChunkOutcome::Failed { error, .. } => {
                assert!(matches!(error, CoreError::ChunkSizeMismatch { found: 200, .. }))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn live_split_partitions_the_range() {
        let len = 400_000usize;
        let (_dir, task, store, files, net) = setup(len, Duration::from_millis(1));
        let chunk = stored_chunk(&task, ChunkRange::new(0, len as u64 - 1).unwrap(), &store, &files);
        let (tx, rx) = mpsc::channel();
        let mut worker = ChunkWorker::spawn(1, job(&task, chunk, &files, &net), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));

        let before = worker.remaining_bytes();
        let tail = worker
            .split(&task, 1_000, store.as_ref(), files.as_ref())
            .unwrap()
            .expect("tail chunk");
        let head = worker.chunk().range().unwrap();
        let tail_range = tail.range().unwrap();
        assert_eq!(head.begin(), 0);
        assert_eq!(head.end() + 1, tail_range.begin());
        assert_eq!(tail_range.end(), len as u64 - 1);
        assert!(worker.remaining_bytes() < before);
        assert_eq!(store.chunks_of_task(task.id()).unwrap().len(), 2);

        worker.join();
        let finished = match rx.recv().unwrap() {
            ChunkOutcome::Finished(chunk) => chunk,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(finished.range(), Some(head));
        assert_eq!(
            read_file(finished.file().unwrap()),
            body(len)[..head.len() as usize].to_vec()
        );
        assert!(worker.split(&task, 1, store.as_ref(), files.as_ref()).unwrap().is_none());
    }

    /// Store that refuses new chunk records.
    struct RefusingInserts(Arc<MemoryStorage>);

    impl TaskStore for RefusingInserts {
        fn insert_task(&self, task: Task) -> CoreResult<Task> {
            self.0.insert_task(task)
        }
        fn update_task(&self, task: Task) -> CoreResult<Task> {
            self.0.update_task(task)
        }
        fn remove_task(&self, id: TaskId) -> CoreResult<()> {
            self.0.remove_task(id)
        }
        fn find_task(&self, id: TaskId) -> CoreResult<Option<Task>> {
            self.0.find_task(id)
        }
        fn list_tasks(&self) -> CoreResult<Vec<Task>> {
            self.0.list_tasks()
        }
        fn insert_chunk(&self, _chunk: Chunk) -> CoreResult<Chunk> {
            Err(CoreError::Storage("disk full".to_string()))
        }
        fn update_chunk(&self, chunk: Chunk) -> CoreResult<Chunk> {
            self.0.update_chunk(chunk)
        }
        fn remove_chunk(&self, id: ChunkId) -> CoreResult<()> {
            self.0.remove_chunk(id)
        }
        fn find_chunk(&self, id: ChunkId) -> CoreResult<Option<Chunk>> {
            self.0.find_chunk(id)
        }
        fn chunks_of_task(&self, task_id: TaskId) -> CoreResult<Vec<Chunk>> {
            self.0.chunks_of_task(task_id)
        }
        fn remove_chunks_of_task(&self, task_id: TaskId) -> CoreResult<()> {
            self.0.remove_chunks_of_task(task_id)
        }
        fn unfinished_tasks(&self) -> CoreResult<Vec<Task>> {
            self.0.unfinished_tasks()
        }
        fn finished_tasks(&self) -> CoreResult<Vec<Task>> {
            self.0.finished_tasks()
        }
        fn clean_up_finished_tasks(&self) -> CoreResult<()> {
            self.0.clean_up_finished_tasks()
        }
    }

    #[test]
    fn failed_split_keeps_the_whole_range() {
        let len = 400_000usize;
        let full = ChunkRange::new(0, len as u64 - 1).unwrap();
        let (_dir, task, store, files, net) = setup(len, Duration::from_millis(1));
        let chunk = stored_chunk(&task, full, &store, &files);
        let (tx, rx) = mpsc::channel();
        let mut worker = ChunkWorker::spawn(1, job(&task, chunk, &files, &net), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));

        let refusing = RefusingInserts(Arc::clone(&store));
        let result = worker.split(&task, 1_000, &refusing, files.as_ref());
        assert!(matches!(result, Err(CoreError::Storage(_))));
        let stored = store.chunks_of_task(task.id()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].range(), Some(full));
        assert_eq!(worker.chunk().range(), Some(full));

        worker.interrupt();
        worker.join();
        assert!(matches!(rx.recv().unwrap(), ChunkOutcome::Interrupted(_)));
    }

    #[test]
    fn interrupt_stops_the_worker() {
        let (_dir, task, store, files, net) = setup(1_000_000, Duration::from_millis(5));
        let chunk = stored_chunk(&task, ChunkRange::new(0, 999_999).unwrap(), &store, &files);
        let (tx, rx) = mpsc::channel();
        let mut worker = ChunkWorker::spawn(1, job(&task, chunk, &files, &net), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        worker.interrupt();
        worker.join();
        assert!(matches!(rx.recv().unwrap(), ChunkOutcome::Interrupted(_)));
        assert_eq!(worker.remaining_bytes(), 0);
    }
}
