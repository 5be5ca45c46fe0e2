//! A single serialized execution context.
//!
//! Jobs are queued FIFO and drained one at a time by one dedicated thread,
//! which is spawned lazily on the first submission and torn down by
//! [`Moderator::interrupt`]. Anything that must never race (worker-pool
//! membership, task state transitions) is mutated only from inside a job.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{error, warn};

use crate::error::{CoreError, CoreResult};
use crate::events::Executor;

type Job = Box<dyn FnOnce(&CancelToken) -> CoreResult<()> + Send + 'static>;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Runner {
    sender: Sender<Job>,
    token: CancelToken,
    thread_id: ThreadId,
    handle: JoinHandle<()>,
}

pub struct Moderator {
    name: String,
    runner: Mutex<Option<Runner>>,
}

impl Moderator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runner: Mutex::new(None),
        }
    }

    fn runner(&self) -> MutexGuard<'_, Option<Runner>> {
        self.runner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce(&CancelToken) -> CoreResult<()> + Send + 'static,
    {
        let mut job: Job = Box::new(job);
        let mut runner = self.runner();
        if let Some(active) = runner.as_ref() {
            match active.sender.send(job) {
                Ok(()) => return,
                // The thread died; start a fresh one below.
                Err(mpsc::SendError(returned)) => job = returned,
            }
        }
        match self.spawn_runner() {
            Ok(fresh) => {
                if fresh.sender.send(job).is_err() {
                    error!(moderator = %self.name, "moderator thread exited before first job");
                }
                *runner = Some(fresh);
            }
            Err(err) => error!(moderator = %self.name, error = %err, "can't start moderator thread"),
        }
    }

    /// Runs `job` on the moderator and waits for its result. Called from the
    /// moderator thread itself the job runs inline.
    pub fn run_blocking<F, T>(&self, job: F) -> CoreResult<T>
    where
        F: FnOnce(&CancelToken) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if let Some(token) = self.current_token() {
            return job(&token);
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(move |token| {
            let _ = tx.send(job(token));
            Ok(())
        });
        rx.recv().map_err(|_| CoreError::Interrupted)?
    }

    /// Discards queued jobs, flags the running one and waits for the thread
    /// to exit. A no-op when no thread is alive.
    pub fn interrupt(&self) {
        let Some(runner) = self.runner().take() else {
            return;
        };
        runner.token.cancel();
        drop(runner.sender);
        if runner.thread_id != thread::current().id() {
            if runner.handle.join().is_err() {
                error!(moderator = %self.name, "moderator thread panicked");
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.runner().is_some()
    }

    pub fn is_current_thread(&self) -> bool {
        self.current_token().is_some()
    }

    fn current_token(&self) -> Option<CancelToken> {
        let runner = self.runner();
        runner
            .as_ref()
            .filter(|runner| runner.thread_id == thread::current().id())
            .map(|runner| runner.token.clone())
    }

    fn spawn_runner(&self) -> CoreResult<Runner> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let token = CancelToken::new();
        let name = self.name.clone();
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || drain(&name, receiver, thread_token))
            .map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(Runner {
            sender,
            token,
            thread_id: handle.thread().id(),
            handle,
        })
    }
}

fn drain(name: &str, receiver: Receiver<Job>, token: CancelToken) {
    while let Ok(job) = receiver.recv() {
        if token.is_cancelled() {
            break;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| job(&token))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(moderator = %name, error = %err, "moderator job failed"),
            Err(_) => error!(moderator = %name, "moderator job panicked"),
        }
    }
}

impl Executor for Moderator {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        self.submit(move |_| {
            job();
            Ok(())
        });
    }
}

impl Drop for Moderator {
    fn drop(&mut self) {
        self.interrupt();
    }
}
