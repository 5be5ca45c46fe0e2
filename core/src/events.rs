use std::sync::{Arc, Mutex, MutexGuard};

use crate::report::TaskReport;
use crate::task::Task;

/// Lifecycle hooks. Every method defaults to a no-op so listeners only
/// implement what they care about.
pub trait EventListener: Send + Sync {
    fn on_task_added(&self, _task: &Task) {}
    fn on_task_updated(&self, _report: &TaskReport) {}
    fn on_task_cancelled(&self, _report: &TaskReport) {}
    fn on_task_finished(&self, _report: &TaskReport) {}
    fn on_task_failed(&self, _report: &TaskReport) {}
    fn on_resumed(&self) {}
    fn on_paused(&self) {}
}

pub trait Executor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs callbacks on whichever thread emits the event.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone)]
pub(crate) enum Event {
    TaskAdded(Task),
    TaskUpdated(TaskReport),
    TaskCancelled(TaskReport),
    TaskFinished(TaskReport),
    TaskFailed(TaskReport),
    Resumed,
    Paused,
}

impl Event {
    fn deliver(&self, listener: &dyn EventListener) {
        match self {
            Event::TaskAdded(task) => listener.on_task_added(task),
            Event::TaskUpdated(report) => listener.on_task_updated(report),
            Event::TaskCancelled(report) => listener.on_task_cancelled(report),
            Event::TaskFinished(report) => listener.on_task_finished(report),
            Event::TaskFailed(report) => listener.on_task_failed(report),
            Event::Resumed => listener.on_resumed(),
            Event::Paused => listener.on_paused(),
        }
    }
}

struct Registration {
    id: ListenerId,
    executor: Arc<dyn Executor>,
    listener: Arc<dyn EventListener>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Registration>,
}

/// Registry of (executor, listener) pairs. Listeners stay registered until
/// explicitly removed.
#[derive(Default)]
pub struct EventDispatcher {
    registry: Mutex<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(
        &self,
        executor: Arc<dyn Executor>,
        listener: Arc<dyn EventListener>,
    ) -> ListenerId {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry.entries.push(Registration {
            id,
            executor,
            listener,
        });
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut registry = self.registry();
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != id);
        registry.entries.len() != before
    }

    pub fn clear(&self) {
        self.registry().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.registry().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn dispatch(&self, event: Event) {
        // Snapshot first so a listener may (un)register from its callback.
        let targets: Vec<(Arc<dyn Executor>, Arc<dyn EventListener>)> = self
            .registry()
            .entries
            .iter()
            .map(|entry| (Arc::clone(&entry.executor), Arc::clone(&entry.listener)))
            .collect();
        for (executor, listener) in targets {
            let event = event.clone();
            executor.execute(Box::new(move || event.deliver(listener.as_ref())));
        }
    }
}
