use parking_lot::ReentrantMutex;

/// Serial execution context shared by everything that touches one database.
///
/// All reads, writes, snapshot mutations and subscription changes for a database go through
/// [`AccessQueue::perform()`]. Only one thread can be inside the queue at a time; other callers
/// block until it is free.
///
/// # Re-entrancy
///
/// A thread that is already inside the queue runs nested [`AccessQueue::perform()`] calls
/// immediately. This is what allows change callbacks, which are delivered from inside the queue,
/// to query the database or clear a window without deadlocking.
#[allow(clippy::module_name_repetitions)]
pub struct AccessQueue {
    label: String,
    lock: ReentrantMutex<()>,
}

impl AccessQueue {
    /// Create a new queue. `label` is only used for diagnostics.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            lock: ReentrantMutex::new(()),
        }
    }

    /// Run `execution` inside the queue and return its result.
    pub fn perform<R>(&self, execution: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        execution()
    }

    /// Whether the calling thread is currently inside this queue.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.lock.is_owned_by_current_thread()
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for AccessQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessQueue")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
