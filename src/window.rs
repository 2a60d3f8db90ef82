use crate::access::AccessQueue;
use crate::change::{Address, ChangeSet, RawChange};
use crate::registry::{NotificationRegistry, SubscriptionKey};
use crate::store::{BoxError, DeltaHandler, Identified, LiveQuery};
use crate::translate::{translate, Slice};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Callback receiving the translated changes of a [`ResultWindow`].
pub type ChangeCallback = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to subscribe to live query: {0}")]
    Subscribe(#[source] BoxError),
}

struct State<T> {
    slice: Slice<T>,
    callback: Option<ChangeCallback>,
    subscription: Option<SubscriptionKey>,
}

/// Ordered, optionally capped view over the result of a live query.
///
/// The window keeps a snapshot of the rows its consumer displays. Once a callback is installed
/// with [`ResultWindow::changed()`], every change of the underlying query is applied to the
/// snapshot and forwarded to the callback as a [`ChangeSet`] whose addresses can be used as is
/// for incremental row updates.
///
/// # Capacity
///
/// A window created with a `max` never holds more than `max` rows. Insertions that arrive while
/// the window is full are dropped, and [`ResultWindow::append()`] only appends if all rows fit.
///
/// # Addressing
///
/// Rows are addressed by `section` and `start + index`. This allows several windows to share
/// one list, see [`ResultWindow::set_addressing()`].
///
/// # Subscription
///
/// A window has at most one subscription at any time. Installing a new callback cancels the
/// previous subscription before opening a new one. [`ResultWindow::clear()`], which also runs
/// when the window is dropped, cancels it for good.
#[allow(clippy::module_name_repetitions)]
pub struct ResultWindow<T> {
    state: Arc<Mutex<State<T>>>,
    query: Arc<dyn LiveQuery<T>>,
    queue: Arc<AccessQueue>,
    registry: Arc<NotificationRegistry>,
}

impl<T> ResultWindow<T>
where
    T: Identified + Clone + Send + 'static,
{
    /// Create a window over `query` which initially displays `items`.
    ///
    /// `items` is truncated to `max` if necessary.
    pub fn new(
        mut items: Vec<T>,
        max: Option<usize>,
        query: Arc<dyn LiveQuery<T>>,
        queue: Arc<AccessQueue>,
        registry: Arc<NotificationRegistry>,
    ) -> Self {
        if let Some(max) = max {
            items.truncate(max);
        }
        Self {
            state: Arc::new(Mutex::new(State {
                slice: Slice::new(items, max),
                callback: None,
                subscription: None,
            })),
            query,
            queue,
            registry,
        }
    }

    /// Append the rows of `other` to this window.
    ///
    /// Either all rows are appended or none: if the window is capped and the rows do not fit,
    /// nothing changes and no addresses are returned. Otherwise returns the addresses of the
    /// appended rows.
    pub fn append(&self, other: &ResultWindow<T>) -> Vec<Address> {
        self.queue.perform(|| {
            let items = other.snapshot();
            let mut state = self.state.lock();
            if !state.slice.has_room_for(items.len()) {
                debug!(
                    "Not appending {} rows, window would exceed {:?}",
                    items.len(),
                    state.slice.max
                );
                return Vec::new();
            }
            let first = state.slice.items.len();
            let addresses = (first..first + items.len())
                .map(|index| state.slice.address(index))
                .collect();
            state.slice.items.extend(items);
            addresses
        })
    }

    /// Change the section and start offset used to address rows.
    pub fn set_addressing(&self, section: usize, start: usize) -> &Self {
        self.queue.perform(|| {
            let mut state = self.state.lock();
            state.slice.section = section;
            state.slice.start = start;
        });
        self
    }

    /// Install `callback` and subscribe to changes of the query.
    ///
    /// Any existing subscription is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns error if the store refused the subscription.
    pub fn changed(
        &self,
        callback: impl Fn(&ChangeSet) + Send + Sync + 'static,
    ) -> Result<&Self, Error> {
        self.queue.perform(|| {
            let previous = {
                let mut state = self.state.lock();
                state.callback = Some(Arc::new(callback));
                state.subscription.take()
            };
            if let Some(key) = previous {
                debug!("Replacing subscription {key:?}");
                self.registry.unregister(key);
            }

            let token = self
                .query
                .observe(self.delta_handler())
                .map_err(Error::Subscribe)?;
            let key = self.registry.register(token);
            self.state.lock().subscription = Some(key);
            Ok(())
        })?;
        Ok(self)
    }

    /// Handler given to the store. It only holds a weak reference to the window state so a
    /// subscription never keeps a window alive.
    fn delta_handler(&self) -> DeltaHandler<T> {
        let state = Arc::downgrade(&self.state);
        let queue = Arc::clone(&self.queue);
        Arc::new(move |raw: &RawChange, results: &[T]| {
            queue.perform(|| {
                let Some(state) = state.upgrade() else {
                    return;
                };
                let (changes, callback) = {
                    let mut state = state.lock();
                    let changes = translate(&mut state.slice, raw, results);
                    (changes, state.callback.clone())
                };
                if changes.is_empty() {
                    return;
                }
                if let Some(callback) = callback {
                    callback(&changes);
                }
            });
        })
    }
}

impl<T> ResultWindow<T> {
    /// Empty the window, cancel its subscription and drop its callback.
    pub fn clear(&self) {
        self.queue.perform(|| {
            let subscription = {
                let mut state = self.state.lock();
                state.slice.items.clear();
                state.callback = None;
                state.subscription.take()
            };
            if let Some(key) = subscription {
                self.registry.unregister(key);
            }
        });
    }

    #[must_use]
    pub fn section(&self) -> usize {
        self.state.lock().slice.section
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.state.lock().slice.start
    }

    #[must_use]
    pub fn max(&self) -> Option<usize> {
        self.state.lock().slice.max
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().slice.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().slice.items.is_empty()
    }

    /// Whether the window currently holds a live subscription.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        let subscription = self.state.lock().subscription;
        subscription.is_some_and(|key| self.registry.contains(key))
    }
}

impl<T: Clone> ResultWindow<T> {
    #[must_use]
    pub fn get(&self, index: usize) -> Option<T> {
        self.state.lock().slice.items.get(index).cloned()
    }

    /// Copy of the rows currently in the window.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.state.lock().slice.items.clone()
    }

    /// Run `f` with a copy of the rows currently in the window. The window is not locked while
    /// `f` runs, so `f` may use it.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        let rows = self.snapshot();
        f(&rows)
    }
}

impl<T> Drop for ResultWindow<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod test {
    use super::{Error, ResultWindow};
    use crate::access::AccessQueue;
    use crate::change::{Address, ChangeSet, RawChange};
    use crate::registry::NotificationRegistry;
    use crate::store::{BoxError, DeltaHandler, LiveQuery, NotificationToken};
    use crate::translate::test::{item, items, Item};
    use parking_lot::Mutex;
    use slotmap::{DefaultKey, SlotMap};
    use std::sync::{Arc, Weak};

    type Handlers = Mutex<SlotMap<DefaultKey, DeltaHandler<Item>>>;

    /// Live query driven by the test.
    #[derive(Default)]
    struct TestQuery {
        handlers: Arc<Handlers>,
    }

    impl TestQuery {
        fn push(&self, raw: &RawChange, results: &[Item]) {
            let handlers = self.handlers.lock().values().cloned().collect::<Vec<_>>();
            for handler in handlers {
                handler(raw, results);
            }
        }

        fn observers(&self) -> usize {
            self.handlers.lock().len()
        }
    }

    struct TestToken {
        handlers: Weak<Handlers>,
        key: DefaultKey,
    }

    impl NotificationToken for TestToken {
        fn stop(&mut self) {
            if let Some(handlers) = self.handlers.upgrade() {
                handlers.lock().remove(self.key);
            }
        }
    }

    impl LiveQuery<Item> for TestQuery {
        fn observe(
            &self,
            handler: DeltaHandler<Item>,
        ) -> Result<Box<dyn NotificationToken>, BoxError> {
            let key = self.handlers.lock().insert(handler);
            Ok(Box::new(TestToken {
                handlers: Arc::downgrade(&self.handlers),
                key,
            }))
        }
    }

    struct FailingQuery;

    impl LiveQuery<Item> for FailingQuery {
        fn observe(&self, _: DeltaHandler<Item>) -> Result<Box<dyn NotificationToken>, BoxError> {
            Err("tracking unavailable".into())
        }
    }

    struct Fixture {
        queue: Arc<AccessQueue>,
        registry: Arc<NotificationRegistry>,
        query: Arc<TestQuery>,
    }

    impl Fixture {
        fn new() -> Self {
            let queue = Arc::new(AccessQueue::new("test"));
            Self {
                registry: Arc::new(NotificationRegistry::new(Arc::clone(&queue))),
                queue,
                query: Arc::new(TestQuery::default()),
            }
        }

        fn window(&self, ids: &[u32], max: Option<usize>) -> ResultWindow<Item> {
            ResultWindow::new(
                items(ids),
                max,
                Arc::clone(&self.query) as Arc<dyn LiveQuery<Item>>,
                Arc::clone(&self.queue),
                Arc::clone(&self.registry),
            )
        }
    }

    fn recorder() -> (
        Arc<Mutex<Vec<ChangeSet>>>,
        impl Fn(&ChangeSet) + Send + Sync + 'static,
    ) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let cloned = Arc::clone(&received);
        (received, move |changes: &ChangeSet| {
            cloned.lock().push(changes.clone());
        })
    }

    fn ids(window: &ResultWindow<Item>) -> Vec<u32> {
        window.with_snapshot(|rows| rows.iter().map(|row| row.id).collect())
    }

    #[test]
    fn delivers_translated_changes() {
        let fixture = Fixture::new();
        let window = fixture.window(&[1, 2, 3], None);
        let (received, callback) = recorder();
        window.set_addressing(1, 0).changed(callback).unwrap();

        fixture.query.push(
            &RawChange {
                deletions: vec![1],
                ..RawChange::default()
            },
            &items(&[1, 3]),
        );

        assert_eq!(ids(&window), vec![1, 3]);
        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].section, 1);
        assert_eq!(received[0].deletions, vec![Address::new(1, 1)]);
    }

    #[test]
    fn empty_changes_are_not_delivered() {
        let fixture = Fixture::new();
        let window = fixture.window(&[1, 2], Some(2));
        let (received, callback) = recorder();
        window.changed(callback).unwrap();

        fixture.query.push(&RawChange::default(), &items(&[1, 2]));
        // Insertion dropped because the window is full.
        fixture.query.push(
            &RawChange {
                insertions: vec![0],
                ..RawChange::default()
            },
            &items(&[3, 1, 2]),
        );

        assert_eq!(ids(&window), vec![1, 2]);
        assert!(received.lock().is_empty());
    }

    #[test]
    fn changed_twice_keeps_single_subscription() {
        let fixture = Fixture::new();
        let window = fixture.window(&[], None);
        let (first, first_callback) = recorder();
        let (second, second_callback) = recorder();

        window.changed(first_callback).unwrap();
        window.changed(second_callback).unwrap();

        assert_eq!(fixture.query.observers(), 1);
        assert_eq!(fixture.registry.len(), 1);
        assert!(window.is_subscribed());

        fixture.query.push(
            &RawChange {
                insertions: vec![0],
                ..RawChange::default()
            },
            &items(&[1]),
        );

        assert!(first.lock().is_empty());
        assert_eq!(second.lock().len(), 1);
        assert_eq!(ids(&window), vec![1]);
    }

    #[test]
    fn clear_cancels_subscription() {
        let fixture = Fixture::new();
        let window = fixture.window(&[1, 2], None);
        let (received, callback) = recorder();
        window.changed(callback).unwrap();

        window.clear();
        window.clear();

        assert!(window.is_empty());
        assert!(!window.is_subscribed());
        assert_eq!(fixture.query.observers(), 0);
        assert!(fixture.registry.is_empty());

        fixture.query.push(
            &RawChange {
                insertions: vec![0],
                ..RawChange::default()
            },
            &items(&[3]),
        );
        assert!(received.lock().is_empty());
    }

    #[test]
    fn drop_cancels_subscription() {
        let fixture = Fixture::new();
        {
            let window = fixture.window(&[1], None);
            window.changed(|_| {}).unwrap();
            assert_eq!(fixture.registry.len(), 1);
        }
        assert!(fixture.registry.is_empty());
        assert_eq!(fixture.query.observers(), 0);
    }

    #[test]
    fn unregister_all_stops_delivery() {
        let fixture = Fixture::new();
        let window = fixture.window(&[], None);
        let (received, callback) = recorder();
        window.changed(callback).unwrap();

        fixture.registry.unregister_all();
        assert!(!window.is_subscribed());

        fixture.query.push(
            &RawChange {
                insertions: vec![0],
                ..RawChange::default()
            },
            &items(&[1]),
        );
        assert!(received.lock().is_empty());
        // Clearing after the registry was drained is harmless.
        window.clear();
    }

    #[test]
    fn append_is_all_or_nothing() {
        let fixture = Fixture::new();
        let window = fixture.window(&[1, 2], Some(3));
        window.set_addressing(2, 5);

        let addresses = window.append(&fixture.window(&[3], None));
        assert_eq!(addresses, vec![Address::new(2, 7)]);
        assert_eq!(ids(&window), vec![1, 2, 3]);

        let addresses = window.append(&fixture.window(&[4], None));
        assert!(addresses.is_empty());
        assert_eq!(ids(&window), vec![1, 2, 3]);
    }

    #[test]
    fn append_rejects_partial_fit() {
        let fixture = Fixture::new();
        let window = fixture.window(&[1], Some(2));

        let addresses = window.append(&fixture.window(&[2, 3], None));
        assert!(addresses.is_empty());
        assert_eq!(ids(&window), vec![1]);
    }

    #[test]
    fn append_unbounded() {
        let fixture = Fixture::new();
        let window = fixture.window(&[1], None);

        let addresses = window.append(&fixture.window(&[2, 3], None));
        assert_eq!(addresses, vec![Address::new(0, 1), Address::new(0, 2)]);
        assert_eq!(ids(&window), vec![1, 2, 3]);
    }

    #[test]
    fn initial_rows_are_capped() {
        let fixture = Fixture::new();
        let window = fixture.window(&[1, 2, 3, 4], Some(2));
        assert_eq!(ids(&window), vec![1, 2]);
        assert_eq!(window.max(), Some(2));
    }

    #[test]
    fn set_addressing_keeps_rows_and_subscription() {
        let fixture = Fixture::new();
        let window = fixture.window(&[1, 2], None);
        window.changed(|_| {}).unwrap();

        window.set_addressing(4, 10);

        assert_eq!(window.section(), 4);
        assert_eq!(window.start(), 10);
        assert_eq!(ids(&window), vec![1, 2]);
        assert!(window.is_subscribed());
    }

    #[test]
    fn callback_runs_inside_queue() {
        let fixture = Fixture::new();
        let window = fixture.window(&[], None);
        let queue = Arc::clone(&fixture.queue);
        let registry = Arc::clone(&fixture.registry);
        let (received, record) = recorder();
        window
            .changed(move |changes| {
                assert!(queue.is_current());
                // Re-entering the queue from a callback must not block.
                assert_eq!(queue.perform(|| registry.len()), 1);
                record(changes);
            })
            .unwrap();

        fixture.query.push(
            &RawChange {
                insertions: vec![0],
                ..RawChange::default()
            },
            &[item(9)],
        );
        assert_eq!(received.lock().len(), 1);
    }

    #[test]
    fn failed_subscription_is_reported() {
        let queue = Arc::new(AccessQueue::new("test"));
        let registry = Arc::new(NotificationRegistry::new(Arc::clone(&queue)));
        let window = ResultWindow::new(
            items(&[1]),
            None,
            Arc::new(FailingQuery) as Arc<dyn LiveQuery<Item>>,
            queue,
            Arc::clone(&registry),
        );

        let result = window.changed(|_| {});
        assert!(matches!(result, Err(Error::Subscribe(_))));
        assert!(!window.is_subscribed());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_closure_can_use_the_window() {
        let fixture = Fixture::new();
        let window = fixture.window(&[1, 2], None);
        let (len, first) = window.with_snapshot(|rows| {
            assert_eq!(rows.len(), window.len());
            (window.len(), window.get(0))
        });
        assert_eq!(len, 2);
        assert_eq!(first, Some(item(1)));
    }
}
