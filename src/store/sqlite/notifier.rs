use super::tracking::WatchedTables;
use super::{Database, Error};
use crate::store::NotificationToken;
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

new_key_type! {
    /// Handle for a live query subscription of a [`Database`].
    pub(crate) struct LiveKey;
}

/// Deferred invocation of a subscription handler.
pub(crate) type Delivery = Box<dyn FnOnce() + Send>;

/// Re-evaluates a live query and returns the delivery for its changes, if any.
pub(crate) type Evaluate = Box<dyn FnMut(&Database) -> Result<Option<Delivery>, Error> + Send>;

struct Subscription {
    table: &'static str,
    evaluate: Evaluate,
}

struct State {
    tables: WatchedTables,
    subscriptions: SlotMap<LiveKey, Subscription>,
}

/// Keeps track of the live queries of a database and the tables they observe.
pub(crate) struct Notifier {
    state: Mutex<State>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tables: WatchedTables::new(),
                subscriptions: SlotMap::with_capacity_and_key(4),
            }),
        }
    }

    pub(crate) fn add(&self, table: &'static str, evaluate: Evaluate) -> LiveKey {
        let mut state = self.state.lock();
        state.tables.track(table);
        let key = state.subscriptions.insert(Subscription { table, evaluate });
        debug!("Observing table {table} with {key:?}");
        key
    }

    pub(crate) fn remove(&self, key: LiveKey) {
        let mut state = self.state.lock();
        if let Some(subscription) = state.subscriptions.remove(key) {
            state.tables.untrack(subscription.table);
            debug!("Stopped observing table {} with {key:?}", subscription.table);
        }
    }

    pub(crate) fn with_tables<R>(&self, f: impl FnOnce(&WatchedTables) -> R) -> R {
        f(&self.state.lock().tables)
    }

    /// Re-evaluate every live query observing one of the tables in `table_ids` and return the
    /// resulting deliveries.
    ///
    /// A query that fails to evaluate is logged and skipped, it will be evaluated again on the
    /// next change of its table.
    pub(crate) fn evaluate(&self, database: &Database, table_ids: &[usize]) -> Vec<Delivery> {
        let mut state = self.state.lock();
        let State {
            tables,
            subscriptions,
        } = &mut *state;

        let changed = table_ids
            .iter()
            .filter_map(|id| tables.name(*id))
            .collect::<BTreeSet<_>>();
        debug!("Changes detected on tables: {:?}", changed);

        let mut deliveries = Vec::new();
        for (key, subscription) in subscriptions.iter_mut() {
            if !changed.contains(subscription.table) {
                continue;
            }
            match (subscription.evaluate)(database) {
                Ok(Some(delivery)) => deliveries.push(delivery),
                Ok(None) => {}
                Err(e) => error!("Failed to evaluate live query {key:?}: {e}"),
            }
        }
        deliveries
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().subscriptions.len()
    }
}

/// [`NotificationToken`] of a live query on a [`Database`].
pub(crate) struct LiveToken {
    notifier: Weak<Notifier>,
    key: LiveKey,
    active: Arc<AtomicBool>,
}

impl LiveToken {
    pub(crate) fn new(notifier: &Arc<Notifier>, key: LiveKey, active: Arc<AtomicBool>) -> Self {
        Self {
            notifier: Arc::downgrade(notifier),
            key,
            active,
        }
    }
}

impl NotificationToken for LiveToken {
    fn stop(&mut self) {
        // Deliveries computed before this point check the flag before running.
        self.active.store(false, Ordering::Release);
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.remove(self.key);
        }
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.stop();
    }
}
