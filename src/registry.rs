use crate::access::AccessQueue;
use crate::store::NotificationToken;
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::sync::Arc;
use tracing::debug;

new_key_type! {
    /// Handle for a subscription tracked by a [`NotificationRegistry`].
    pub struct SubscriptionKey;
}

/// Owns every live query subscription of a database.
///
/// Tokens handed to [`NotificationRegistry::register()`] are owned by the registry until they
/// are removed with [`NotificationRegistry::unregister()`] or
/// [`NotificationRegistry::unregister_all()`], which also stops them. A token can therefore only
/// be tracked once.
///
/// Keys are generational: unregistering a key that was already removed, including keys that
/// were drained by [`NotificationRegistry::unregister_all()`], is a no-op.
///
/// All bookkeeping and token cancellation happens inside the database's [`AccessQueue`], so a
/// token is never stopped while a change is being delivered.
#[allow(clippy::module_name_repetitions)]
pub struct NotificationRegistry {
    queue: Arc<AccessQueue>,
    tokens: Mutex<SlotMap<SubscriptionKey, Box<dyn NotificationToken>>>,
}

impl NotificationRegistry {
    #[must_use]
    pub fn new(queue: Arc<AccessQueue>) -> Self {
        Self {
            queue,
            tokens: Mutex::new(SlotMap::with_capacity_and_key(4)),
        }
    }

    /// Start tracking `token` and return its key.
    pub fn register(&self, token: Box<dyn NotificationToken>) -> SubscriptionKey {
        self.queue.perform(|| {
            let key = self.tokens.lock().insert(token);
            debug!("Registered subscription {key:?}");
            key
        })
    }

    /// Stop the subscription for `key` and forget about it.
    ///
    /// Returns `false` if `key` is not tracked.
    pub fn unregister(&self, key: SubscriptionKey) -> bool {
        self.queue.perform(|| {
            // Release the lock before stopping, stopping may re-enter the store.
            let token = self.tokens.lock().remove(key);
            let Some(mut token) = token else {
                return false;
            };
            token.stop();
            debug!("Unregistered subscription {key:?}");
            true
        })
    }

    /// Stop and forget all subscriptions.
    pub fn unregister_all(&self) {
        self.queue.perform(|| {
            let keys = self.tokens.lock().keys().collect::<Vec<_>>();
            debug!("Unregistering {} subscriptions", keys.len());
            for key in keys {
                self.unregister(key);
            }
        });
    }

    #[must_use]
    pub fn contains(&self, key: SubscriptionKey) -> bool {
        self.tokens.lock().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

impl Drop for NotificationRegistry {
    fn drop(&mut self) {
        self.unregister_all();
    }
}
