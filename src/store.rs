//! Contract between the live window core and the store that backs it.
//!
//! The core never talks to a database directly. It only needs records that can be compared by
//! identity ([`Identified`]), a way to subscribe to raw changes of a query ([`LiveQuery`]) and a
//! handle to cancel that subscription ([`NotificationToken`]).
//!
//! An implementation on top of `rusqlite` is available in [`sqlite`] when the `rusqlite` feature
//! is enabled (default).
use crate::change::RawChange;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

#[cfg(feature = "rusqlite")]
pub mod sqlite;

/// Error type used across the store boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A record with a stable identity.
///
/// Two values with the same [`Identified::id()`] are the same record, possibly in different
/// versions. Identities must be unique within one query result.
pub trait Identified {
    type Id: Eq + Hash + Clone + Debug + Send + Sync;

    fn id(&self) -> Self::Id;
}

/// Callback invoked by the store for every change of a live query.
///
/// Receives the raw change and the complete query result after the change.
pub type DeltaHandler<T> = Arc<dyn Fn(&RawChange, &[T]) + Send + Sync>;

/// Cancellation handle for a live query subscription.
pub trait NotificationToken: Send {
    /// Stop delivering changes. Once this returns the handler is never invoked again, even for
    /// changes that were already computed. Calling it more than once has no effect.
    fn stop(&mut self);
}

/// A query whose result changes can be observed.
pub trait LiveQuery<T>: Send + Sync {
    /// Subscribe `handler` to changes of this query.
    ///
    /// # Errors
    ///
    /// Should return error if the store could not set up change tracking.
    fn observe(&self, handler: DeltaHandler<T>) -> Result<Box<dyn NotificationToken>, BoxError>;
}
