use super::diff::diff;
use super::notifier::{Delivery, LiveToken};
use super::record::{select_query, Record};
use super::{Database, Error};
use crate::access::AccessQueue;
use crate::store::{BoxError, DeltaHandler, LiveQuery, NotificationToken};
use parking_lot::Mutex;
use rusqlite::types::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In memory predicate applied on top of the SQL predicate of a [`Query`].
pub type RecordFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Description of the records to load from a table.
///
/// ```rust
/// # use sqlite_live_window::store::sqlite::Query;
/// # fn build<T>() -> Query<T> {
/// Query::new()
///     .predicate("id > ?1")
///     .bind(0)
///     .sort_by(["id"])
///     .ascending(false)
///     .max(50)
/// # }
/// ```
pub struct Query<T> {
    pub(crate) predicate: Option<String>,
    pub(crate) params: Vec<Value>,
    pub(crate) sort_keys: Vec<String>,
    pub(crate) ascending: bool,
    pub(crate) limit: Option<usize>,
    pub(crate) max: Option<usize>,
    pub(crate) filter: Option<RecordFilter<T>>,
}

impl<T> Query<T> {
    /// Query for all records of a table in storage order.
    #[must_use]
    pub fn new() -> Self {
        Self {
            predicate: None,
            params: Vec::new(),
            sort_keys: Vec::new(),
            ascending: true,
            limit: None,
            max: None,
            filter: None,
        }
    }

    /// SQL expression used as `WHERE` clause. Use [`Query::bind()`] for its parameters.
    #[must_use]
    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Bind the next positional parameter of the predicate.
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Columns to sort by, in order of precedence.
    #[must_use]
    pub fn sort_by<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.sort_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Sort direction for all sort keys. Defaults to ascending.
    #[must_use]
    pub fn ascending(mut self, ascending: bool) -> Self {
        self.ascending = ascending;
        self
    }

    #[must_use]
    pub fn descending(self) -> Self {
        self.ascending(false)
    }

    /// Number of records loaded initially into a window.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Maximum number of records a window may hold.
    #[must_use]
    pub fn max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    /// Only keep the records for which `filter` returns `true`.
    ///
    /// The filter also applies to change notifications, so positions reported for a live query
    /// refer to the filtered result.
    #[must_use]
    pub fn filter(mut self, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub(crate) fn matches(&self, record: &T) -> bool {
        match &self.filter {
            Some(filter) => filter(record),
            None => true,
        }
    }
}

impl<T: Record> Query<T> {
    pub(crate) fn to_sql(&self) -> Result<String, Error> {
        let mut sql = select_query::<T>();
        if let Some(predicate) = &self.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        if !self.sort_keys.is_empty() {
            let direction = if self.ascending { "ASC" } else { "DESC" };
            let mut order = Vec::with_capacity(self.sort_keys.len());
            for key in &self.sort_keys {
                if !is_identifier(key) {
                    return Err(Error::InvalidSortKey(key.clone()));
                }
                order.push(format!("`{key}` {direction}"));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        Ok(sql)
    }
}

fn is_identifier(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl<T> Default for Query<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            params: self.params.clone(),
            sort_keys: self.sort_keys.clone(),
            ascending: self.ascending,
            limit: self.limit,
            max: self.max,
            filter: self.filter.clone(),
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("predicate", &self.predicate)
            .field("params", &self.params)
            .field("sort_keys", &self.sort_keys)
            .field("ascending", &self.ascending)
            .field("limit", &self.limit)
            .field("max", &self.max)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Live result of a [`Query`] on a [`Database`].
///
/// [`Results::fetch()`] loads the current records. Subscribing through [`LiveQuery::observe()`]
/// re-evaluates the query after every committed transaction that modified its table and reports
/// the differences with the previous evaluation.
///
/// The first evaluation is compared with the baseline given to [`Results::with_baseline()`] or,
/// without one, with the result at the time of the first subscription. A later subscription
/// continues from the last result delivered to a subscriber, so changes committed while nobody
/// was subscribed are reported with the next change of the table.
pub struct Results<T: Record> {
    database: Arc<Database>,
    query: Query<T>,
    baseline: Arc<Mutex<Option<Arc<Vec<T>>>>>,
    queue: Option<Arc<AccessQueue>>,
}

impl<T: Record> Results<T> {
    #[must_use]
    pub fn new(database: Arc<Database>, query: Query<T>) -> Self {
        Self {
            database,
            query,
            baseline: Arc::new(Mutex::new(None)),
            queue: None,
        }
    }

    /// Report changes relative to `records`, the complete result a consumer was built from.
    #[must_use]
    pub fn with_baseline(self, records: Vec<T>) -> Self {
        *self.baseline.lock() = Some(Arc::new(records));
        self
    }

    /// Subscribe and deliver changes inside `queue`.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<AccessQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Load all records matching the query.
    ///
    /// # Errors
    ///
    /// Returns error if the query failed.
    pub fn fetch(&self) -> Result<Vec<T>, Error> {
        self.database.fetch(&self.query)
    }

    /// Number of records currently matching the query.
    ///
    /// # Errors
    ///
    /// Returns error if the query failed.
    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.fetch()?.len())
    }

    /// # Errors
    ///
    /// Returns error if the query failed.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    #[must_use]
    pub fn query(&self) -> &Query<T> {
        &self.query
    }

    fn subscribe(&self, handler: DeltaHandler<T>) -> Result<Box<dyn NotificationToken>, Error> {
        let baseline = self.baseline.lock().clone();
        let mut last = match baseline {
            Some(baseline) => baseline,
            None => {
                let fetched = Arc::new(self.fetch()?);
                *self.baseline.lock() = Some(Arc::clone(&fetched));
                fetched
            }
        };
        let query = self.query.clone();
        let active = Arc::new(AtomicBool::new(true));

        let evaluate = {
            let active = Arc::clone(&active);
            let delivered = Arc::clone(&self.baseline);
            let queue = self.queue.clone();
            move |database: &Database| -> Result<Option<Delivery>, Error> {
                let current = Arc::new(database.fetch(&query)?);
                let change = diff(&last, &current);
                if change.is_empty() {
                    return Ok(None);
                }
                last = Arc::clone(&current);

                let handler = Arc::clone(&handler);
                let active = Arc::clone(&active);
                let delivered = Arc::clone(&delivered);
                let queue = queue.clone();
                let delivery: Delivery = Box::new(move || {
                    let deliver = || {
                        if active.load(Ordering::Acquire) {
                            *delivered.lock() = Some(Arc::clone(&current));
                            handler(&change, current.as_slice());
                        }
                    };
                    match &queue {
                        Some(queue) => queue.perform(deliver),
                        None => deliver(),
                    }
                });
                Ok(Some(delivery))
            }
        };

        let notifier = self.database.notifier();
        let key = notifier.add(T::TABLE, Box::new(evaluate));
        Ok(Box::new(LiveToken::new(notifier, key, active)))
    }
}

impl<T: Record> LiveQuery<T> for Results<T> {
    fn observe(&self, handler: DeltaHandler<T>) -> Result<Box<dyn NotificationToken>, BoxError> {
        let token = match &self.queue {
            Some(queue) => queue.perform(|| self.subscribe(handler)),
            None => self.subscribe(handler),
        }?;
        Ok(token)
    }
}
