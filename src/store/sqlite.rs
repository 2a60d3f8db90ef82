//! Store implementation for `rusqlite`.
//!
//! Requires the `rusqlite` feature to be enabled.
//!
//! A [`Database`] owns one connection. Every write goes through [`Database::transaction()`]. Once
//! a transaction has been committed, the live queries on the tables it modified are re-evaluated
//! and their subscribers receive the difference with the previous result.
use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use rusqlite::{params_from_iter, Connection, Params};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

mod diff;
mod notifier;
pub(crate) mod record;
mod results;
mod tracking;

use notifier::Notifier;
use record::{delete_all_query, delete_query, upsert_query};
use tracking::Triggers;

pub use record::{Record, RecordType};
pub use results::{Query, RecordFilter, Results};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored schema version {stored} is newer than requested version {requested}")]
    SchemaVersion { stored: u64, requested: u64 },
    #[error("Invalid sort key '{0}'")]
    InvalidSortKey(String),
    #[error("Writes require an active transaction")]
    NotInTransaction,
    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    File(PathBuf),
    InMemory,
}

/// Callback used by [`Database::open()`] to migrate a database from an older schema version.
pub type Migrate<'a> = &'a dyn Fn(&Database, u64) -> Result<(), Error>;

pub struct Database {
    connection: Mutex<Connection>,
    triggers: Mutex<Triggers>,
    notifier: Arc<Notifier>,
    /// Serializes write transactions and the publication of their changes.
    writer: ReentrantMutex<()>,
    publishing: AtomicBool,
    location: Location,
}

impl Database {
    /// Open the database at `location` and bring its schema to `schema_version`.
    ///
    /// A database without any table is initialized directly. A database with an older
    /// `user_version` is passed to `migrate` along with the stored version, inside a transaction.
    /// Tables for `record_types` are created if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if the database could not be opened, if it was created with a newer schema
    /// version or if the migration failed.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(record_types, migrate))]
    pub fn open(
        location: Location,
        schema_version: u64,
        record_types: &[RecordType],
        migrate: Migrate<'_>,
    ) -> Result<Self, Error> {
        let connection = match &location {
            Location::File(path) => Connection::open(path)?,
            Location::InMemory => Connection::open_in_memory()?,
        };
        Triggers::start_tracking(&connection)?;

        let database = Self {
            connection: Mutex::new(connection),
            triggers: Mutex::new(Triggers::new()),
            notifier: Arc::new(Notifier::new()),
            writer: ReentrantMutex::new(()),
            publishing: AtomicBool::new(false),
            location,
        };
        database.prepare_schema(schema_version, record_types, migrate)?;
        Ok(database)
    }

    fn prepare_schema(
        &self,
        requested: u64,
        record_types: &[RecordType],
        migrate: Migrate<'_>,
    ) -> Result<(), Error> {
        let (stored, fresh) = {
            let connection = self.connection.lock();
            let stored: u64 =
                connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
            let tables: usize = connection.query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                (),
                |row| row.get(0),
            )?;
            (stored, tables == 0)
        };

        if stored > requested {
            return Err(Error::SchemaVersion { stored, requested });
        }

        self.transaction(|database| {
            if !fresh && stored < requested {
                debug!("Migrating schema from version {stored} to {requested}");
                migrate(database, stored)?;
            }
            let connection = database.writable()?;
            for record_type in record_types {
                connection.execute_batch(&record_type.create_table_query())?;
            }
            if stored != requested {
                connection.pragma_update(None, "user_version", requested)?;
            }
            Ok(())
        })
    }

    #[must_use]
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Run `f` inside a write transaction.
    ///
    /// The transaction is committed if `f` succeeds and rolled back otherwise. If a transaction
    /// is already active on this thread `f` runs as part of it. Subscribers of live queries are
    /// notified once the outermost transaction has been committed.
    ///
    /// # Errors
    ///
    /// Returns error returned by `f` or if the transaction could not be started or committed.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&Self) -> Result<R, E>) -> Result<R, E>
    where
        E: From<Error>,
    {
        let _writer = self.writer.lock();
        if self.in_transaction() {
            return f(self);
        }

        self.sync_tables()?;
        self.connection
            .lock()
            .execute_batch("BEGIN")
            .map_err(Error::from)?;

        let result = f(self).and_then(|value| {
            self.connection
                .lock()
                .execute_batch("COMMIT")
                .map_err(Error::from)?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                if let Err(e) = self.publish_changes() {
                    error!("Failed to publish changes: {e}");
                }
                Ok(value)
            }
            Err(e) => {
                let connection = self.connection.lock();
                if !connection.is_autocommit() {
                    if let Err(e) = connection.execute_batch("ROLLBACK") {
                        error!("Failed to roll back transaction: {e}");
                    }
                }
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        !self.connection.lock().is_autocommit()
    }

    /// Load all records matching `query`.
    ///
    /// # Errors
    ///
    /// Returns error if the query is invalid or failed.
    pub fn fetch<T: Record>(&self, query: &Query<T>) -> Result<Vec<T>, Error> {
        let sql = query.to_sql()?;
        let records = {
            let connection = self.connection.lock();
            let mut stmt = connection.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(query.params.iter()), T::from_row)?;
            rows.collect::<rusqlite::Result<Vec<T>>>()?
        };
        if query.filter.is_none() {
            return Ok(records);
        }
        Ok(records
            .into_iter()
            .filter(|record| query.matches(record))
            .collect())
    }

    /// Insert `record` or replace the record with the same primary key.
    ///
    /// # Errors
    ///
    /// Returns error if no transaction is active or the statement failed.
    pub fn put<T: Record>(&self, record: &T) -> Result<(), Error> {
        let connection = self.writable()?;
        connection
            .prepare_cached(&upsert_query::<T>())?
            .execute(params_from_iter(record.to_values()))?;
        Ok(())
    }

    /// Delete `record`. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns error if no transaction is active or the statement failed.
    pub fn delete<T: Record>(&self, record: &T) -> Result<bool, Error> {
        let connection = self.writable()?;
        let deleted = connection
            .prepare_cached(&delete_query::<T>())?
            .execute(params_from_iter([record.primary_key()]))?;
        Ok(deleted > 0)
    }

    /// Delete all records of type `T`. Returns the number of deleted records.
    ///
    /// # Errors
    ///
    /// Returns error if no transaction is active or the statement failed.
    pub fn delete_all<T: Record>(&self) -> Result<usize, Error> {
        let connection = self.writable()?;
        Ok(connection.execute(&delete_all_query::<T>(), ())?)
    }

    /// Execute an arbitrary statement.
    ///
    /// # Errors
    ///
    /// Returns error if no transaction is active or the statement failed.
    pub fn execute(&self, sql: &str, params: impl Params) -> Result<usize, Error> {
        let connection = self.writable()?;
        Ok(connection.execute(sql, params)?)
    }

    pub(crate) fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    fn writable(&self) -> Result<MutexGuard<'_, Connection>, Error> {
        let connection = self.connection.lock();
        if connection.is_autocommit() {
            return Err(Error::NotInTransaction);
        }
        Ok(connection)
    }

    /// Create or drop triggers so that every table observed by a live query is tracked.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    fn sync_tables(&self) -> Result<(), Error> {
        let mut triggers = self.triggers.lock();
        let Some(plan) = self.notifier.with_tables(|tables| triggers.plan(tables)) else {
            debug!("No changes");
            return Ok(());
        };
        triggers.apply(&self.connection.lock(), plan)?;
        Ok(())
    }

    /// Re-evaluate the live queries of all tables modified by the last transaction and notify
    /// their subscribers.
    ///
    /// Subscribers may commit transactions of their own. Those commits are not published on
    /// their own but picked up by the running publication once the current batch has been
    /// delivered, so every subscriber sees the changes in commit order.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    fn publish_changes(&self) -> Result<(), Error> {
        if self.publishing.swap(true, Ordering::AcqRel) {
            debug!("Publication in progress, deferring changes");
            return Ok(());
        }
        let _publishing = PublishingGuard(&self.publishing);

        loop {
            let changed = self
                .triggers
                .lock()
                .take_changed(&self.connection.lock())?;
            if changed.is_empty() {
                return Ok(());
            }

            let deliveries = self.notifier.evaluate(self, &changed);
            debug!("Delivering {} change(s)", deliveries.len());
            for delivery in deliveries {
                delivery();
            }
        }
    }
}

/// Resets the publishing flag, also when a subscriber panics.
struct PublishingGuard<'a>(&'a AtomicBool);

impl Drop for PublishingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}
