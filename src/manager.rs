//! Entry point tying a [`Database`] to its [`AccessQueue`] and [`NotificationRegistry`].
//!
//! Requires the `rusqlite` feature to be enabled.
//!
//! A [`Manager`] is opened from a [`ManagerConfig`] and a [`Lifecycle`] which provides the
//! behavior that differs between applications: schema migration, deleting all records and
//! reacting to the database being recreated. [`ManagerRegistry`] hands out one shared manager
//! per database file.
use crate::access::AccessQueue;
use crate::registry::NotificationRegistry;
use crate::store::sqlite::{self, Database, Location, Query, Record, RecordType, Results};
use crate::window::{self, ResultWindow};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to open database {location:?}: {source}")]
    Open {
        location: Location,
        #[source]
        source: sqlite::Error,
    },
    #[error("Failed to remove database file {path:?}: {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] sqlite::Error),
    #[error(transparent)]
    Window(#[from] window::Error),
}

/// Application specific behavior of a [`Manager`].
pub trait Lifecycle: Send + Sync {
    /// Migrate `database` from `old_version` to the configured schema version.
    ///
    /// Runs inside a transaction, before tables for new record types are created.
    ///
    /// # Errors
    ///
    /// Returning an error aborts opening the database.
    fn migrate(&self, database: &Database, old_version: u64) -> Result<(), sqlite::Error>;

    /// Delete every record managed by the application. Runs inside a transaction.
    ///
    /// # Errors
    ///
    /// Should return error if a record type could not be deleted.
    fn delete_all(&self, database: &Database) -> Result<(), sqlite::Error>;

    /// Called after the database could not be opened and was recreated from scratch.
    fn recover(&self);
}

#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct ManagerConfig {
    pub location: Location,
    pub schema_version: u64,
    /// Record types whose tables are created on open. `None` creates no tables.
    pub record_types: Option<Vec<RecordType>>,
}

impl ManagerConfig {
    #[must_use]
    pub fn new(location: Location, schema_version: u64) -> Self {
        Self {
            location,
            schema_version,
            record_types: None,
        }
    }

    #[must_use]
    pub fn with_record_type<T: Record>(mut self) -> Self {
        self.record_types
            .get_or_insert_with(Vec::new)
            .push(T::record_type());
        self
    }
}

/// Serialized access to one database with live result windows.
///
/// Every operation runs inside the manager's [`AccessQueue`]. Windows created with
/// [`Manager::query()`] register their subscriptions with the manager's
/// [`NotificationRegistry`], which [`Manager::clear()`] drains.
pub struct Manager {
    config: ManagerConfig,
    lifecycle: Arc<dyn Lifecycle>,
    queue: Arc<AccessQueue>,
    notifications: Arc<NotificationRegistry>,
    database: Arc<Database>,
}

impl Manager {
    /// Open the configured database.
    ///
    /// If the database can not be opened, for instance because the file is corrupted or was
    /// written with a newer schema version, the file is deleted and opened again. In that case
    /// all records are deleted through [`Lifecycle::delete_all()`] and [`Lifecycle::recover()`]
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns error if the database could not be opened after recreating it.
    pub fn open(config: ManagerConfig, lifecycle: Arc<dyn Lifecycle>) -> Result<Self, Error> {
        let label = match &config.location {
            Location::File(path) => format!("manager:{}", path.display()),
            Location::InMemory => "manager:memory".to_owned(),
        };
        let queue = Arc::new(AccessQueue::new(label));
        let notifications = Arc::new(NotificationRegistry::new(Arc::clone(&queue)));
        let database =
            queue.perform(|| open_with_recovery(&config, lifecycle.as_ref(), &notifications))?;

        Ok(Self {
            config,
            lifecycle,
            queue,
            notifications,
            database: Arc::new(database),
        })
    }

    /// Run `execution` inside the manager's queue.
    pub fn perform<R>(&self, execution: impl FnOnce() -> R) -> R {
        self.queue.perform(execution)
    }

    /// Run `f` inside a write transaction, see [`Database::transaction()`].
    ///
    /// # Errors
    ///
    /// Returns error returned by `f` or if the transaction could not be committed.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&Database) -> Result<R, E>) -> Result<R, E>
    where
        E: From<sqlite::Error>,
    {
        self.queue.perform(|| self.database.transaction(f))
    }

    /// Create a window over the result of `query`.
    ///
    /// The window initially holds at most [`Query::limit()`] records and never more than
    /// [`Query::max()`]. Call [`ResultWindow::changed()`] to start receiving changes.
    ///
    /// # Errors
    ///
    /// Returns error if the query failed.
    pub fn query<T: Record>(&self, query: Query<T>) -> Result<ResultWindow<T>, Error> {
        self.queue.perform(|| {
            let results = self.results(query);
            let all = results.fetch()?;
            let mut records = all.clone();
            if let Some(limit) = results.query().limit {
                records.truncate(limit);
            }
            let max = results.query().max;
            Ok(ResultWindow::new(
                records,
                max,
                Arc::new(results.with_baseline(all)),
                Arc::clone(&self.queue),
                Arc::clone(&self.notifications),
            ))
        })
    }

    /// Load the records matching `query`, honoring its limit and maximum.
    ///
    /// # Errors
    ///
    /// Returns error if the query failed.
    pub fn objects<T: Record>(&self, query: &Query<T>) -> Result<Vec<T>, Error> {
        self.queue.perform(|| {
            let mut records = self.database.fetch(query)?;
            for bound in [query.limit, query.max].into_iter().flatten() {
                records.truncate(bound);
            }
            Ok(records)
        })
    }

    /// Live results of `query` without a window. Subscriptions and deliveries run inside the
    /// manager's queue.
    #[must_use]
    pub fn results<T: Record>(&self, query: Query<T>) -> Results<T> {
        Results::new(Arc::clone(&self.database), query).with_queue(Arc::clone(&self.queue))
    }

    /// Cancel every subscription and delete all records.
    ///
    /// # Errors
    ///
    /// Returns error if the records could not be deleted.
    pub fn clear(&self) -> Result<(), Error> {
        self.queue.perform(|| {
            self.notifications.unregister_all();
            self.database
                .transaction(|database| self.lifecycle.delete_all(database))?;
            debug!("Cleared {:?}", self.config.location);
            Ok(())
        })
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<AccessQueue> {
        &self.queue
    }

    #[must_use]
    pub fn notifications(&self) -> &Arc<NotificationRegistry> {
        &self.notifications
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("subscriptions", &self.notifications.len())
            .finish_non_exhaustive()
    }
}

fn open_database(
    config: &ManagerConfig,
    lifecycle: &dyn Lifecycle,
) -> Result<Database, sqlite::Error> {
    Database::open(
        config.location.clone(),
        config.schema_version,
        config.record_types.as_deref().unwrap_or_default(),
        &|database: &Database, old_version: u64| lifecycle.migrate(database, old_version),
    )
}

#[tracing::instrument(level = tracing::Level::DEBUG, skip(lifecycle, notifications))]
fn open_with_recovery(
    config: &ManagerConfig,
    lifecycle: &dyn Lifecycle,
    notifications: &NotificationRegistry,
) -> Result<Database, Error> {
    let err = match open_database(config, lifecycle) {
        Ok(database) => return Ok(database),
        Err(e) => e,
    };
    let Location::File(path) = &config.location else {
        return Err(Error::Open {
            location: config.location.clone(),
            source: err,
        });
    };

    error!("Failed to open database {path:?}, recreating it: {err}");
    remove_database_files(path)?;
    let database = open_database(config, lifecycle).map_err(|source| Error::Open {
        location: config.location.clone(),
        source,
    })?;

    notifications.unregister_all();
    database.transaction(|database| lifecycle.delete_all(database))?;
    lifecycle.recover();
    Ok(database)
}

/// Remove the database file along with its journal files.
fn remove_database_files(path: &Path) -> Result<(), Error> {
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let mut file = OsString::from(path.as_os_str());
        file.push(suffix);
        let file = PathBuf::from(file);
        match std::fs::remove_file(&file) {
            Ok(()) => debug!("Removed {file:?}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(Error::RemoveFile { path: file, source }),
        }
    }
    Ok(())
}

/// Hands out one [`Manager`] per database file.
///
/// Managers are only kept alive by the callers of [`ManagerRegistry::open()`]. Once every
/// reference is gone, the next call opens the database again. In-memory databases are never
/// shared.
#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ManagerRegistry {
    managers: Mutex<HashMap<PathBuf, Weak<Manager>>>,
}

impl ManagerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the manager for the database configured in `config`, opening it if necessary.
    ///
    /// If a manager for the same file is already open, `config` and `lifecycle` are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the database had to be opened and could not be.
    pub fn open(
        &self,
        config: ManagerConfig,
        lifecycle: Arc<dyn Lifecycle>,
    ) -> Result<Arc<Manager>, Error> {
        let Location::File(path) = &config.location else {
            return Ok(Arc::new(Manager::open(config, lifecycle)?));
        };
        let key = file_identity(path);

        let mut managers = self.managers.lock();
        if let Some(manager) = managers.get(&key).and_then(Weak::upgrade) {
            if manager.config.schema_version != config.schema_version {
                warn!(
                    "Reusing manager for {key:?} with schema version {}, requested {}",
                    manager.config.schema_version, config.schema_version
                );
            }
            return Ok(manager);
        }

        let manager = Arc::new(Manager::open(config, lifecycle)?);
        managers.retain(|_, manager| manager.strong_count() > 0);
        managers.insert(key, Arc::downgrade(&manager));
        Ok(manager)
    }

    /// Return the open manager for the database file at `path`, if any.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<Arc<Manager>> {
        self.managers
            .lock()
            .get(&file_identity(path))
            .and_then(Weak::upgrade)
    }
}

/// Canonical path of a database file which may not exist yet.
fn file_identity(path: &Path) -> PathBuf {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return path.to_path_buf();
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    parent
        .canonicalize()
        .map_or_else(|_| path.to_path_buf(), |parent| parent.join(name))
}
