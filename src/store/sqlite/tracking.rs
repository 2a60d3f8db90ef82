//! Table level change detection.
//!
//! For every table observed by at least one live query we create temporary triggers for
//! INSERT, UPDATE and DELETE statements. Each trigger flags its table in a temporary tracking
//! table. After a transaction has been committed, the flagged tables are read and reset, and the
//! live queries on those tables are re-evaluated.
//!
//! [`WatchedTables`] keeps the list of tables that should have triggers along with a version
//! counter. [`Triggers`] keeps the state of the connection and brings it up to date with
//! [`Triggers::plan()`] and [`Triggers::apply()`] before every write transaction.
use fixedbitset::FixedBitSet;
use rusqlite::Connection;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt::Write;
use tracing::debug;

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum TableOp {
    Add(String, usize),
    Remove(String, usize),
}

/// Tables observed by live queries.
///
/// Each table is assigned a stable id the first time it is observed. Ids are never reused, a
/// table whose last observer went away keeps its id with an observer count of 0.
pub(crate) struct WatchedTables {
    table_ids: BTreeMap<String, usize>,
    tables: Vec<String>,
    num_observers: Vec<usize>,
    /// Bumped every time a table starts or stops being observed.
    version: u64,
}

impl WatchedTables {
    pub(crate) fn new() -> Self {
        Self {
            table_ids: BTreeMap::new(),
            tables: Vec::with_capacity(8),
            num_observers: Vec::with_capacity(8),
            version: 0,
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn name(&self, id: usize) -> Option<&str> {
        self.tables.get(id).map(String::as_str)
    }

    pub(crate) fn track(&mut self, table: &str) {
        match self.table_ids.entry(table.to_owned()) {
            Entry::Vacant(v) => {
                let id = self.num_observers.len();
                self.tables.push(table.to_owned());
                self.num_observers.push(1);
                v.insert(id);
                self.bump_version();
            }
            Entry::Occupied(o) => {
                let id = *o.get();
                self.num_observers[id] += 1;
                if self.num_observers[id] == 1 {
                    self.bump_version();
                }
            }
        }
    }

    pub(crate) fn untrack(&mut self, table: &str) {
        let Some(&id) = self.table_ids.get(table) else {
            return;
        };
        if self.num_observers[id] == 0 {
            return;
        }
        self.num_observers[id] -= 1;
        if self.num_observers[id] == 0 {
            self.bump_version();
        }
    }

    fn bump_version(&mut self) {
        self.version = self.version.saturating_add(1);
    }

    /// Calculate which triggers have to be created or dropped on a connection whose installed
    /// triggers are described by `installed`.
    ///
    /// Returns the new installed state and the list of operations.
    fn calculate_changes(&self, installed: &FixedBitSet) -> (FixedBitSet, Vec<TableOp>) {
        let mut result = installed.clone();
        result.grow(self.tables.len());
        let mut changes = Vec::new();
        for (id, &observers) in self.num_observers.iter().enumerate() {
            let is_installed = id < installed.len() && installed[id];
            if is_installed && observers == 0 {
                changes.push(TableOp::Remove(self.tables[id].clone(), id));
                result.set(id, false);
            } else if !is_installed && observers != 0 {
                changes.push(TableOp::Add(self.tables[id].clone(), id));
                result.set(id, true);
            }
        }
        (result, changes)
    }
}

/// Pending trigger changes computed by [`Triggers::plan()`].
pub(crate) struct SyncPlan {
    version: u64,
    installed: FixedBitSet,
    ops: Vec<TableOp>,
}

/// Triggers installed on the connection.
pub(crate) struct Triggers {
    installed: FixedBitSet,
    last_sync_version: u64,
}

impl Triggers {
    pub(crate) fn new() -> Self {
        Self {
            installed: FixedBitSet::new(),
            last_sync_version: 0,
        }
    }

    /// Enable required pragmas and create the tracking table.
    pub(crate) fn start_tracking(connection: &Connection) -> rusqlite::Result<()> {
        connection.execute_batch(&format!(
            "PRAGMA temp_store = MEMORY;
             PRAGMA recursive_triggers = ON;
             CREATE TEMP TABLE IF NOT EXISTS `{TRACKER_TABLE_NAME}` (table_id INTEGER PRIMARY KEY, updated INTEGER);
             DELETE FROM `{TRACKER_TABLE_NAME}`;"
        ))
    }

    /// Determine the trigger changes required to match `tables`, if any.
    pub(crate) fn plan(&self, tables: &WatchedTables) -> Option<SyncPlan> {
        let version = tables.version();
        if version == self.last_sync_version {
            return None;
        }
        let (installed, ops) = tables.calculate_changes(&self.installed);
        Some(SyncPlan {
            version,
            installed,
            ops,
        })
    }

    /// Create and drop triggers according to `plan`.
    pub(crate) fn apply(&mut self, connection: &Connection, plan: SyncPlan) -> rusqlite::Result<()> {
        if !plan.ops.is_empty() {
            let tx = connection.unchecked_transaction()?;
            for op in &plan.ops {
                match op {
                    TableOp::Add(table, id) => {
                        debug!("Creating triggers for table {table} id={id}");
                        tx.execute_batch(&create_triggers_query(table, *id))?;
                    }
                    TableOp::Remove(table, id) => {
                        debug!("Dropping triggers for table {table} id={id}");
                        tx.execute_batch(&drop_triggers_query(table, *id))?;
                    }
                }
            }
            tx.commit()?;
        }
        self.installed = plan.installed;
        self.last_sync_version = plan.version;
        Ok(())
    }

    /// Return the ids of all tables modified since the last call and reset their flags.
    pub(crate) fn take_changed(&self, connection: &Connection) -> rusqlite::Result<Vec<usize>> {
        let mut stmt = connection.prepare_cached(&format!(
            "SELECT table_id FROM `{TRACKER_TABLE_NAME}` WHERE updated=1"
        ))?;
        let table_ids = stmt
            .query_map((), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<usize>>>()?;

        if !table_ids.is_empty() {
            connection.execute(
                &format!("UPDATE `{TRACKER_TABLE_NAME}` SET updated=0 WHERE updated=1"),
                (),
            )?;
        }
        Ok(table_ids)
    }
}

const TRACKER_TABLE_NAME: &str = "rsqlite_live_window_tracker";

const TRIGGER_LIST: [(&str, &str); 3] = [
    ("INSERT", "insert"),
    ("UPDATE", "update"),
    ("DELETE", "delete"),
];

fn create_triggers_query(table: &str, table_id: usize) -> String {
    let mut query = String::with_capacity(512);
    for (trigger, trigger_name) in TRIGGER_LIST {
        let _ = write!(
            query,
            "CREATE TEMP TRIGGER IF NOT EXISTS `{TRACKER_TABLE_NAME}_trigger_{table}_{trigger_name}` AFTER {trigger} ON `{table}`
BEGIN
    UPDATE `{TRACKER_TABLE_NAME}` SET updated=1 WHERE table_id={table_id};
END;
"
        );
    }
    let _ = write!(
        query,
        "INSERT OR REPLACE INTO `{TRACKER_TABLE_NAME}` VALUES ({table_id}, 0);"
    );
    query
}

fn drop_triggers_query(table: &str, table_id: usize) -> String {
    let mut query = String::with_capacity(256);
    for (_, trigger_name) in TRIGGER_LIST {
        let _ = write!(
            query,
            "DROP TRIGGER IF EXISTS `{TRACKER_TABLE_NAME}_trigger_{table}_{trigger_name}`;"
        );
    }
    let _ = write!(
        query,
        "DELETE FROM `{TRACKER_TABLE_NAME}` WHERE table_id={table_id};"
    );
    query
}
