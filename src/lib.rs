//! This crate provides live, optionally capped windows over the result of a sqlite query. A
//! window keeps a snapshot of the rows a consumer displays and, once subscribed, reports every
//! committed change of the query as row level deletions, insertions and modifications that can be
//! applied to a list as is.
//!
//! The core ([`window`], [`translate`], [`registry`], [`access`]) is agnostic over the store. It
//! only relies on the contract in [`store`]. An implementation on top of `rusqlite` is provided
//! in [`store::sqlite`] together with [`manager`], both enabled by default.
//!
//! # Basic example
//!
//! ```rust
//! use std::sync::Arc;
//! use rusqlite::types::Value;
//! use rusqlite::Row;
//! use sqlite_live_window::manager::{Lifecycle, Manager, ManagerConfig};
//! use sqlite_live_window::store::Identified;
//! use sqlite_live_window::store::sqlite::{self, Database, Location, Query, Record};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Task {
//!     id: i64,
//!     title: String,
//! }
//!
//! impl Identified for Task {
//!     type Id = i64;
//!     fn id(&self) -> i64 {
//!         self.id
//!     }
//! }
//!
//! impl Record for Task {
//!     const TABLE: &'static str = "task";
//!     const PRIMARY_KEY: &'static str = "id";
//!     const COLUMNS: &'static [&'static str] = &["id", "title"];
//!     const DEFINITION: &'static str = "id INTEGER PRIMARY KEY, title TEXT NOT NULL";
//!
//!     fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
//!         Ok(Self { id: row.get("id")?, title: row.get("title")? })
//!     }
//!     fn to_values(&self) -> Vec<Value> {
//!         vec![Value::Integer(self.id), Value::Text(self.title.clone())]
//!     }
//!     fn primary_key(&self) -> Value {
//!         Value::Integer(self.id)
//!     }
//! }
//!
//! struct Tasks;
//!
//! impl Lifecycle for Tasks {
//!     fn migrate(&self, _: &Database, _: u64) -> Result<(), sqlite::Error> {
//!         Ok(())
//!     }
//!     fn delete_all(&self, database: &Database) -> Result<(), sqlite::Error> {
//!         database.delete_all::<Task>().map(|_| ())
//!     }
//!     fn recover(&self) {}
//! }
//!
//! let config = ManagerConfig::new(Location::InMemory, 1).with_record_type::<Task>();
//! let manager = Manager::open(config, Arc::new(Tasks)).unwrap();
//!
//! // Newest tasks first, at most 20 of them, displayed in section 1.
//! let window = manager
//!     .query(Query::<Task>::new().sort_by(["id"]).descending().max(20))
//!     .unwrap();
//! window.set_addressing(1, 0);
//! window
//!     .changed(|changes| {
//!         // Apply deletions, then insertions, then reload modifications.
//!         println!("{changes:?}");
//!     })
//!     .unwrap();
//!
//! // The callback runs once the transaction has been committed.
//! manager
//!     .transaction(|db| db.put(&Task { id: 1, title: "Write docs".to_owned() }))
//!     .unwrap();
//! assert_eq!(window.len(), 1);
//! ```
//!
//! # How it works
//!
//! Every table observed by a live query gets temporary INSERT, UPDATE and DELETE triggers which
//! flag the table in a temporary tracking table. Triggers are created and dropped lazily at the
//! start of the next write transaction.
//!
//! After a transaction has been committed, every live query on a flagged table is evaluated
//! again and compared with its previous result by record identity. The resulting
//! [`change::RawChange`] holds raw indices into the complete result. Each [`window::ResultWindow`]
//! translates it against its own snapshot with [`translate::translate()`], dropping insertions
//! that would exceed its cap, and forwards the [`change::ChangeSet`] to its callback.
//!
//! # Change Granularity
//!
//! Records are compared by identity and content. A record whose position changed relative to the
//! others is reported as a deletion followed by an insertion, never as a move.
//!
//! # Threading
//!
//! All operations of a [`manager::Manager`] run inside its [`access::AccessQueue`], a re-entrant
//! exclusive context. Changes are delivered synchronously on the thread that committed the
//! transaction, still inside the queue, so callbacks can safely use the manager and the window.
//!
//! # Single Process
//!
//! Only changes made through the same [`store::sqlite::Database`] are observed. Modifications by
//! other connections or processes are not detected.

pub mod access;
pub mod change;
#[cfg(feature = "rusqlite")]
pub mod manager;
pub mod registry;
pub mod store;
pub mod translate;
pub mod window;
