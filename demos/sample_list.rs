use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::Row;
use sqlite_live_window::change::ChangeSet;
use sqlite_live_window::manager::{Lifecycle, Manager, ManagerConfig, ManagerRegistry};
use sqlite_live_window::store::sqlite::{self, Database, Location, Query, Record};
use sqlite_live_window::store::Identified;
use sqlite_live_window::window::ResultWindow;
use std::sync::Arc;
use tempdir::TempDir;
use tracing_subscriber::EnvFilter;

// A list with a fixed "Add" action in section 0 and the live rows of a query in section 1.
// Rows are added, renamed and deleted through transactions and the list is kept in sync with
// the change sets delivered to the window. Run with `RUST_LOG=debug` to see the store at work.
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let tmp_dir = TempDir::new("sqlite-live-window-demo").unwrap();
    let config = ManagerConfig::new(Location::File(tmp_dir.path().join("sample.db")), 1)
        .with_record_type::<SampleObject>();
    let registry = ManagerRegistry::new();
    let manager = registry.open(config, Arc::new(SampleLifecycle)).unwrap();

    let window = Arc::new(
        manager
            .query(
                Query::<SampleObject>::new()
                    .predicate("id > 0")
                    .sort_by(["id"])
                    .descending(),
            )
            .unwrap(),
    );
    window.set_addressing(1, 0);

    let list = Arc::new(Mutex::new(List::new(&window.snapshot())));
    {
        let weak_window = Arc::downgrade(&window);
        let list = Arc::clone(&list);
        window
            .changed(move |changes| {
                let Some(window) = weak_window.upgrade() else {
                    return;
                };
                println!(
                    "Changes: deleted {:?} inserted {:?} reloaded {:?}",
                    changes.deletions, changes.insertions, changes.modifications
                );
                list.lock().apply(changes, &window);
            })
            .unwrap();
    }

    for _ in 0..3 {
        add(&manager);
    }
    list.lock().print();

    let second = window.get(1).unwrap();
    rename(&manager, &second, "Renamed");
    list.lock().print();

    let first = window.get(0).unwrap();
    delete(&manager, &first);
    list.lock().print();

    let names = window
        .snapshot()
        .iter()
        .map(SampleObject::title)
        .collect::<Vec<_>>();
    assert_eq!(list.lock().rows, names);
}

fn add(manager: &Manager) {
    let newest = manager
        .objects(
            &Query::<SampleObject>::new()
                .predicate("id > 0")
                .sort_by(["id"])
                .descending()
                .limit(1),
        )
        .unwrap();
    let id = newest.first().map_or(1, |object| object.id + 1);
    manager
        .transaction(|db| db.put(&SampleObject::new(id, format!("SampleObject {id}"))))
        .unwrap();
}

fn rename(manager: &Manager, object: &SampleObject, name: &str) {
    let renamed = SampleObject::new(object.id, name.to_owned());
    manager.transaction(|db| db.put(&renamed)).unwrap();
}

fn delete(manager: &Manager, object: &SampleObject) {
    manager.transaction(|db| db.delete(object)).unwrap();
}

/// Rows of a two section list, updated incrementally.
struct List {
    actions: Vec<String>,
    rows: Vec<String>,
}

impl List {
    fn new(objects: &[SampleObject]) -> Self {
        Self {
            actions: vec!["Add New SampleObject".to_owned()],
            rows: objects.iter().map(SampleObject::title).collect(),
        }
    }

    fn apply(&mut self, changes: &ChangeSet, window: &ResultWindow<SampleObject>) {
        if changes.section != 1 {
            return;
        }
        let start = window.start();
        let mut deletions = changes.deletions.clone();
        deletions.sort_by(|a, b| b.item.cmp(&a.item));
        for address in deletions {
            self.rows.remove(address.item);
        }
        for address in &changes.insertions {
            if let Some(object) = window.get(address.item - start) {
                self.rows.insert(address.item, object.title());
            }
        }
        for address in &changes.modifications {
            if let Some(object) = window.get(address.item - start) {
                self.rows[address.item] = object.title();
            }
        }
    }

    fn print(&self) {
        println!("Section 0: {:?}", self.actions);
        println!("Section 1: {:?}", self.rows);
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SampleObject {
    id: i64,
    name: Option<String>,
}

impl SampleObject {
    fn new(id: i64, name: String) -> Self {
        Self {
            id,
            name: Some(name),
        }
    }

    fn title(&self) -> String {
        self.name.clone().unwrap_or_default()
    }
}

impl Identified for SampleObject {
    type Id = i64;

    fn id(&self) -> i64 {
        self.id
    }
}

impl Record for SampleObject {
    const TABLE: &'static str = "sample_object";
    const PRIMARY_KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "name"];
    const DEFINITION: &'static str = "id INTEGER PRIMARY KEY, name TEXT";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            self.name.clone().map_or(Value::Null, Value::Text),
        ]
    }

    fn primary_key(&self) -> Value {
        Value::Integer(self.id)
    }
}

struct SampleLifecycle;

impl Lifecycle for SampleLifecycle {
    fn migrate(&self, _: &Database, _: u64) -> Result<(), sqlite::Error> {
        Ok(())
    }

    fn delete_all(&self, database: &Database) -> Result<(), sqlite::Error> {
        database.delete_all::<SampleObject>()?;
        Ok(())
    }

    fn recover(&self) {
        println!("Database was recreated");
    }
}
