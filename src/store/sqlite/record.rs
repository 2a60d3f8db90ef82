use crate::store::Identified;
use rusqlite::types::Value;
use rusqlite::Row;

/// A type stored in its own table.
///
/// # Example
///
/// ```rust
/// use rusqlite::types::Value;
/// use rusqlite::Row;
/// use sqlite_live_window::store::Identified;
/// use sqlite_live_window::store::sqlite::Record;
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Note {
///     id: i64,
///     text: String,
/// }
///
/// impl Identified for Note {
///     type Id = i64;
///
///     fn id(&self) -> i64 {
///         self.id
///     }
/// }
///
/// impl Record for Note {
///     const TABLE: &'static str = "note";
///     const PRIMARY_KEY: &'static str = "id";
///     const COLUMNS: &'static [&'static str] = &["id", "text"];
///     const DEFINITION: &'static str = "id INTEGER PRIMARY KEY, text TEXT NOT NULL";
///
///     fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
///         Ok(Self {
///             id: row.get("id")?,
///             text: row.get("text")?,
///         })
///     }
///
///     fn to_values(&self) -> Vec<Value> {
///         vec![Value::Integer(self.id), Value::Text(self.text.clone())]
///     }
///
///     fn primary_key(&self) -> Value {
///         Value::Integer(self.id)
///     }
/// }
/// ```
pub trait Record: Identified + Clone + PartialEq + Send + Sync + 'static {
    const TABLE: &'static str;
    const PRIMARY_KEY: &'static str;
    /// Columns in the order returned by [`Record::to_values()`].
    const COLUMNS: &'static [&'static str];
    /// Column definitions used when creating the table.
    const DEFINITION: &'static str;

    /// Build a record from a row selected with [`Record::COLUMNS`].
    ///
    /// # Errors
    ///
    /// Should return error if a column is missing or has an unexpected type.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    fn to_values(&self) -> Vec<Value>;

    fn primary_key(&self) -> Value;

    #[must_use]
    fn record_type() -> RecordType {
        RecordType {
            table: Self::TABLE,
            definition: Self::DEFINITION,
        }
    }
}

/// Table description of a [`Record`], used to create the schema of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct RecordType {
    pub table: &'static str,
    pub definition: &'static str,
}

impl RecordType {
    pub(crate) fn create_table_query(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS `{}` ({})",
            self.table, self.definition
        )
    }
}

pub(crate) fn select_query<T: Record>() -> String {
    let columns = T::COLUMNS
        .iter()
        .map(|c| format!("`{c}`"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {columns} FROM `{}`", T::TABLE)
}

pub(crate) fn upsert_query<T: Record>() -> String {
    let columns = T::COLUMNS
        .iter()
        .map(|c| format!("`{c}`"))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=T::COLUMNS.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT OR REPLACE INTO `{}` ({columns}) VALUES ({placeholders})",
        T::TABLE
    )
}

pub(crate) fn delete_query<T: Record>() -> String {
    format!("DELETE FROM `{}` WHERE `{}` = ?1", T::TABLE, T::PRIMARY_KEY)
}

pub(crate) fn delete_all_query<T: Record>() -> String {
    format!("DELETE FROM `{}`", T::TABLE)
}

#[cfg(test)]
pub(crate) mod test {
    use super::{select_query, upsert_query, Record};
    use crate::store::Identified;
    use rusqlite::types::Value;
    use rusqlite::Row;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct Sample {
        pub id: i64,
        pub name: String,
    }

    impl Sample {
        pub(crate) fn new(id: i64, name: &str) -> Self {
            Self {
                id,
                name: name.to_owned(),
            }
        }
    }

    impl Identified for Sample {
        type Id = i64;

        fn id(&self) -> i64 {
            self.id
        }
    }

    impl Record for Sample {
        const TABLE: &'static str = "sample";
        const PRIMARY_KEY: &'static str = "id";
        const COLUMNS: &'static [&'static str] = &["id", "name"];
        const DEFINITION: &'static str = "id INTEGER PRIMARY KEY, name TEXT NOT NULL";

        fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
            Ok(Self {
                id: row.get("id")?,
                name: row.get("name")?,
            })
        }

        fn to_values(&self) -> Vec<Value> {
            vec![Value::Integer(self.id), Value::Text(self.name.clone())]
        }

        fn primary_key(&self) -> Value {
            Value::Integer(self.id)
        }
    }

    #[test]
    fn queries_list_columns() {
        assert_eq!(
            select_query::<Sample>(),
            "SELECT `id`, `name` FROM `sample`"
        );
        assert_eq!(
            upsert_query::<Sample>(),
            "INSERT OR REPLACE INTO `sample` (`id`, `name`) VALUES (?1, ?2)"
        );
        assert_eq!(
            Sample::record_type().create_table_query(),
            "CREATE TABLE IF NOT EXISTS `sample` (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"
        );
    }
}
