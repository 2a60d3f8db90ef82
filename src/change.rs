/// Position of a row as seen by the consumer of a [`ResultWindow`](crate::window::ResultWindow).
///
/// `item` is absolute within `section`: it already includes the window's start offset and can be
/// used directly for row deletes, inserts and reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub section: usize,
    pub item: usize,
}

impl Address {
    #[must_use]
    pub fn new(section: usize, item: usize) -> Self {
        Self { section, item }
    }
}

/// Translated changes for one delivery from the store.
///
/// Deletions are expressed against the rows the consumer displayed before the change, insertions
/// and modifications against the rows after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct ChangeSet {
    pub section: usize,
    pub deletions: Vec<Address>,
    pub insertions: Vec<Address>,
    pub modifications: Vec<Address>,
}

impl ChangeSet {
    #[must_use]
    pub fn new(section: usize) -> Self {
        Self {
            section,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.insertions.is_empty() && self.modifications.is_empty()
    }
}

/// Change notification as reported by the store for one live query.
///
/// All values are raw indices into the query's complete result ordering. `deletions` refer to the
/// ordering before the change, `insertions` and `modifications` to the ordering after it. Each
/// list is sorted in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChange {
    pub deletions: Vec<usize>,
    pub insertions: Vec<usize>,
    pub modifications: Vec<usize>,
}

impl RawChange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.insertions.is_empty() && self.modifications.is_empty()
    }
}
