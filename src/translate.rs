//! Translation of raw store changes into window addresses.
//!
//! The store reports changes as indices into the complete result of a query. A window only shows
//! a slice of that result (it may be capped or have been loaded with a limit) and addresses its
//! rows relative to a section and a start offset. [`translate()`] applies a raw change to the
//! slice and returns the addresses the consumer has to update.
//!
//! Steps are applied in a fixed order, each one working on the slice left by the previous one:
//!
//! 1. Deletions are collected first and then removed by identity, since removing by index would
//!    shift the positions of the remaining deletions.
//! 2. Insertions are copied from the post-change result, unless the slice is at capacity.
//! 3. Modifications are resolved by identity against the updated slice.
//!
//! Indices that fall outside of the slice are ignored: they refer to rows the window never
//! materialized.
use crate::change::{Address, ChangeSet, RawChange};
use crate::store::Identified;
use tracing::trace;

/// Addressing information and rows of a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice<T> {
    pub section: usize,
    pub start: usize,
    /// Maximum number of rows, `None` for unbounded.
    pub max: Option<usize>,
    pub items: Vec<T>,
}

impl<T> Slice<T> {
    #[must_use]
    pub fn new(items: Vec<T>, max: Option<usize>) -> Self {
        Self {
            section: 0,
            start: 0,
            max,
            items,
        }
    }

    #[must_use]
    pub fn address(&self, local_index: usize) -> Address {
        Address::new(self.section, self.start + local_index)
    }

    /// Whether no more rows can be added without exceeding `max`.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.max.is_some_and(|max| self.items.len() >= max)
    }

    /// Whether `additional` rows can be added without exceeding `max`.
    #[must_use]
    pub fn has_room_for(&self, additional: usize) -> bool {
        match self.max {
            Some(max) => self.items.len() + additional <= max,
            None => true,
        }
    }
}

/// Apply `raw` to `slice` and return the translated changes.
///
/// `results` is the complete query result after the change; inserted and modified rows are
/// copied from it.
pub fn translate<T: Identified + Clone>(
    slice: &mut Slice<T>,
    raw: &RawChange,
    results: &[T],
) -> ChangeSet {
    let mut changes = ChangeSet::new(slice.section);
    apply_deletions(slice, &raw.deletions, &mut changes.deletions);
    apply_insertions(slice, &raw.insertions, results, &mut changes.insertions);
    apply_modifications(slice, &raw.modifications, results, &mut changes.modifications);
    changes
}

fn apply_deletions<T: Identified>(
    slice: &mut Slice<T>,
    deletions: &[usize],
    addresses: &mut Vec<Address>,
) {
    let mut removed = Vec::with_capacity(deletions.len());
    for &index in deletions {
        let Some(item) = slice.items.get(index) else {
            trace!("Ignoring deletion at {index}, outside of window");
            continue;
        };
        removed.push(item.id());
        addresses.push(slice.address(index));
    }

    for id in removed {
        if let Some(position) = slice.items.iter().position(|item| item.id() == id) {
            slice.items.remove(position);
        }
    }
}

fn apply_insertions<T: Identified + Clone>(
    slice: &mut Slice<T>,
    insertions: &[usize],
    results: &[T],
    addresses: &mut Vec<Address>,
) {
    for &index in insertions {
        if slice.is_full() {
            trace!("Ignoring insertion at {index}, window is full");
            continue;
        }
        if index > slice.items.len() {
            trace!("Ignoring insertion at {index}, outside of window");
            continue;
        }
        let Some(item) = results.get(index) else {
            trace!("Ignoring insertion at {index}, not present in results");
            continue;
        };
        slice.items.insert(index, item.clone());
        addresses.push(slice.address(index));
    }
}

fn apply_modifications<T: Identified + Clone>(
    slice: &mut Slice<T>,
    modifications: &[usize],
    results: &[T],
    addresses: &mut Vec<Address>,
) {
    for &index in modifications {
        let Some(item) = slice.items.get(index) else {
            continue;
        };
        let id = item.id();
        let Some(position) = slice.items.iter().position(|item| item.id() == id) else {
            continue;
        };
        // Rows are owned copies, pick up the new version of the record.
        if let Some(fresh) = results.get(index).filter(|fresh| fresh.id() == id) {
            slice.items[position] = fresh.clone();
        }
        addresses.push(slice.address(position));
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{translate, Slice};
    use crate::change::{Address, RawChange};
    use crate::store::Identified;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct Item {
        pub id: u32,
        pub label: &'static str,
    }

    impl Identified for Item {
        type Id = u32;

        fn id(&self) -> u32 {
            self.id
        }
    }

    pub(crate) fn item(id: u32) -> Item {
        Item { id, label: "" }
    }

    pub(crate) fn items(ids: &[u32]) -> Vec<Item> {
        ids.iter().copied().map(item).collect()
    }

    fn ids(slice: &Slice<Item>) -> Vec<u32> {
        slice.items.iter().map(|i| i.id).collect()
    }

    fn raw(deletions: &[usize], insertions: &[usize], modifications: &[usize]) -> RawChange {
        RawChange {
            deletions: deletions.to_vec(),
            insertions: insertions.to_vec(),
            modifications: modifications.to_vec(),
        }
    }

    #[test]
    fn deletion_is_translated_to_section_address() {
        let mut slice = Slice::new(items(&[1, 2, 3]), None);
        slice.section = 1;

        let changes = translate(&mut slice, &raw(&[1], &[], &[]), &items(&[1, 3]));

        assert_eq!(ids(&slice), vec![1, 3]);
        assert_eq!(changes.section, 1);
        assert_eq!(changes.deletions, vec![Address::new(1, 1)]);
        assert!(changes.insertions.is_empty());
        assert!(changes.modifications.is_empty());
    }

    #[test]
    fn insertion_into_empty_window() {
        let mut slice = Slice::new(Vec::new(), None);
        slice.section = 2;

        let changes = translate(&mut slice, &raw(&[], &[0], &[]), &items(&[7]));

        assert_eq!(ids(&slice), vec![7]);
        assert_eq!(changes.insertions, vec![Address::new(2, 0)]);
    }

    #[test]
    fn insertion_is_skipped_when_window_is_full() {
        let mut slice = Slice::new(items(&[1, 2]), Some(2));

        let changes = translate(&mut slice, &raw(&[], &[0], &[]), &items(&[3, 1, 2]));

        assert_eq!(ids(&slice), vec![1, 2]);
        assert!(changes.is_empty());
    }

    #[test]
    fn deletions_free_capacity_for_insertions() {
        let mut slice = Slice::new(items(&[1, 2]), Some(2));

        let changes = translate(&mut slice, &raw(&[0], &[0, 1], &[]), &items(&[3, 4, 2]));

        // Only one slot was freed.
        assert_eq!(ids(&slice), vec![3, 2]);
        assert_eq!(changes.deletions, vec![Address::new(0, 0)]);
        assert_eq!(changes.insertions, vec![Address::new(0, 0)]);
    }

    #[test]
    fn addresses_include_start_offset() {
        let mut slice = Slice::new(items(&[1, 2, 3]), None);
        slice.section = 3;
        slice.start = 10;

        let changes = translate(&mut slice, &raw(&[0, 2], &[1], &[0]), &items(&[2, 9]));

        assert_eq!(ids(&slice), vec![2, 9]);
        assert_eq!(
            changes.deletions,
            vec![Address::new(3, 10), Address::new(3, 12)]
        );
        assert_eq!(changes.insertions, vec![Address::new(3, 11)]);
        assert_eq!(changes.modifications, vec![Address::new(3, 10)]);
    }

    #[test]
    fn deletions_then_insertions_follow_store_order() {
        // Store goes from [1, 2, 3, 4] to [1, 3, 5, 4, 6].
        let mut slice = Slice::new(items(&[1, 2, 3, 4]), None);

        let changes = translate(
            &mut slice,
            &raw(&[1], &[2, 4], &[]),
            &items(&[1, 3, 5, 4, 6]),
        );

        assert_eq!(ids(&slice), vec![1, 3, 5, 4, 6]);
        assert_eq!(changes.deletions, vec![Address::new(0, 1)]);
        assert_eq!(
            changes.insertions,
            vec![Address::new(0, 2), Address::new(0, 4)]
        );
    }

    #[test]
    fn out_of_range_indices_are_ignored() {
        // Window only materialized the first two rows of the store.
        let mut slice = Slice::new(items(&[1, 2]), None);

        let changes = translate(&mut slice, &raw(&[5], &[7], &[4]), &items(&[1, 2]));

        assert_eq!(ids(&slice), vec![1, 2]);
        assert!(changes.is_empty());
    }

    #[test]
    fn insertion_missing_from_results_is_ignored() {
        let mut slice = Slice::new(items(&[1]), None);

        let changes = translate(&mut slice, &raw(&[], &[1], &[]), &items(&[1]));

        assert_eq!(ids(&slice), vec![1]);
        assert!(changes.insertions.is_empty());
    }

    #[test]
    fn modification_refreshes_row() {
        let mut slice = Slice::new(items(&[1, 2]), None);
        let updated = vec![
            item(1),
            Item {
                id: 2,
                label: "updated",
            },
        ];

        let changes = translate(&mut slice, &raw(&[], &[], &[1]), &updated);

        assert_eq!(changes.modifications, vec![Address::new(0, 1)]);
        assert_eq!(slice.items[1].label, "updated");
    }

    #[test]
    fn modification_after_deletion_uses_new_position() {
        // Store goes from [1, 2, 3] to [1, 3'] where 3 was modified.
        let mut slice = Slice::new(items(&[1, 2, 3]), None);
        let updated = vec![
            item(1),
            Item {
                id: 3,
                label: "three",
            },
        ];

        let changes = translate(&mut slice, &raw(&[1], &[], &[1]), &updated);

        assert_eq!(ids(&slice), vec![1, 3]);
        assert_eq!(changes.deletions, vec![Address::new(0, 1)]);
        assert_eq!(changes.modifications, vec![Address::new(0, 1)]);
        assert_eq!(slice.items[1].label, "three");
    }

    #[test]
    fn capped_window_never_exceeds_max() {
        const MAX: usize = 3;
        let mut slice = Slice::new(Vec::new(), Some(MAX));
        let mut store: Vec<Item> = Vec::new();
        let mut next_id = 0;

        for round in 0..50usize {
            let mut change = RawChange::default();
            if round % 3 == 2 && !store.is_empty() {
                let index = round % store.len();
                store.remove(index);
                change.deletions.push(index);
            }
            for _ in 0..(round % 4) {
                let index = (round * 7) % (store.len() + 1);
                store.insert(index, item(next_id));
                next_id += 1;
                // Insertions are reported in post-change order.
                for existing in &mut change.insertions {
                    if *existing >= index {
                        *existing += 1;
                    }
                }
                change.insertions.push(index);
            }
            change.insertions.sort_unstable();

            translate(&mut slice, &change, &store);
            assert!(slice.items.len() <= MAX, "round {round}");
        }
    }

    #[test]
    fn has_room_for_respects_max() {
        let slice = Slice::new(items(&[1, 2]), Some(3));
        assert!(slice.has_room_for(1));
        assert!(!slice.has_room_for(2));
        assert!(!slice.is_full());

        let unbounded = Slice::new(items(&[1, 2]), None);
        assert!(unbounded.has_room_for(100));
        assert!(!unbounded.is_full());
    }
}
