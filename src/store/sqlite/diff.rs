use crate::change::RawChange;
use crate::store::Identified;
use std::collections::HashMap;

/// Compute the raw change between two results of the same query.
///
/// Records are matched by identity. Records only present in `old` are deletions, records only
/// present in `new` are insertions. Records present in both are modifications if their content
/// differs. Records whose relative order changed are reported as a deletion plus an insertion,
/// keeping the largest set of records that did not move in place.
pub(crate) fn diff<T: Identified + PartialEq>(old: &[T], new: &[T]) -> RawChange {
    let old_positions = positions(old);
    let new_positions = positions(new);

    let mut change = RawChange::default();
    for (index, record) in old.iter().enumerate() {
        if !new_positions.contains_key(&record.id()) {
            change.deletions.push(index);
        }
    }
    for (index, record) in new.iter().enumerate() {
        if !old_positions.contains_key(&record.id()) {
            change.insertions.push(index);
        }
    }

    // (new index, old index) of the records present on both sides, in new order.
    let survivors = new
        .iter()
        .enumerate()
        .filter_map(|(new_index, record)| {
            old_positions
                .get(&record.id())
                .map(|&old_index| (new_index, old_index))
        })
        .collect::<Vec<_>>();
    let stable = longest_increasing(&survivors.iter().map(|s| s.1).collect::<Vec<_>>());

    for (&(new_index, old_index), is_stable) in survivors.iter().zip(stable) {
        if !is_stable {
            change.deletions.push(old_index);
            change.insertions.push(new_index);
        } else if old[old_index] != new[new_index] {
            change.modifications.push(new_index);
        }
    }

    change.deletions.sort_unstable();
    change.insertions.sort_unstable();
    change
}

fn positions<T: Identified>(records: &[T]) -> HashMap<T::Id, usize> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| (record.id(), index))
        .collect()
}

/// Mark the elements of one longest strictly increasing subsequence of `sequence`.
fn longest_increasing(sequence: &[usize]) -> Vec<bool> {
    // tails[k] is the index of the smallest tail of an increasing run of length k + 1.
    let mut tails: Vec<usize> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; sequence.len()];
    for (index, &value) in sequence.iter().enumerate() {
        let length = tails.partition_point(|&tail| sequence[tail] < value);
        if length > 0 {
            previous[index] = Some(tails[length - 1]);
        }
        if length == tails.len() {
            tails.push(index);
        } else {
            tails[length] = index;
        }
    }

    let mut keep = vec![false; sequence.len()];
    let mut cursor = tails.last().copied();
    while let Some(index) = cursor {
        keep[index] = true;
        cursor = previous[index];
    }
    keep
}
