//! Keyed list diffing for collection snapshots.
//!
//! Compares two snapshots by identity and reports which positions left and
//! which arrived. Delete indices address the old list, insert indices the new
//! list, both ascending, so a renderer can replay them as batched removals
//! followed by batched insertions. An element whose key survives is never
//! reported, even if it moved or its payload changed.

use std::hash::Hash;

use rustc_hash::FxHashSet;

use crate::entity::Entity;

/// Index-level edits between two snapshots of a keyed list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListDiff {
    /// Positions in the old list whose key is absent from the new list.
    pub deletes: Vec<usize>,
    /// Positions in the new list whose key is absent from the old list.
    pub inserts: Vec<usize>,
}

impl ListDiff {
    /// True when both snapshots hold exactly the same keys.
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }

    /// Total number of edits.
    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len()
    }
}

/// Diff two slices by an extracted identity key.
///
/// Runs in O(old + new) with two hash sets. Duplicate keys within one slice
/// are collapsed to their first occurrence.
pub fn diff_keyed<'a, T, K, F>(old: &'a [T], new: &'a [T], key: F) -> ListDiff
where
    K: Hash + Eq,
    F: Fn(&'a T) -> K,
{
    let old_keys: FxHashSet<K> = old.iter().map(&key).collect();
    let new_keys: FxHashSet<K> = new.iter().map(&key).collect();

    let mut diff = ListDiff::default();
    for (index, item) in old.iter().enumerate() {
        if !new_keys.contains(&key(item)) {
            diff.deletes.push(index);
        }
    }
    for (index, item) in new.iter().enumerate() {
        if !old_keys.contains(&key(item)) {
            diff.inserts.push(index);
        }
    }
    diff
}

/// Diff two entity snapshots by their cache keys.
pub fn diff_entities<T: Entity>(old: &[T], new: &[T]) -> ListDiff {
    diff_keyed(old, new, |entity| entity.key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{user_json, TestUser};
    use crate::Entity;

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn diff_strs(old: &[&str], new: &[&str]) -> ListDiff {
        diff_keyed(&keys(old), &keys(new), |s| s.clone())
    }

    #[test]
    fn test_identical_lists_produce_no_edits() {
        let diff = diff_strs(&["a", "b", "c"], &["a", "b", "c"]);
        assert!(diff.is_empty());
        assert_eq!(diff.len(), 0);
    }

    #[test]
    fn test_disjoint_lists_replace_everything() {
        let diff = diff_strs(&["a", "b"], &["x", "y"]);
        assert_eq!(diff.deletes, vec![0, 1]);
        assert_eq!(diff.inserts, vec![0, 1]);
    }

    #[test]
    fn test_shifted_window() {
        // b and c survive the shift, so only the edges are edits.
        let diff = diff_strs(&["a", "b", "c"], &["b", "c", "d"]);
        assert_eq!(diff.deletes, vec![0]);
        assert_eq!(diff.inserts, vec![2]);
    }

    #[test]
    fn test_empty_old_inserts_all() {
        let diff = diff_strs(&[], &["a", "b"]);
        assert_eq!(diff.deletes, Vec::<usize>::new());
        assert_eq!(diff.inserts, vec![0, 1]);
    }

    #[test]
    fn test_empty_new_deletes_all() {
        let diff = diff_strs(&["a", "b"], &[]);
        assert_eq!(diff.deletes, vec![0, 1]);
        assert_eq!(diff.inserts, Vec::<usize>::new());
    }

    #[test]
    fn test_moved_element_is_not_an_edit() {
        let diff = diff_strs(&["a", "b", "c"], &["c", "a", "b"]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_entities_diff_by_key_not_payload() {
        let old = vec![
            TestUser::decode("u1", &user_json("Ada", 1)).unwrap(),
            TestUser::decode("u2", &user_json("Bo", 2)).unwrap(),
        ];
        // u1 changed payload but kept its key; u2 left, u3 arrived.
        let new = vec![
            TestUser::decode("u1", &user_json("Ada Lovelace", 9)).unwrap(),
            TestUser::decode("u3", &user_json("Cleo", 3)).unwrap(),
        ];

        let diff = diff_entities(&old, &new);
        assert_eq!(diff.deletes, vec![1]);
        assert_eq!(diff.inserts, vec![1]);
    }
}
