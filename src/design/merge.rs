//! Pure design-document merge.
//!
//! Combines a stored document with a generated candidate without mutating
//! either, returning the merged document and whether anything changed.
//! Per category (views, filters, shows, lists, update handlers):
//!
//! - a declared entry missing from the stored document is added;
//! - with `force_update`, a declared entry that differs overwrites the
//!   stored one;
//! - otherwise the stored entry wins;
//! - entries only the stored document has are kept.
//!
//! The operation is idempotent: merging the result with the same
//! candidate again changes nothing.

use crate::design::DesignDocument;
use std::collections::BTreeMap;

/// Merge `candidate` into `stored`. Returns `(merged, changed)`.
pub fn merge(
    stored: &DesignDocument,
    candidate: &DesignDocument,
    force_update: bool,
) -> (DesignDocument, bool) {
    let mut merged = stored.clone();
    let mut changed = false;

    changed |= merge_category(&mut merged.views, &candidate.views, force_update);
    changed |= merge_category(&mut merged.filters, &candidate.filters, force_update);
    changed |= merge_category(&mut merged.shows, &candidate.shows, force_update);
    changed |= merge_category(&mut merged.lists, &candidate.lists, force_update);
    changed |= merge_category(&mut merged.updates, &candidate.updates, force_update);

    (merged, changed)
}

fn merge_category<V: Clone + PartialEq>(
    stored: &mut BTreeMap<String, V>,
    declared: &BTreeMap<String, V>,
    force_update: bool,
) -> bool {
    let mut changed = false;
    for (name, entry) in declared {
        match stored.get(name) {
            None => {
                stored.insert(name.clone(), entry.clone());
                changed = true;
            }
            Some(existing) if force_update && existing != entry => {
                stored.insert(name.clone(), entry.clone());
                changed = true;
            }
            Some(_) => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with_view(id: &str, name: &str, map: &str) -> DesignDocument {
        let mut doc = DesignDocument::new(id);
        doc.views.insert(name.into(), json!({"map": map}));
        doc
    }

    #[test]
    fn test_adds_missing_entries() {
        let stored = doc_with_view("_design/T", "old", "m1");
        let candidate = doc_with_view("_design/T", "new", "m2");

        let (merged, changed) = merge(&stored, &candidate, false);
        assert!(changed);
        assert!(merged.views.contains_key("old"));
        assert!(merged.views.contains_key("new"));
    }

    #[test]
    fn test_stored_entry_wins_without_force() {
        let stored = doc_with_view("_design/T", "all", "stored-map");
        let candidate = doc_with_view("_design/T", "all", "declared-map");

        let (merged, changed) = merge(&stored, &candidate, false);
        assert!(!changed);
        assert_eq!(merged.views["all"], json!({"map": "stored-map"}));
    }

    #[test]
    fn test_force_overwrites_differing_entry() {
        let stored = doc_with_view("_design/T", "all", "stored-map");
        let candidate = doc_with_view("_design/T", "all", "declared-map");

        let (merged, changed) = merge(&stored, &candidate, true);
        assert!(changed);
        assert_eq!(merged.views["all"], json!({"map": "declared-map"}));
    }

    #[test]
    fn test_force_leaves_identical_entry_untouched() {
        let stored = doc_with_view("_design/T", "all", "same");
        let candidate = doc_with_view("_design/T", "all", "same");

        let (_, changed) = merge(&stored, &candidate, true);
        assert!(!changed);
    }

    #[test]
    fn test_stored_only_entries_kept() {
        let mut stored = doc_with_view("_design/T", "all", "m");
        stored
            .filters
            .insert("legacy".into(), "function(d, r) {}".into());
        let candidate = DesignDocument::new("_design/T");

        let (merged, changed) = merge(&stored, &candidate, true);
        assert!(!changed);
        assert!(merged.filters.contains_key("legacy"));
    }

    #[test]
    fn test_unrelated_keys_survive() {
        let mut stored = DesignDocument::new("_design/T");
        stored
            .extra
            .insert("validate_doc_update".into(), json!("function() {}"));
        let candidate = doc_with_view("_design/T", "all", "m");

        let (merged, _) = merge(&stored, &candidate, false);
        assert_eq!(merged.extra["validate_doc_update"], json!("function() {}"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut stored = doc_with_view("_design/T", "kept", "m0");
        stored.lists.insert("l".into(), "f1".into());
        let mut candidate = doc_with_view("_design/T", "kept", "m9");
        candidate.shows.insert("s".into(), "f2".into());

        for force in [false, true] {
            let (once, _) = merge(&stored, &candidate, force);
            let (twice, changed_again) = merge(&once, &candidate, force);
            assert_eq!(once, twice);
            assert!(!changed_again);
        }
    }

    #[test]
    fn test_all_categories_merge() {
        let stored = DesignDocument::new("_design/T");
        let mut candidate = DesignDocument::new("_design/T");
        candidate.views.insert("v".into(), json!({"map": "m"}));
        candidate.filters.insert("f".into(), "src".into());
        candidate.shows.insert("s".into(), "src".into());
        candidate.lists.insert("l".into(), "src".into());
        candidate.updates.insert("u".into(), "src".into());

        let (merged, changed) = merge(&stored, &candidate, false);
        assert!(changed);
        assert!(merged.views.contains_key("v"));
        assert!(merged.filters.contains_key("f"));
        assert!(merged.shows.contains_key("s"));
        assert!(merged.lists.contains_key("l"));
        assert!(merged.updates.contains_key("u"));
    }
}
