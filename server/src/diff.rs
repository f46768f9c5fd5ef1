//! State Diff Engine. Component state is a flat mapping from string keys to JSON
//! values, so a minimal patch only ever needs depth-1 JSON Pointers: `/key`. A key
//! present in both snapshots with an unequal value is a `replace`; a key only in the new
//! snapshot is an `add`; a key only in the old snapshot is a `remove`.

use serde_json::Value as Json;

use crate::protocol::PatchOp;

/// Compute the minimal patch from `before` to `after`. Both must be
/// JSON objects (component state is always a map); anything else
/// diffs as a single whole-document replace at the root.
pub fn diff(before: &Json, after: &Json) -> Vec<PatchOp> {
    let (Json::Object(before), Json::Object(after)) = (before, after) else {
        return vec![PatchOp::Replace {
            path: String::new(),
            value: after.clone(),
        }];
    };

    let mut ops = Vec::new();

    for (key, old_value) in before {
        match after.get(key) {
            None => ops.push(PatchOp::Remove {
                path: format!("/{key}"),
            }),
            Some(new_value) if new_value != old_value => ops.push(PatchOp::Replace {
                path: format!("/{key}"),
                value: new_value.clone(),
            }),
            Some(_) => {}
        }
    }

    for (key, new_value) in after {
        if !before.contains_key(key) {
            ops.push(PatchOp::Add {
                path: format!("/{key}"),
                value: new_value.clone(),
            });
        }
    }

    ops
}

/// Whether the serialized patch is too large relative to full state,
/// in which case a full resync should be sent instead.
pub fn patch_exceeds_threshold(patch: &[PatchOp], full_state: &Json) -> bool {
    let patch_len = serde_json::to_string(patch).map(|s| s.len()).unwrap_or(usize::MAX);
    let full_len = serde_json::to_string(full_state).map(|s| s.len()).unwrap_or(1);
    patch_len as f64 > full_len as f64 * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counter_increment_produces_single_replace() {
        let before = json!({"count": 5});
        let after = json!({"count": 8});
        let ops = diff(&before, &after);
        assert_eq!(
            ops,
            vec![PatchOp::Replace {
                path: "/count".into(),
                value: json!(8)
            }]
        );
    }

    #[test]
    fn no_change_yields_empty_patch() {
        let before = json!({"count": 5, "label": "a"});
        let after = before.clone();
        assert!(diff(&before, &after).is_empty());
    }

    #[test]
    fn added_and_removed_keys_are_tracked_independently() {
        let before = json!({"a": 1, "b": 2});
        let after = json!({"b": 2, "c": 3});
        let mut ops = diff(&before, &after);
        ops.sort_by_key(|op| match op {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => {
                path.clone()
            }
        });
        assert_eq!(
            ops,
            vec![
                PatchOp::Remove { path: "/a".into() },
                PatchOp::Add {
                    path: "/c".into(),
                    value: json!(3)
                },
            ]
        );
    }

    #[test]
    fn large_patch_triggers_full_resync_threshold() {
        let before = json!({"blob": "x"});
        let after = json!({"blob": "y".repeat(1000)});
        let ops = diff(&before, &after);
        assert!(patch_exceeds_threshold(&ops, &after));
    }

    #[test]
    fn small_patch_stays_under_threshold() {
        let before = json!({"count": 1, "padding": "z".repeat(1000)});
        let after = json!({"count": 2, "padding": "z".repeat(1000)});
        let ops = diff(&before, &after);
        assert!(!patch_exceeds_threshold(&ops, &after));
    }
}
