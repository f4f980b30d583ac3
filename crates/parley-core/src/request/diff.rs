use serde_json::{Map, Value};

use parley_types::request::{ChangeSet, FieldChange, RequestState};

/// Flatten `state` into `field -> value`, with `totals.*` as dotted keys.
///
/// `version` is left out: it changes as a consequence of every diff.
pub(super) fn flatten(state: &RequestState) -> Map<String, Value> {
    let value = match serde_json::to_value(state) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            tracing::warn!(value = %other, "RequestState serialized to a non-object");
            return Map::new();
        }
        Err(err) => {
            tracing::warn!(error = %err, "Failed to serialize RequestState");
            return Map::new();
        }
    };

    let mut flat = Map::new();
    for (key, value) in value {
        match (key.as_str(), value) {
            ("version", _) => {}
            ("totals", Value::Object(totals)) => {
                for (field, value) in totals {
                    flat.insert(format!("totals.{field}"), value);
                }
            }
            (_, value) => {
                flat.insert(key, value);
            }
        }
    }
    flat
}

pub(super) fn diff(before: &Map<String, Value>, after: &Map<String, Value>) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (key, new) in after {
        let old = before.get(key).cloned().unwrap_or(Value::Null);
        if old != *new {
            changes.insert(
                key.clone(),
                FieldChange {
                    old,
                    new: new.clone(),
                },
            );
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn totals_are_flattened_and_version_dropped() {
        let state = RequestState {
            version: 9,
            ..RequestState::default()
        };
        let flat = flatten(&state);
        assert!(!flat.contains_key("version"));
        assert!(!flat.contains_key("totals"));
        assert_eq!(flat["totals.total"], json!(0));
        assert_eq!(flat["is_processing"], json!(false));
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let before = flatten(&RequestState::default());
        let mut state = RequestState::default();
        state.is_processing = true;
        state.totals.total = 1;
        let changes = diff(&before, &flatten(&state));

        assert_eq!(changes.len(), 2);
        assert_eq!(changes["is_processing"].old, json!(false));
        assert_eq!(changes["is_processing"].new, json!(true));
        assert_eq!(changes["totals.total"].new, json!(1));
    }
}
