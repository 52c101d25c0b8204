//! Field-map / defaults adaptation for drifted upstream payloads.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use serde::{Deserialize, Serialize};

/// Normalization hints for a drifted response shape.
///
/// `field_map` maps the field name the caller expects to the field name the
/// upstream currently emits; `defaults` fills values the upstream dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaHints {
    #[serde(default)]
    pub field_map: BTreeMap<String, String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
}

impl SchemaHints {
    pub fn is_empty(&self) -> bool {
        self.field_map.is_empty() && self.defaults.is_empty()
    }

    /// Overlays `other` onto `self`, newer entries winning.
    pub fn merge(&mut self, other: &SchemaHints) {
        for (k, v) in &other.field_map {
            self.field_map.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.defaults {
            self.defaults.insert(k.clone(), v.clone());
        }
    }

    /// Extracts hints from a loosely shaped hint object.
    ///
    /// Accepts the aliases the wild emits: `field_map`, `fieldMap`,
    /// `mapping`, `fields`, and `fallbacks` for the map; `defaults` for the
    /// fill values. Returns `None` when nothing usable is present.
    pub fn from_hint_value(value: &Value) -> Option<SchemaHints> {
        let obj = value.as_object()?;
        let mut hints = SchemaHints::default();
        for key in ["field_map", "fieldMap", "mapping", "fields", "fallbacks"] {
            if let Some(map) = obj.get(key).and_then(Value::as_object) {
                for (expected, actual) in map {
                    if let Some(actual) = actual.as_str() {
                        hints.field_map.insert(expected.clone(), actual.to_string());
                    }
                }
                break;
            }
        }
        if let Some(defaults) = obj.get("defaults").and_then(Value::as_object) {
            for (k, v) in defaults {
                hints.defaults.insert(k.clone(), v.clone());
            }
        }
        if hints.is_empty() { None } else { Some(hints) }
    }
}

/// Applies `hints` to `payload`, recursively.
///
/// Arrays are mapped element-wise and non-objects are returned untouched.
/// Field-map entries copy `payload[actual]` into `payload[expected]` without
/// deleting the source; defaults only fill missing or null keys. Applying
/// the same hints twice is a no-op.
pub fn apply(hints: &SchemaHints, payload: Value) -> Value {
    match payload {
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| apply(hints, v)).collect())
        }
        Value::Object(mut obj) => {
            for (expected, actual) in &hints.field_map {
                if let Some(source) = obj.get(actual).cloned() {
                    obj.insert(expected.clone(), source);
                }
            }
            for (key, default) in &hints.defaults {
                let missing = matches!(obj.get(key), None | Some(Value::Null));
                if missing {
                    obj.insert(key.clone(), default.clone());
                }
            }
            Value::Object(recurse_children(hints, obj))
        }
        other => other,
    }
}

fn recurse_children(hints: &SchemaHints, obj: Map<String, Value>) -> Map<String, Value> {
    obj.into_iter()
        .map(|(k, v)| match v {
            Value::Array(_) | Value::Object(_) => (k, apply(hints, v)),
            scalar => (k, scalar),
        })
        .collect()
}
