//! Structural YAML merge.

use serde_yaml::Value;

/// Merge `overlay` into `base`, mutating `base` in place.
///
/// Applied recursively node-by-node:
///
/// - mapping vs mapping: overlay keys that exist in base recurse into the
///   paired values; unknown keys are appended after the existing base keys,
///   in overlay order;
/// - sequence vs sequence: overlay items are appended after base's items,
///   no deduplication;
/// - scalars, or any kind mismatch: the overlay value replaces the base
///   value outright.
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Sequence(base), Value::Sequence(overlay)) => {
            base.extend(overlay.iter().cloned());
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
