//! Content fingerprinting for duplicate detection

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::record::{DataType, Location};

/// Render a JSON value with recursively sorted object keys.
///
/// Two payloads carrying the same fields render identically regardless of
/// the field order they were captured with.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields = keys
                .iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        Value::String((*key).clone()),
                        canonical_json(&map[key.as_str()])
                    )
                })
                .collect::<Vec<String>>()
                .join(",");
            format!("{{{fields}}}")
        }
        Value::Array(items) => {
            let rendered = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<String>>()
                .join(",");
            format!("[{rendered}]")
        }
        other => other.to_string(),
    }
}

/// Derive the deduplication fingerprint for a capture.
///
/// Full-length SHA-256 hex over the capture timestamp, data type, canonical
/// content, and coordinates. Identical logical submissions always hash to
/// the same value; the remote collaborator uses it as its idempotency key
/// so an at-least-once redelivery is safe.
#[must_use]
pub fn content_fingerprint(
    captured_at: DateTime<Utc>,
    data_type: &DataType,
    content: &Value,
    location: Location,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(captured_at.timestamp_millis().to_le_bytes());
    hasher.update(data_type.as_str().as_bytes());
    hasher.update(canonical_json(content).as_bytes());
    hasher.update(location.latitude.to_le_bytes());
    hasher.update(location.longitude.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});

        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn fingerprint_is_stable_across_field_order() {
        let captured_at = Utc::now();
        let location = Location::new(-8.8, 13.2);
        let first = content_fingerprint(
            captured_at,
            &DataType::Observation,
            &json!({"species": "Tursiops truncatus", "count": 3}),
            location,
        );
        let second = content_fingerprint(
            captured_at,
            &DataType::Observation,
            &json!({"count": 3, "species": "Tursiops truncatus"}),
            location,
        );

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn fingerprint_differs_on_any_component() {
        let captured_at = Utc::now();
        let content = json!({"species": "Sardinella aurita"});
        let base = content_fingerprint(
            captured_at,
            &DataType::Observation,
            &content,
            Location::new(-8.8, 13.2),
        );

        let other_type = content_fingerprint(
            captured_at,
            &DataType::Sample,
            &content,
            Location::new(-8.8, 13.2),
        );
        let other_position = content_fingerprint(
            captured_at,
            &DataType::Observation,
            &content,
            Location::new(-8.8, 13.3),
        );

        assert_ne!(base, other_type);
        assert_ne!(base, other_position);
    }
}
