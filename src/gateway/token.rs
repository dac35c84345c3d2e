use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const TOKEN_FIELD: &str = "Token";
const PASSWORD_FIELD: &str = "Password";

/// Provider token: root-level scalar fields plus `Password`, sorted by key,
/// values concatenated, SHA-256, lowercase hex. Nested objects, arrays and
/// the `Token` field itself do not take part.
pub fn sign(fields: &Map<String, Value>, password: &str) -> String {
    let mut sorted: BTreeMap<&str, String> = fields
        .iter()
        .filter(|(key, _)| key.as_str() != TOKEN_FIELD)
        .filter_map(|(key, value)| scalar_text(value).map(|text| (key.as_str(), text)))
        .collect();
    sorted.insert(PASSWORD_FIELD, password.to_string());

    let mut hasher = Sha256::new();
    for value in sorted.values() {
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Adds a `Token` field to an outbound request body.
pub fn attach(fields: &mut Map<String, Value>, password: &str) {
    let token = sign(fields, password);
    fields.insert(TOKEN_FIELD.to_string(), Value::String(token));
}

pub fn verify(fields: &Map<String, Value>, password: &str) -> bool {
    let Some(Value::String(received)) = fields.get(TOKEN_FIELD) else {
        return false;
    };
    let expected = sign(fields, password);
    bool::from(
        expected
            .as_bytes()
            .ct_eq(received.to_ascii_lowercase().as_bytes()),
    )
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
