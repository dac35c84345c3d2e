pub mod client;
pub mod sandbox;
pub mod token;

pub use client::HttpGateway;
pub use sandbox::SandboxGateway;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Provider ids arrive either as JSON strings or as numbers.
pub(crate) fn id_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
