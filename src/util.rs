use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Prefix marking a JSON string that carries base64 rather than UTF-8 text.
pub const BASE64_PREFIX: &str = "base64:";

/// Render fact bytes as a JSON-friendly string.
///
/// Valid UTF-8 stays readable (and never starts with the base64 prefix);
/// anything else is base64 encoded behind [`BASE64_PREFIX`].
pub fn bytes_to_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.starts_with(BASE64_PREFIX) => text.to_string(),
        _ => format!("{BASE64_PREFIX}{}", STANDARD.encode(bytes)),
    }
}

pub fn text_to_bytes(text: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    match text.strip_prefix(BASE64_PREFIX) {
        Some(encoded) => STANDARD.decode(encoded),
        None => Ok(text.as_bytes().to_vec()),
    }
}

/// Serde adapter for `name -> bytes` fact maps in JSON.
pub mod fact_map {
    use super::{bytes_to_text, text_to_bytes};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(facts: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(facts.iter().map(|(name, value)| (name, bytes_to_text(value))))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(name, value)| {
                text_to_bytes(&value)
                    .map(|bytes| (name, bytes))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

/// Serde adapter for optional byte payloads such as source text.
pub mod opt_bytes {
    use super::{bytes_to_text, text_to_bytes};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&bytes_to_text(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|text| text_to_bytes(&text).map_err(D::Error::custom))
            .transpose()
    }
}
