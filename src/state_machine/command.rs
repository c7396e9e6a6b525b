//! Write commands replicated through the log
//!
//! A command is a JSON record `{"key": ..., "value": ...}`. A `null` or
//! missing value means delete. The encoding is self-describing so any node
//! can decode historical entries it never saw live.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed command record: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Upsert (value present) or delete (value absent) of a single key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

impl Command {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command {
            key: key.into(),
            value: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }

    pub fn into_parts(self) -> (String, Option<String>) {
        (self.key, self.value)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_put_wire_format() {
        let bytes = Command::put("a", "1").encode().unwrap();
        assert_eq!(bytes, br#"{"key":"a","value":"1"}"#);
    }

    #[test]
    fn test_encode_delete_wire_format() {
        let bytes = Command::delete("a").encode().unwrap();
        assert_eq!(bytes, br#"{"key":"a","value":null}"#);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let first = Command::put("greeting", "hello world").encode().unwrap();
        let second = Command::put("greeting", "hello world").encode().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_from_other_producer() {
        // Field order and whitespace differ from what we emit
        let command = Command::decode(br#"{ "value": "v", "key": "k" }"#).unwrap();
        assert_eq!(command, Command::put("k", "v"));
    }

    #[test]
    fn test_missing_value_decodes_as_delete() {
        let command = Command::decode(br#"{"key":"gone"}"#).unwrap();
        assert!(command.is_delete());
        assert_eq!(command.key(), "gone");
    }

    #[test]
    fn test_decode_malformed() {
        let result = Command::decode(b"SET foo bar");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decode_missing_key() {
        let result = Command::decode(br#"{"value":"orphan"}"#);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decode_wrong_value_type() {
        let result = Command::decode(br#"{"key":"k","value":42}"#);
        assert!(result.is_err());
    }
}
