//! Typed decode boundary for raw remote payloads.
//!
//! The remote store delivers untyped JSON keyed by path segment. Everything
//! downstream (cache, observers, stores) works with typed values, so decoding
//! happens exactly once, here, and a failed decode is an ordinary value that
//! callers drop without tearing anything down.

use serde_json::Value;
use thiserror::Error;

/// String identity of an entity. Doubles as the node key on the remote.
pub type EntityKey = String;

/// Why a raw payload failed to decode.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A semantically required field is absent or empty.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// The payload shape or field types are wrong.
    #[error("invalid payload: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Invalid(err.to_string())
    }
}

/// An identity-keyed value synchronized from the remote store.
///
/// Entities are immutable snapshots: every remote change decodes into a fresh
/// value, never a mutation of a shared one. The node key is passed into
/// [`Entity::decode`] because the remote keys nodes by path segment, not by a
/// field inside the payload.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Identity key of this value.
    fn key(&self) -> &str;

    /// Decode the raw payload observed at `key`.
    fn decode(key: &str, raw: &Value) -> Result<Self, DecodeError>;
}
