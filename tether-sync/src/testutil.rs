//! Shared fixtures for unit tests.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::entity::{DecodeError, Entity};

/// Minimal entity used across the crate's tests.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TestUser {
    #[serde(skip)]
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub score: i64,
}

impl Entity for TestUser {
    fn key(&self) -> &str {
        &self.uid
    }

    fn decode(key: &str, raw: &Value) -> Result<Self, DecodeError> {
        let mut user: TestUser = serde_json::from_value(raw.clone())?;
        user.uid = key.to_string();
        Ok(user)
    }
}

/// Payload shaped the way [`TestUser`] expects.
pub fn user_json(name: &str, score: i64) -> Value {
    json!({ "name": name, "score": score })
}
