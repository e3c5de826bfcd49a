//! Stable, device-unique identifiers used throughout causality tracking.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable, device-unique opaque identifier issued once per device and
/// never reused. Ordered so it can key a `BTreeMap` deterministically, which
/// matters for vector clock pruning tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Builds a `ClientId`, rejecting the empty string.
    pub fn new(value: impl Into<String>) -> Result<Self, ClientIdError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ClientIdError::Empty);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientIdError {
    #[error("client id must not be empty")]
    Empty,
}
