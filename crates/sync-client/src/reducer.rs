//! The reducer/domain-state seam. Applying a decoded [`Operation`] to
//! task/project/tag state is out of scope (§1); this trait generalizes the
//! teacher's `EntitySyncAdapter::apply_event_lww` to an operation-log shape
//! so `ClientSyncEngine` can dispatch without knowing what it's applying to.

use async_trait::async_trait;
use opsync_core::Operation;
use std::fmt;

#[derive(Debug)]
pub struct ReducerError(pub String);

impl fmt::Display for ReducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ReducerError {}

#[async_trait]
pub trait ReducerSink: Send + Sync {
    async fn apply(&self, op: &Operation) -> Result<(), ReducerError>;
}

/// No-op sink for tests and for backends that only need the log to be
/// correct (e.g. a headless migration tool).
pub struct NullReducerSink;

#[async_trait]
impl ReducerSink for NullReducerSink {
    async fn apply(&self, _op: &Operation) -> Result<(), ReducerError> {
        Ok(())
    }
}
