//! The conflict-dialog seam (§4.5 DOWNLOAD step). Deciding what to show and
//! how the user answers is a UI concern, out of scope here (§1); the engine
//! only needs somewhere to await the answer.

use async_trait::async_trait;
use opsync_core::Operation;

/// Raised when a downloaded batch, after the import filter, still contains
/// ops that are concurrent with the client's own latest full-state op — the
/// client cannot silently pick a side.
#[derive(Debug, Clone)]
pub struct LocalDataConflict {
    /// The remote ops that triggered the conflict, for display.
    pub conflicting_remote_ops: Vec<Operation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    UseLocal,
    UseRemote,
    Cancel,
}

#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: LocalDataConflict) -> ConflictChoice;
}

/// Resolver for unattended/server contexts where a dialog can never be
/// shown: always cancels rather than silently picking a side.
pub struct AlwaysCancelResolver;

#[async_trait]
impl ConflictResolver for AlwaysCancelResolver {
    async fn resolve(&self, _conflict: LocalDataConflict) -> ConflictChoice {
        ConflictChoice::Cancel
    }
}
