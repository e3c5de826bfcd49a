//! Domain model and pure algorithms for the operation-log sync core: vector
//! clocks, the operation codec, and the sync import filter. No I/O; callers
//! in `opsync-storage-sqlite`, `opsync-sync-server`, and `opsync-sync-client`
//! build durable and networked behavior on top of these types.

pub mod client_id;
pub mod codec;
pub mod error;
pub mod import_filter;
pub mod operation;
pub mod store;
pub mod vector_clock;
pub mod wire;

pub use client_id::ClientId;
pub use error::{Result, SyncError};
pub use operation::{
    ApplicationStatus, ImportBackup, ImportReason, OpSource, OpType, Operation, OperationLogEntry,
    StateSnapshot, StoredOperation, UserSyncState,
};
pub use store::OperationLogStore;
pub use vector_clock::{ClockOrdering, VectorClock, DEFAULT_MAX_VC_SIZE};
