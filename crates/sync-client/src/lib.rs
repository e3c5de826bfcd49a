//! The client half of the operation-log sync engine: a storage- and
//! transport-generic [`engine::ClientSyncEngine`], the encryption envelope,
//! and the wire transport used to reach `apps/server`.

pub mod config;
pub mod conflict;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod http_transport;
pub mod reducer;
pub mod transport;

pub use config::{Backend, EncryptionConfig, SyncConfig};
pub use conflict::{AlwaysCancelResolver, ConflictChoice, ConflictResolver, LocalDataConflict};
pub use crypto::EncryptionEnvelope;
pub use engine::{ClientSyncEngine, SyncOutcome};
pub use error::{ClientSyncError, Result};
pub use http_transport::{HttpSyncTransport, HttpTransportError};
pub use reducer::{NullReducerSink, ReducerError, ReducerSink};
pub use transport::SyncTransport;
