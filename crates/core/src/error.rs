//! Shared error taxonomy for the domain model. Storage, server, and client
//! crates each define their own `thiserror` enum and convert into it from
//! `SyncError` via `#[from]`, rather than reaching for `anyhow` erasure.

use crate::client_id::ClientIdError;
use crate::codec::CodecError;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    ClientId(#[from] ClientIdError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
