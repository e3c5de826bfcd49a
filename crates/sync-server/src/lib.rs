//! Server-side authority for the operation-log sync protocol (§4.7): one
//! physical SQLite database per user, conflict detection against the
//! latest stored op per entity, and `serverSeq` paging for `getOpsSince`.
//!
//! Mirrors `opsync-storage-sqlite`'s Diesel + r2d2 + single-writer-thread
//! shape, generalized from "one fixed database" to "one database per user,
//! opened lazily and cached".

pub mod db;
pub mod error;
pub mod model;
pub mod schema;
pub mod service;

pub use error::{Result, ServerError};
pub use service::{ServerSyncService, DEFAULT_QUOTA_BYTES};
