//! Shared application state, following the teacher's `#[derive(Clone)]`
//! struct-of-`Arc`s convention so each Axum worker gets a cheap handle
//! rather than its own copy.

use std::sync::Arc;

use crate::auth::AuthProvider;
use opsync_sync_server::ServerSyncService;

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<ServerSyncService>,
    pub auth: Arc<dyn AuthProvider>,
}

impl AppState {
    pub fn new(sync: Arc<ServerSyncService>, auth: Arc<dyn AuthProvider>) -> Self {
        Self { sync, auth }
    }
}
