//! The REST surface from §6: `/sync/upload`, `/sync/download`,
//! `/sync/state`, each delegating straight into [`ServerSyncService`].

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use opsync_core::wire::{
    DownloadRequest, DownloadResponse, UploadRequest, UploadResponse, UserSyncStateResponse,
    DOWNLOAD_PAGE_LIMIT,
};

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn sync_routes() -> Router<AppState> {
    Router::new()
        .route("/sync/upload", post(upload))
        .route("/sync/download", get(download))
        .route("/sync/state", get(user_sync_state))
}

async fn upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<UploadRequest>,
) -> ApiResult<Json<UploadResponse>> {
    let results = state
        .sync
        .upload_ops(&user.user_id, &body.client_id, body.ops)
        .await?;
    Ok(Json(UploadResponse { results }))
}

async fn download(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let limit = query.limit.min(DOWNLOAD_PAGE_LIMIT);
    let (ops, max_server_seq) = state
        .sync
        .get_ops_since(&user.user_id, query.since_seq, limit)
        .await?;
    Ok(Json(DownloadResponse {
        ops,
        max_server_seq,
    }))
}

async fn user_sync_state(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<UserSyncStateResponse>> {
    let max_server_seq = state.sync.get_user_sync_state(&user.user_id).await?;
    Ok(Json(UserSyncStateResponse { max_server_seq }))
}
