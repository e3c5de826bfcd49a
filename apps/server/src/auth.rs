//! Bearer-token authentication, injected as a trait object so credential
//! issuance (explicitly out of scope) stays decoupled from the REST layer —
//! the same "interfaced abstractly" treatment the teacher gives its
//! secret-store and event-sink collaborators at the command layer.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::request::Parts,
};

use crate::error::ApiError;

/// Resolves a bearer token to the `user_id` whose sync authority it grants
/// access to. A real deployment would validate against whatever identity
/// provider issues these tokens; that issuer is out of scope here.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, bearer_token: &str) -> Option<String>;
}

/// Fixed token -> user_id table, for tests and single-tenant deployments.
pub struct StaticTokenAuthProvider {
    tokens: std::collections::HashMap<String, String>,
}

impl StaticTokenAuthProvider {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn single(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new([(token.into(), user_id.into())])
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuthProvider {
    async fn authenticate(&self, bearer_token: &str) -> Option<String> {
        self.tokens.get(bearer_token).cloned()
    }
}

/// Extracted from the `Authorization: Bearer <token>` header by
/// [`AuthenticatedUser::from_request_parts`]; handlers take it as an
/// argument to get at the caller's `user_id` without re-parsing headers.
pub struct AuthenticatedUser {
    pub user_id: String,
}

#[async_trait]
impl FromRequestParts<crate::state::AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &crate::state::AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized)?;

        let user_id = state
            .auth
            .authenticate(token)
            .await
            .ok_or(ApiError::Unauthorized)?;

        Ok(AuthenticatedUser { user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_resolves_known_token() {
        let provider = StaticTokenAuthProvider::single("tok-1", "user-1");
        assert_eq!(
            provider.authenticate("tok-1").await,
            Some("user-1".to_string())
        );
    }

    #[tokio::test]
    async fn static_provider_rejects_unknown_token() {
        let provider = StaticTokenAuthProvider::single("tok-1", "user-1");
        assert_eq!(provider.authenticate("tok-2").await, None);
    }
}
