use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use super::AuthContext;
use crate::app::AppState;
use crate::domain::Actor;
use crate::error::{ApiResult, ErrorResponse};
use crate::middleware::RequestIdExt;

/// Extractor that requires a valid bearer JWT.
///
/// ```ignore
/// async fn handler(auth: RequireAuth) -> ApiResult<Json<Budget>> {
///     let actor = auth.actor()?;
///     ...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequireAuth(pub AuthContext);

impl std::ops::Deref for RequireAuth {
    type Target = AuthContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl RequireAuth {
    pub fn actor(&self) -> ApiResult<Actor> {
        self.0.actor()
    }
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidFormat,
    InvalidToken { request_id: Option<String> },
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (message, request_id) = match self {
            AuthError::MissingToken => ("Missing authorization token", None),
            AuthError::InvalidFormat => ("Invalid authorization format", None),
            AuthError::InvalidToken { request_id } => ("Invalid or expired token", request_id),
        };

        let body = ErrorResponse {
            code: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
            details: None,
            request_id,
        };

        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::MissingToken)?
            .to_str()
            .map_err(|_| AuthError::InvalidFormat)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidFormat)?;

        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let request_id = parts.headers.request_id().map(str::to_string);

        let claims = state.jwks_cache.verify_token(token).await.map_err(|e| {
            tracing::warn!(error = %e, request_id = ?request_id, "JWT verification failed");
            AuthError::InvalidToken {
                request_id: request_id.clone(),
            }
        })?;

        let context = AuthContext::from_claims(&claims).map_err(|e| {
            tracing::warn!(error = %e, request_id = ?request_id, "Failed to build auth context");
            AuthError::InvalidToken {
                request_id: request_id.clone(),
            }
        })?;

        Ok(RequireAuth(context))
    }
}
