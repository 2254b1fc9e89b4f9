//! Authentication extractor.
//!
//! Devices send `Authorization: Bearer <token>`. When `AUTH_SECRET` is set the
//! token must match it; without a secret any request is accepted (development).

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from the request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The bearer token, or `anonymous` when auth is disabled
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        authorize(auth_header, state.config.auth_secret.as_deref())
    }
}

fn authorize(header: Option<&str>, secret: Option<&str>) -> Result<AuthUser, AppError> {
    match (header, secret) {
        (Some(header), secret) => {
            let token = header
                .strip_prefix("Bearer ")
                .ok_or(AppError::Unauthorized("Invalid authorization header format"))?
                .trim();
            if token.is_empty() {
                return Err(AppError::Unauthorized("Empty bearer token"));
            }
            if secret.is_some_and(|s| !constant_time_eq(s.as_bytes(), token.as_bytes())) {
                tracing::warn!("rejected request with invalid token");
                return Err(AppError::Unauthorized("Invalid token"));
            }
            Ok(AuthUser {
                token: token.to_string(),
            })
        }
        (None, None) => Ok(AuthUser {
            token: "anonymous".to_string(),
        }),
        (None, Some(_)) => Err(AppError::Unauthorized("Missing authorization header")),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
