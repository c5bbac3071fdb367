// =============================================================================
// Bearer Token Authentication — Axum extractor for mutating endpoints
// =============================================================================
//
// The expected token comes from the `API_TOKEN` environment variable. When no
// token is configured the deployment is open (local operation); when one is
// configured, every mutating endpoint requires `Authorization: Bearer <token>`
// and comparison runs in constant time.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Compare two byte slices in constant time: every byte of both slices is
/// examined even after a mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Extractor guarding operator actions. Yields the presented token (empty
/// when the deployment is open).
pub struct OperatorAuth(pub String);

pub struct AuthRejection;

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": "Missing or invalid authorization token" });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for OperatorAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("API_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            // Open deployment.
            return Ok(OperatorAuth(String::new()));
        }

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match token {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
                Ok(OperatorAuth(token.to_string()))
            }
            _ => {
                warn!("operator action rejected: missing or invalid bearer token");
                Err(AuthRejection)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_match() {
        assert!(constant_time_eq(b"token-1", b"token-1"));
    }

    #[test]
    fn different_strings_do_not_match() {
        assert!(!constant_time_eq(b"token-1", b"token-2"));
        assert!(!constant_time_eq(b"short", b"longer-token"));
    }

    #[test]
    fn empty_matches_empty() {
        assert!(constant_time_eq(b"", b""));
    }
}
