use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

/// Shared secret the devices present as a bearer token. `None` disables the
/// check.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    token: Option<Arc<str>>,
}

impl AuthState {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()).map(Arc::from),
        }
    }
}

pub async fn require_token(
    State(state): State<AuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(expected) = &state.token {
        let presented = extract_bearer(req.headers())?;
        if presented != expected.as_ref() {
            tracing::warn!(path = %req.uri().path(), "rejected request with wrong bearer token");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_str()
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?
        .trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  s3cret "));
        assert_eq!(extract_bearer(&headers), Ok("s3cret"));
    }

    #[test]
    fn blank_token_disables_the_check() {
        assert!(AuthState::new(Some("  ".into())).token.is_none());
        assert!(AuthState::new(Some("s3cret".into())).token.is_some());
    }
}
