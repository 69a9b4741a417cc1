//! Request authentication for the admin API and bearer parsing for OFREP.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::config::ServerConfig;

/// Outcome of reading an `Authorization` header.
#[derive(Debug, PartialEq, Eq)]
pub enum Bearer<'a> {
    Missing,
    Malformed,
    Token(&'a str),
}

/// Extract the bearer token, if any.
pub fn bearer_token(headers: &HeaderMap) -> Bearer<'_> {
    let Some(header) = headers.get(AUTHORIZATION) else {
        return Bearer::Missing;
    };
    match header.to_str().ok().and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if !token.trim().is_empty() => Bearer::Token(token.trim()),
        _ => Bearer::Malformed,
    }
}

/// Require the admin API key when one is configured.
pub async fn auth_middleware(
    State(config): State<Arc<ServerConfig>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected_key = match &config.admin_api_key {
        Some(key) => key,
        None => return Ok(next.run(request).await),
    };

    match bearer_token(request.headers()) {
        Bearer::Token(token) if token == expected_key => Ok(next.run(request).await),
        Bearer::Token(_) => {
            tracing::warn!("Invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        Bearer::Malformed => {
            tracing::warn!("Invalid Authorization header format");
            Err(StatusCode::UNAUTHORIZED)
        }
        Bearer::Missing => {
            tracing::warn!("Missing Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(v) = value {
            headers.insert(AUTHORIZATION, v.parse().unwrap());
        }
        headers
    }

    #[test]
    fn reads_bearer_tokens() {
        assert_eq!(bearer_token(&headers(None)), Bearer::Missing);
        assert_eq!(bearer_token(&headers(Some("Bearer abc"))), Bearer::Token("abc"));
        assert_eq!(bearer_token(&headers(Some("Basic abc"))), Bearer::Malformed);
        assert_eq!(bearer_token(&headers(Some("Bearer  "))), Bearer::Malformed);
    }
}
