use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use relayq_core::RestError;

use crate::app::errors;
use crate::config::BasicCredentials;

pub const REALM: &str = r#"Basic realm="relayq""#;

#[derive(Clone)]
pub struct AuthState {
    pub credentials: Arc<BasicCredentials>,
}

pub async fn basic_auth_middleware(
    State(state): State<AuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    match extract_basic(req.headers()) {
        Some((user, password)) if state.credentials.matches(&user, &password) => {
            next.run(req).await
        }
        _ => unauthorized(req.uri().path()),
    }
}

impl BasicCredentials {
    /// Compare against presented credentials without short-circuiting on the
    /// first differing byte.
    pub fn matches(&self, user: &str, password: &str) -> bool {
        let user_ok = digest_eq(user, &self.user);
        let password_ok = digest_eq(password, &self.password);
        user_ok & password_ok
    }
}

/// Equal-length SHA-256 digests compared with a full XOR fold.
fn digest_eq(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unauthorized(path: &str) -> Response {
    let mut response = errors::rest_error(
        StatusCode::UNAUTHORIZED,
        RestError::new("unauthorized", "Unauthorized").with_instance(path),
    );
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM));
    response
}

fn extract_basic(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?.trim();
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}
