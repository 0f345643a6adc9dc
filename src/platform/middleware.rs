//! HTTP middlewares: bearer identity, webhook signature, panic recovery and
//! CORS preflight status.

use std::any::Any;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::jwt::JwtIssuer;
use super::rpc::RpcError;
use super::session::{AUTH_COOKIE, read_cookie};
use crate::errors::AuthError;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Upper bound for buffered webhook bodies.
const MAX_WEBHOOK_BODY: usize = 25 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

// ── Bearer ────────────────────────────────────────────────────────────

/// Pull the bearer token from `Authorization`, falling back to the session
/// cookie when the header is absent.
fn bearer_token(req: &Request) -> Result<String, AuthError> {
    match req.headers().get(header::AUTHORIZATION) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| AuthError::Unauthorized("malformed authorization header".into()))?;
            let (scheme, token) = value
                .split_once(' ')
                .ok_or_else(|| AuthError::Unauthorized("malformed authorization header".into()))?;
            if !scheme.eq_ignore_ascii_case("bearer") {
                return Err(AuthError::Unauthorized(format!(
                    "unsupported authorization scheme {}",
                    scheme
                )));
            }
            let token = token.trim();
            if token.is_empty() {
                return Err(AuthError::Unauthorized("empty bearer token".into()));
            }
            Ok(token.to_string())
        }
        None => read_cookie(req.headers(), AUTH_COOKIE)
            .ok_or_else(|| AuthError::Unauthorized("missing bearer token".into())),
    }
}

/// Verify the bearer JWT and attach its claims to the request.
pub async fn require_bearer(
    State(jwt): State<Arc<JwtIssuer>>,
    mut req: Request,
    next: Next,
) -> Result<Response, RpcError> {
    let token = bearer_token(&req)?;
    let claims = jwt.verify(&token)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

// ── Webhook signature ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct WebhookSecret(pub Arc<Vec<u8>>);

pub fn sign_payload(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length, so this never bails.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a `sha256=<hex>` signature over `body`.
pub fn verify_payload(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Some(hex_sig) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Buffer the body, check `X-Hub-Signature-256`, and hand the same bytes on.
pub async fn verify_signature(
    State(secret): State<WebhookSecret>,
    req: Request,
    next: Next,
) -> Result<Response, RpcError> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY)
        .await
        .map_err(|e| RpcError::new("FAILED_DECODING", format!("failed to read body: {}", e)))?;

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_payload(&secret.0, &bytes, signature) {
        tracing::warn!(uri = %parts.uri, "rejected webhook with invalid signature");
        return Err(RpcError::new("INVALID_SIGNATURE", "signature mismatch"));
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

// ── Panic recovery ────────────────────────────────────────────────────

pub fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(
        panic = %detail,
        backtrace = %std::backtrace::Backtrace::force_capture(),
        "handler panicked"
    );
    (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
}

// ── CORS preflight ────────────────────────────────────────────────────

/// Preflight answers from the CORS layer become `204 No Content`.
pub async fn preflight_no_content(req: Request, next: Next) -> Response {
    let is_preflight = req.method() == Method::OPTIONS;
    let mut resp = next.run(req).await;
    if is_preflight && resp.status() == StatusCode::OK {
        *resp.status_mut() = StatusCode::NO_CONTENT;
    }
    resp
}
