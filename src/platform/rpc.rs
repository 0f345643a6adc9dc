//! Typed RPC router.
//!
//! Operations are registered with an id, a guard and a typed handler
//! `Fn(state, RequestContext, Input) -> Result<Output, RpcError>`. The
//! router decodes the JSON body into `Input`, encodes `Output` as JSON (an
//! empty object becomes an empty 200 body) and renders every error as the
//! `{code, message, meta}` envelope. Each registration also records the
//! operation's input/output schemas so the catalog can be exported for
//! client generation.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, State},
    handler::Handler,
    http::{HeaderMap, Method, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter, on, post},
};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;
use utoipa::openapi::{RefOr, schema::Schema};

use super::jwt::{Claims, JwtIssuer};
use super::middleware::require_bearer;
use crate::errors::AuthError;

/// Header naming the workspace a request acts on.
pub const WORKSPACE_HEADER: &str = "x-workspace";

// ── Error envelope ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, String>>,
    #[serde(skip)]
    pub status: StatusCode,
}

impl RpcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            meta: None,
            status: StatusCode::BAD_REQUEST,
        }
    }

    /// An error that carries only its code.
    pub fn code(code: &str) -> Self {
        Self::new(code, "")
    }

    /// Upstream or infrastructure failure: logged in full, reported by code
    /// and a short message.
    pub fn internal(code: &str, message: &str, err: impl std::fmt::Display) -> Self {
        tracing::error!(code, error = %err, "{}", message);
        Self::new(code, message)
    }

    pub fn decoding(err: impl std::fmt::Display) -> Self {
        Self::new("FAILED_DECODING", err.to_string())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            ..Self::new("UNAUTHORIZED", message)
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            ..Self::new("FORBIDDEN", message)
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.meta
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
        self
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<AuthError> for RpcError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized(msg) => Self::unauthorized(msg),
            AuthError::Forbidden(msg) => Self::forbidden(msg),
            AuthError::Other(e) => Self::internal("UNKNOWN", "authentication failed", e),
            other => Self::new(other.code(), other.to_string()),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        (self.status, Json(&self)).into_response()
    }
}

// ── Payloads ──────────────────────────────────────────────────────────

/// Input/output of operations that carry no data. Deserializes from any
/// JSON value.
#[derive(Debug, Clone, Copy, Default, Serialize, ToSchema)]
pub struct Empty {}

impl<'de> Deserialize<'de> for Empty {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer)?;
        Ok(Empty {})
    }
}

pub fn decode_body<I: DeserializeOwned>(body: &[u8]) -> Result<I, RpcError> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(body).map_err(RpcError::decoding)
}

pub fn encode_output<O: Serialize>(output: &O) -> Result<Response, RpcError> {
    let value = serde_json::to_value(output)
        .map_err(|e| RpcError::internal("FAILED_ENCODING", "failed to encode response", e))?;
    if value.as_object().is_some_and(|o| o.is_empty()) {
        return Ok(StatusCode::OK.into_response());
    }
    Ok(Json(value).into_response())
}

// ── Request context ───────────────────────────────────────────────────

/// Per-request data handed to every operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Verified bearer claims; `None` on public operations.
    pub claims: Option<Claims>,
    pub workspace: Option<String>,
    pub headers: HeaderMap,
}

impl RequestContext {
    pub fn claims(&self) -> Result<&Claims, RpcError> {
        self.claims
            .as_ref()
            .ok_or_else(|| RpcError::unauthorized("missing bearer token"))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self {
            claims: parts.extensions.get::<Claims>().cloned(),
            workspace: parts
                .headers
                .get(WORKSPACE_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            headers: parts.headers.clone(),
        })
    }
}

// ── Catalog ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Public,
    Bearer,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMeta {
    pub operation_id: &'static str,
    pub method: String,
    pub path: String,
    pub bearer: bool,
    pub input: RefOr<Schema>,
    pub output: RefOr<Schema>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationCatalog {
    pub operations: Vec<OperationMeta>,
    pub components: BTreeMap<String, RefOr<Schema>>,
}

impl OperationCatalog {
    fn record<I: ToSchema, O: ToSchema>(&mut self, operation_id: &'static str, method: &Method, guard: Guard) {
        let mut deps = Vec::new();
        I::schemas(&mut deps);
        O::schemas(&mut deps);
        self.components.extend(deps);
        self.components.insert(I::name().into_owned(), I::schema());
        self.components.insert(O::name().into_owned(), O::schema());

        self.operations.push(OperationMeta {
            operation_id,
            method: method.to_string(),
            path: format!("/{}", operation_id),
            bearer: guard == Guard::Bearer,
            input: I::schema(),
            output: O::schema(),
        });
    }

    pub fn get(&self, operation_id: &str) -> Option<&OperationMeta> {
        self.operations.iter().find(|o| o.operation_id == operation_id)
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// Collects operations; bearer-guarded ones are wrapped with the token check
/// when the router is finished, so the catalog can be built without keys.
pub struct RpcRouter<S> {
    public: Router<S>,
    bearer: Router<S>,
    catalog: OperationCatalog,
}

impl<S> Default for RpcRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> RpcRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            public: Router::new(),
            bearer: Router::new(),
            catalog: OperationCatalog::default(),
        }
    }

    fn mount(mut self, operation_id: &'static str, guard: Guard, route: MethodRouter<S>) -> Self {
        let path = format!("/{}", operation_id);
        match guard {
            Guard::Public => self.public = self.public.route(&path, route),
            Guard::Bearer => self.bearer = self.bearer.route(&path, route),
        }
        self
    }

    /// Register a JSON operation at `POST /<operation_id>`.
    pub fn rpc<I, O, F, Fut>(mut self, operation_id: &'static str, guard: Guard, handler: F) -> Self
    where
        I: DeserializeOwned + ToSchema + Send + 'static,
        O: Serialize + ToSchema + Send + 'static,
        F: Fn(S, RequestContext, I) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<O, RpcError>> + Send + 'static,
    {
        self.catalog.record::<I, O>(operation_id, &Method::POST, guard);
        let route = post(
            move |State(state): State<S>, ctx: RequestContext, body: Bytes| {
                let handler = handler.clone();
                async move {
                    let input = decode_body::<I>(&body)?;
                    let output = handler(state, ctx, input).await?;
                    encode_output(&output)
                }
            },
        );
        self.mount(operation_id, guard, route)
    }

    /// Register a plain axum handler (redirects, SSE, cookie-writing
    /// operations) under `/<operation_id>`, recording `I`/`O` as its schemas.
    pub fn raw<I, O, H, T>(
        mut self,
        operation_id: &'static str,
        method: Method,
        guard: Guard,
        handler: H,
    ) -> Self
    where
        I: ToSchema,
        O: ToSchema,
        H: Handler<T, S>,
        T: 'static,
    {
        self.catalog.record::<I, O>(operation_id, &method, guard);
        let filter = if method == Method::GET {
            MethodFilter::GET
        } else {
            MethodFilter::POST
        };
        self.mount(operation_id, guard, on(filter, handler))
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    pub fn into_catalog(self) -> OperationCatalog {
        self.catalog
    }

    /// The finished router, bearer operations behind `require_bearer`.
    pub fn into_parts(self, jwt: Arc<JwtIssuer>) -> (Router<S>, OperationCatalog) {
        // route_layer on a router without routes is rejected by axum.
        if !self.catalog.operations.iter().any(|op| op.bearer) {
            return (self.public, self.catalog);
        }
        let bearer = self
            .bearer
            .route_layer(axum::middleware::from_fn_with_state(jwt, require_bearer));
        (self.public.merge(bearer), self.catalog)
    }
}
