//! HTTP surface: shared state, operation registration, SSE streams, the
//! OAuth redirects and the webhook endpoint.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::{
        IntoResponse, Redirect, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use super::handler::Handler;
use super::jwt::{JwtIssuer, claim_str};
use super::middleware::{WebhookSecret, verify_signature};
use super::models::ProgressMessage;
use super::progress::ProgressBus;
use super::rpc::{
    Empty, Guard, OperationCatalog, RequestContext, RpcError, RpcRouter, decode_body,
};
use super::session::{
    AccessTokenResponse, AuthCallbackQuery, LoginQuery, STATE_COOKIE, Session, read_cookie,
};
use super::webhook::{WebhookDispatcher, WebhookOutcome, WebhookPayload};

pub struct AppState {
    pub handler: Handler,
    pub session: Session,
    pub webhooks: WebhookDispatcher,
    pub progress: Arc<ProgressBus>,
}

pub type SharedState = Arc<AppState>;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

// ── Query payloads ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildProgressQuery {
    #[serde(alias = "deploymentID")]
    pub deployment_id: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    #[serde(alias = "repoID")]
    pub repo_id: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

// ── Operations ────────────────────────────────────────────────────────

/// Every named operation, bearer-protected unless it starts a session.
pub fn operations() -> RpcRouter<SharedState> {
    RpcRouter::new()
        .rpc("info", Guard::Bearer, |s: SharedState, ctx, input: Empty| async move {
            s.handler.info(&ctx, input).await
        })
        .rpc("getProfile", Guard::Bearer, |s: SharedState, ctx, input: Empty| async move {
            s.handler.get_profile(&ctx, input).await
        })
        .rpc("getRepos", Guard::Bearer, |s: SharedState, ctx, input: Empty| async move {
            s.handler.get_repos(&ctx, input).await
        })
        .rpc("getBranches", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.get_branches(&ctx, input).await
        })
        .rpc("syncGithubApp", Guard::Bearer, |s: SharedState, ctx, input: Empty| async move {
            s.handler.sync_github_app(&ctx, input).await
        })
        .rpc("connectRepoBranch", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.connect_repo_branch(&ctx, input).await
        })
        .rpc("deploy", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.deploy(&ctx, input).await
        })
        .rpc("getDeployment", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.get_deployment(&ctx, input).await
        })
        .rpc("getDeployments", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.get_deployments(&ctx, input).await
        })
        .rpc("getDeploymentHistory", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.get_deployment_history(&ctx, input).await
        })
        .rpc("rollbackDeployment", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.rollback_deployment(&ctx, input).await
        })
        .rpc("getSecrets", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.get_secrets(&ctx, input).await
        })
        .rpc("revealSecrets", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.reveal_secrets(&ctx, input).await
        })
        .rpc("setSecret", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.set_secret(&ctx, input).await
        })
        .rpc("removeSecret", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.remove_secret(&ctx, input).await
        })
        .rpc("getWorkloadStats", Guard::Bearer, |s: SharedState, ctx, input| async move {
            s.handler.get_workload_stats(&ctx, input).await
        })
        .raw::<Empty, Empty, _, _>("logout", Method::POST, Guard::Bearer, logout)
        .raw::<BuildProgressQuery, ProgressMessage, _, _>(
            "getBuildProgress",
            Method::GET,
            Guard::Bearer,
            get_build_progress,
        )
        .raw::<LogsQuery, ProgressMessage, _, _>("getLogs", Method::GET, Guard::Bearer, get_logs)
        .raw::<Empty, Empty, _, _>("auth", Method::GET, Guard::Public, auth)
        .raw::<AuthCallbackQuery, AccessTokenResponse, _, _>(
            "authCallback",
            Method::GET,
            Guard::Public,
            auth_callback,
        )
        .raw::<LoginQuery, Empty, _, _>("login", Method::GET, Guard::Public, login)
}

/// The catalog exported by `treenq schema`.
pub fn catalog() -> OperationCatalog {
    operations().into_catalog()
}

/// Routes under the shared state; the webhook route is signature-checked
/// when a secret is given.
pub fn api_router(
    jwt: Arc<JwtIssuer>,
    webhook_secret: Option<WebhookSecret>,
) -> Router<SharedState> {
    let (router, _) = operations().into_parts(jwt);

    let webhook = post(github_webhook);
    let webhook = match webhook_secret {
        Some(secret) => {
            webhook.route_layer(axum::middleware::from_fn_with_state(secret, verify_signature))
        }
        None => webhook,
    };

    router
        .route("/healthz", get(healthz))
        .route("/githubWebhook", webhook)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
    })
}

async fn github_webhook(State(state): State<SharedState>, body: Bytes) -> Result<Response, RpcError> {
    let payload: WebhookPayload = decode_body(&body)?;
    let outcome: WebhookOutcome = state.webhooks.dispatch(&payload).await?;
    Ok(Json(outcome).into_response())
}

fn with_cookies(mut resp: Response, cookies: &[String]) -> Response {
    for c in cookies {
        if let Ok(value) = HeaderValue::from_str(c) {
            resp.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    resp
}

async fn auth(State(state): State<SharedState>) -> Result<Response, RpcError> {
    let (oauth_state, url) = state.session.begin().await?;
    let cookie = state.session.state_cookie(&oauth_state);
    Ok(with_cookies(
        Redirect::temporary(&url).into_response(),
        &[cookie],
    ))
}

async fn auth_callback(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Query(query): Query<AuthCallbackQuery>,
) -> Result<Response, RpcError> {
    let cookie_state = read_cookie(&ctx.headers, STATE_COOKIE);
    let signed_in = state.session.complete(cookie_state, &query).await?;
    let cookies = [
        state.session.auth_cookie(&signed_in.token),
        state.session.clear_state_cookie(),
    ];
    let resp = match state.session.settings().redirect_url.as_deref() {
        Some(url) => Redirect::to(url).into_response(),
        None => Json(AccessTokenResponse {
            access_token: signed_in.token,
        })
        .into_response(),
    };
    Ok(with_cookies(resp, &cookies))
}

async fn login(
    State(state): State<SharedState>,
    Query(query): Query<LoginQuery>,
) -> Result<Response, RpcError> {
    let url = state.session.login_url(&query.provider).await?;
    Ok(Redirect::temporary(&url).into_response())
}

async fn logout(State(state): State<SharedState>, ctx: RequestContext) -> Result<Response, RpcError> {
    let user_id = claim_str(ctx.claims()?, "id");
    state.session.logout(&user_id).await?;
    Ok(with_cookies(
        StatusCode::OK.into_response(),
        &[state.session.clear_auth_cookie()],
    ))
}

// ── SSE ───────────────────────────────────────────────────────────────

fn event(msg: &ProgressMessage) -> Result<Event, Infallible> {
    let data = serde_json::to_string(msg).unwrap_or_default();
    Ok(Event::default().data(data))
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let mut resp = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response();
    let headers = resp.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    resp
}

/// Replays the deployment's progress, then follows it until `final`.
async fn get_build_progress(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Query(query): Query<BuildProgressQuery>,
) -> Result<Response, RpcError> {
    let deployment = state
        .handler
        .progress_deployment(&ctx, &query.deployment_id)
        .await?;
    let subscription = match state
        .progress
        .subscribe_existing(&deployment.id, CancellationToken::new())
    {
        Some(subscription) => subscription,
        // Finished before this process started, or its history was evicted.
        None if deployment.status.is_terminal() => {
            let outcome = ProgressMessage::outcome(&deployment);
            return Ok(sse_response(futures::stream::once(async move {
                event(&outcome)
            })));
        }
        None => state
            .progress
            .subscribe(&deployment.id, CancellationToken::new()),
    };
    let stream = subscription.into_stream().map(|msg| event(&msg));
    Ok(sse_response(stream))
}

/// Follows the pod logs of a repository until the client goes away.
async fn get_logs(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Query(query): Query<LogsQuery>,
) -> Result<Response, RpcError> {
    let namespace = state.handler.logs_namespace(&ctx, &query.repo_id).await?;
    let cancel = CancellationToken::new();
    let rx = state
        .handler
        .cluster()
        .stream_logs(&namespace, &query.repo_id, cancel.clone())
        .await?;

    // Dropping the stream (client disconnect) stops the followers.
    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |msg| {
        let _ = &guard;
        event(&msg)
    });
    Ok(sse_response(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lists_every_operation() {
        let catalog = catalog();
        for op in [
            "info",
            "getProfile",
            "getRepos",
            "getBranches",
            "syncGithubApp",
            "connectRepoBranch",
            "deploy",
            "getDeployment",
            "getDeployments",
            "getDeploymentHistory",
            "rollbackDeployment",
            "getSecrets",
            "revealSecrets",
            "setSecret",
            "removeSecret",
            "getWorkloadStats",
            "logout",
            "getBuildProgress",
            "getLogs",
        ] {
            let meta = catalog.get(op).unwrap_or_else(|| panic!("{op} missing"));
            assert!(meta.bearer, "{op} should require a bearer token");
        }
        for op in ["auth", "authCallback", "login"] {
            assert!(!catalog.get(op).unwrap().bearer);
        }
        assert_eq!(catalog.get("getLogs").unwrap().method, "GET");
        assert_eq!(catalog.get("deploy").unwrap().method, "POST");
        assert!(catalog.components.contains_key("DeployRequestBody"));
    }

    #[test]
    fn test_sse_event_is_json() {
        let msg = ProgressMessage::info("d1", "cloning").finished();
        // Event has no public accessor; the JSON must at least serialize.
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["final"], true);
        assert!(event(&msg).is_ok());
    }
}
