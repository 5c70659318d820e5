//! Ingestion HTTP API built on axum.
//!
//! Producers authenticate with a bearer token carrying a tenant claim;
//! a submission naming a different tenant is rejected. Dispatch is
//! asynchronous: `POST /post` answers `202 Accepted` with a per-channel
//! breakdown, never a single pass/fail.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::SubmitError;
use crate::pipeline::{Pipeline, Submission};
use crate::types::{Channel, IdempotencyKey, JobKey, TenantId};

/// Maps bearer tokens to the tenant they act for.
#[derive(Clone, Default)]
pub struct AuthConfig {
    tokens: Arc<HashMap<String, TenantId>>,
}

impl AuthConfig {
    pub fn new(tokens: HashMap<String, TenantId>) -> Self {
        Self { tokens: Arc::new(tokens) }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("tokens", &format_args!("[{} redacted]", self.tokens.len()))
            .finish()
    }
}

#[derive(Clone)]
struct ApiState {
    pipeline: Arc<Pipeline>,
}

/// Build the ingestion router.
///
/// Routes:
/// - `POST /post` (auth) — submit a job
/// - `GET /status/{key}` (auth) — per-channel job status
/// - `GET /dlq` (auth) — dead-letter listing for the caller's tenant
/// - `GET /health` — unauthenticated liveness
pub fn router(pipeline: Arc<Pipeline>, auth: AuthConfig) -> Router {
    let state = ApiState { pipeline };

    let public_routes = Router::new().route("/health", get(get_health));

    let api_routes = Router::new()
        .route("/post", post(post_job))
        .route("/status/{key}", get(get_status))
        .route("/dlq", get(get_dead_letters))
        .route_layer(middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(state);

    Router::new().merge(public_routes).merge(api_routes)
}

/// Bind and serve the ingestion API.
pub async fn serve(
    addr: &str,
    pipeline: Arc<Pipeline>,
    auth: AuthConfig,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("post dispatch api listening on {addr}");
    axum::serve(listener, router(pipeline, auth)).await
}

/// Resolve the bearer token to a tenant claim; fail-closed.
async fn auth_middleware(
    State(auth): State<AuthConfig>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(tenant) = token.and_then(|t| auth.tokens.get(t)).cloned() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    request.extensions_mut().insert(tenant);
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRequest {
    tenant_id: String,
    #[serde(default)]
    idempotency_key: Option<String>,
    template: String,
    channels: Vec<String>,
    #[serde(default)]
    payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

fn submit_error_status(error: &SubmitError) -> StatusCode {
    match error {
        SubmitError::UnknownTenant(_)
        | SubmitError::EmptyChannels
        | SubmitError::UnknownChannel(_) => StatusCode::BAD_REQUEST,
        SubmitError::Backpressure => StatusCode::TOO_MANY_REQUESTS,
        SubmitError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn post_job(
    State(state): State<ApiState>,
    Extension(tenant): Extension<TenantId>,
    headers: axum::http::HeaderMap,
    Json(body): Json<PostRequest>,
) -> Response {
    if body.tenant_id != tenant.0 {
        return error_response(StatusCode::FORBIDDEN, "tenant mismatch");
    }

    // The Idempotency-Key header may substitute for the body field.
    let idempotency_key = body.idempotency_key.or_else(|| {
        headers
            .get("idempotency-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let submission = Submission {
        tenant_id: body.tenant_id,
        idempotency_key,
        template: body.template,
        channels: body.channels,
        payload: body.payload,
    };

    match state.pipeline.submit(submission).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(error) => error_response(submit_error_status(&error), error.to_string()),
    }
}

async fn get_status(
    State(state): State<ApiState>,
    Extension(tenant): Extension<TenantId>,
    Path(key): Path<String>,
) -> Response {
    let key = JobKey::new(tenant, IdempotencyKey(key));
    if let Some(states) = state.pipeline.job_status(&key).await {
        return Json(states).into_response();
    }
    // Finalized jobs are answered from the idempotency cache.
    match state.pipeline.cached_result(&key).await {
        Some(record) => Json(record.results).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "unknown job"),
    }
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    #[serde(default)]
    channel: Option<String>,
}

async fn get_dead_letters(
    State(state): State<ApiState>,
    Extension(tenant): Extension<TenantId>,
    Query(query): Query<DlqQuery>,
) -> Response {
    let channel = match query.channel.as_deref() {
        Some(name) => match name.parse::<Channel>() {
            Ok(channel) => Some(channel),
            Err(()) => return error_response(StatusCode::BAD_REQUEST, "unrecognized channel"),
        },
        None => None,
    };

    let entries = state.pipeline.dead_letters(Some(&tenant), channel).await;
    Json(entries).into_response()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{header, Request as HttpRequest};
    use tower::ServiceExt;

    use crate::pipeline::PipelineConfig;
    use crate::types::{ChannelConfig, SubmitReceipt};

    async fn test_router() -> Router {
        let tenant = TenantId("t1".into());
        let pipeline = Arc::new(Pipeline::new(PipelineConfig {
            worker_count: 1,
            ..Default::default()
        }));
        pipeline.register_tenant(&tenant).await;
        pipeline
            .configure_channel(&tenant, Channel::X, ChannelConfig::managed("vault://t1/x"))
            .await
            .expect("configure");

        let mut tokens = HashMap::new();
        tokens.insert("token-t1".to_string(), tenant);
        router(pipeline, AuthConfig::new(tokens))
    }

    fn post_request() -> axum::http::request::Builder {
        HttpRequest::builder()
            .method("POST")
            .uri("/post")
            .header(header::CONTENT_TYPE, "application/json")
    }

    async fn response_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let app = test_router().await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let app = test_router().await;
        let body = serde_json::json!({
            "tenantId": "t1",
            "template": "goal",
            "channels": ["x"],
        });
        let response = app
            .oneshot(
                post_request()
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn tenant_mismatch_is_forbidden() {
        let app = test_router().await;
        // Valid token for t1, but the body names another tenant.
        let body = serde_json::json!({
            "tenantId": "t2",
            "template": "goal",
            "channels": ["x"],
        });
        let response = app
            .oneshot(
                post_request()
                    .header(header::AUTHORIZATION, "Bearer token-t1")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn idempotency_key_header_substitutes_for_body_field() {
        let app = test_router().await;
        let body = serde_json::json!({
            "tenantId": "t1",
            "template": "goal",
            "channels": ["x"],
        });
        let response = app
            .oneshot(
                post_request()
                    .header(header::AUTHORIZATION, "Bearer token-t1")
                    .header("Idempotency-Key", "evt-42")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let receipt: SubmitReceipt = response_json(response).await;
        assert_eq!(receipt.key.idempotency_key.0, "evt-42");
        assert_eq!(receipt.key.tenant_id.0, "t1");
    }

    #[test]
    fn submit_errors_map_to_status_codes() {
        assert_eq!(
            submit_error_status(&SubmitError::UnknownTenant("t9".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            submit_error_status(&SubmitError::Backpressure),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            submit_error_status(&SubmitError::Shutdown),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
