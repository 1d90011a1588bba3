//! REST API handlers.
//!
//! Every `/v1` route authenticates with HTTP basic credentials through the
//! configured [`AuthBackend`]. A trusted principal may send
//! `X-On-Behalf-Of` to have changes attributed to someone else.

use std::sync::Arc;

use axum::{
    extract::{Path, Query as QueryParams, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::{AuthBackend, Principal};
use crate::cidr::Cidr;
use crate::db::models::{
    AuditEntry, AuditFilter, Change, Pool, PoolAttrs, PoolRef, Prefix, PrefixAttrs, PrefixRef, Vrf,
    VrfAttrs, VrfRef,
};
use crate::error::{ErrorKind, IpamError};
use crate::ipam::{FindFree, Ipam, ListSpec, RemoveOptions};
use crate::query::{PrefixMatch, Query, SearchOptions, SearchResult, SmartSearchResult};

const ON_BEHALF_OF: &str = "x-on-behalf-of";

/// Application state shared across handlers.
pub struct AppState {
    pub ipam: Ipam,
    pub auth: Arc<AuthBackend>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

/// An engine error on its way out as HTTP.
#[derive(Debug)]
pub struct ApiError(IpamError);

impl From<IpamError> for ApiError {
    fn from(e: IpamError) -> Self {
        ApiError(e)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Input => StatusCode::BAD_REQUEST,
        ErrorKind::Constraint => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ResourceExhausted | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::NonExistent => StatusCode::NOT_FOUND,
        ErrorKind::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let message = match kind {
            ErrorKind::Storage => {
                error!(error = ?self.0, "Request failed in storage");
                "Storage error".to_string()
            }
            _ => self.0.to_string(),
        };
        let body = ErrorResponse {
            error: message,
            code: self.0.code(),
        };
        (status_for(kind), Json(body)).into_response()
    }
}

/// Missing or wrong credentials.
struct Unauthenticated(String);

impl IntoResponse for Unauthenticated {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"prefixd\"")],
            Json(ErrorResponse {
                error: self.0,
                code: 1600,
            }),
        )
            .into_response()
    }
}

enum Rejection {
    Auth(Unauthenticated),
    Api(ApiError),
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::Auth(a) => a.into_response(),
            Rejection::Api(e) => e.into_response(),
        }
    }
}

impl From<IpamError> for Rejection {
    fn from(e: IpamError) -> Self {
        Rejection::Api(ApiError(e))
    }
}

type ApiResult<T> = Result<Json<T>, Rejection>;

/// Pull `user:password` out of a basic `Authorization` header.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

async fn principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, Rejection> {
    let (user, password) = basic_credentials(headers)
        .ok_or_else(|| Rejection::Auth(Unauthenticated("Credentials required".to_string())))?;

    let principal = match state.auth.authenticate(&user, &password).await {
        Ok(p) => p,
        Err(IpamError::Unauthorized(reason)) => return Err(Rejection::Auth(Unauthenticated(reason))),
        Err(e) => return Err(e.into()),
    };

    match headers.get(ON_BEHALF_OF).and_then(|v| v.to_str().ok()) {
        Some(identity) => Ok(principal.on_behalf_of(identity, None)?),
        None => Ok(principal),
    }
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/vrfs", get(list_vrfs).post(add_vrf))
        .route("/v1/vrfs/search", post(search_vrfs))
        .route("/v1/vrfs/smart", post(smart_search_vrfs))
        .route("/v1/vrfs/{id}", put(edit_vrf).delete(remove_vrf))
        .route("/v1/pools", get(list_pools).post(add_pool))
        .route("/v1/pools/search", post(search_pools))
        .route("/v1/pools/smart", post(smart_search_pools))
        .route("/v1/pools/{id}", put(edit_pool).delete(remove_pool))
        .route("/v1/prefixes", get(list_prefixes).post(add_prefix))
        .route("/v1/prefixes/search", post(search_prefixes))
        .route("/v1/prefixes/smart", post(smart_search_prefixes))
        .route("/v1/prefixes/find-free", post(find_free))
        .route("/v1/prefixes/{vrf_id}/{id}", put(edit_prefix).delete(remove_prefix))
        .route("/v1/audit", get(list_audit))
        .route("/v1/changes", get(poll_changes))
        .route("/v1/changes/ack", post(ack_changes))
        .with_state(Arc::new(state))
}

/// Health check endpoint (no auth required).
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SearchRequest {
    query: Option<Query>,
    search_options: SearchOptions,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SmartSearchRequest {
    query_string: String,
    #[serde(default)]
    search_options: SearchOptions,
    /// Only used for prefixes.
    #[serde(default)]
    extra_query: Option<Query>,
}

// VRFs

async fn list_vrfs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    QueryParams(spec): QueryParams<ListSpec>,
) -> ApiResult<Vec<Vrf>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.list_vrf(&p, &typed(spec)).await?))
}

async fn add_vrf(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(attrs): Json<VrfAttrs>,
) -> ApiResult<Vrf> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.add_vrf(&p, attrs).await?))
}

async fn edit_vrf(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(attrs): Json<VrfAttrs>,
) -> ApiResult<Vrf> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.edit_vrf(&p, VrfRef::Id(id), attrs).await?))
}

async fn remove_vrf(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Vrf> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.remove_vrf(&p, VrfRef::Id(id)).await?))
}

async fn search_vrfs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResult<Vrf>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(
        state
            .ipam
            .search_vrf(&p, req.query.as_ref(), req.search_options)
            .await?,
    ))
}

async fn smart_search_vrfs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SmartSearchRequest>,
) -> ApiResult<SmartSearchResult<Vrf>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(
        state
            .ipam
            .smart_search_vrf(&p, &req.query_string, req.search_options)
            .await?,
    ))
}

// Pools

async fn list_pools(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    QueryParams(spec): QueryParams<ListSpec>,
) -> ApiResult<Vec<Pool>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.list_pool(&p, &typed(spec)).await?))
}

async fn add_pool(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(attrs): Json<PoolAttrs>,
) -> ApiResult<Pool> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.add_pool(&p, attrs).await?))
}

async fn edit_pool(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(attrs): Json<PoolAttrs>,
) -> ApiResult<Pool> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.edit_pool(&p, PoolRef::Id(id), attrs).await?))
}

async fn remove_pool(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Pool> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.remove_pool(&p, PoolRef::Id(id)).await?))
}

async fn search_pools(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResult<Pool>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(
        state
            .ipam
            .search_pool(&p, req.query.as_ref(), req.search_options)
            .await?,
    ))
}

async fn smart_search_pools(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SmartSearchRequest>,
) -> ApiResult<SmartSearchResult<Pool>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(
        state
            .ipam
            .smart_search_pool(&p, &req.query_string, req.search_options)
            .await?,
    ))
}

// Prefixes

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddPrefixRequest {
    #[serde(default)]
    vrf: Option<VrfRef>,
    attr: PrefixAttrs,
    #[serde(default)]
    args: Option<FindFree>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FindFreeRequest {
    #[serde(default)]
    vrf: Option<VrfRef>,
    args: FindFree,
}

async fn list_prefixes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    QueryParams(spec): QueryParams<ListSpec>,
) -> ApiResult<Vec<Prefix>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.list_prefix(&p, &typed(spec)).await?))
}

async fn add_prefix(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AddPrefixRequest>,
) -> ApiResult<Prefix> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.add_prefix(&p, req.vrf, req.attr, req.args).await?))
}

async fn edit_prefix(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vrf_id, id)): Path<(i64, i64)>,
    Json(attrs): Json<PrefixAttrs>,
) -> ApiResult<Prefix> {
    let p = principal(&state, &headers).await?;
    Ok(Json(
        state
            .ipam
            .edit_prefix(&p, Some(VrfRef::Id(vrf_id)), PrefixRef::Id(id), attrs)
            .await?,
    ))
}

async fn remove_prefix(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vrf_id, id)): Path<(i64, i64)>,
    QueryParams(options): QueryParams<RemoveOptions>,
) -> ApiResult<Vec<Prefix>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(
        state
            .ipam
            .remove_prefix(&p, Some(VrfRef::Id(vrf_id)), PrefixRef::Id(id), options)
            .await?,
    ))
}

async fn search_prefixes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResult<PrefixMatch>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(
        state
            .ipam
            .search_prefix(&p, req.query.as_ref(), req.search_options)
            .await?,
    ))
}

async fn smart_search_prefixes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SmartSearchRequest>,
) -> ApiResult<SmartSearchResult<PrefixMatch>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(
        state
            .ipam
            .smart_search_prefix(&p, &req.query_string, req.search_options, req.extra_query)
            .await?,
    ))
}

async fn find_free(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FindFreeRequest>,
) -> ApiResult<Vec<Cidr>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.find_free_prefix(&p, req.vrf, &req.args).await?))
}

// Audit and change feed

async fn list_audit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    QueryParams(filter): QueryParams<AuditFilter>,
) -> ApiResult<Vec<AuditEntry>> {
    let p = principal(&state, &headers).await?;
    Ok(Json(state.ipam.list_audit(&p, &filter).await?))
}

#[derive(Debug, Deserialize)]
struct PollParams {
    consumer: String,
    #[serde(default = "default_poll_limit")]
    limit: u32,
}

fn default_poll_limit() -> u32 {
    100
}

#[derive(Debug, Deserialize)]
struct AckRequest {
    consumer: String,
    seq: i64,
}

async fn poll_changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    QueryParams(params): QueryParams<PollParams>,
) -> ApiResult<Vec<Change>> {
    principal(&state, &headers).await?;
    Ok(Json(state.ipam.poll_changes(&params.consumer, params.limit).await?))
}

async fn ack_changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AckRequest>,
) -> Result<StatusCode, Rejection> {
    principal(&state, &headers).await?;
    state.ipam.ack_changes(&req.consumer, req.seq).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Query-string values arrive as text; give numbers and booleans back their
/// JSON type so they compare against typed attributes.
fn typed(spec: ListSpec) -> ListSpec {
    spec.into_iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(&s)
                    .ok()
                    .filter(|parsed| parsed.is_number() || parsed.is_boolean())
                    .unwrap_or(serde_json::Value::String(s)),
                other => other,
            };
            (k, v)
        })
        .collect()
}
