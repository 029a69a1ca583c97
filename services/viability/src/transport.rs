//! JSON transport over axum.
//!
//! Handlers stay thin: they parse the request, call into [`ViabilityService`]
//! and map [`StoreError`] onto a status code with a `{code, message}` body.
//! Internal failures are logged in full and answered with a generic message.
use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use schema::{OutcomeTag, TicketEntry};
use serde::{Deserialize, Serialize};
use store::StoreError;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::{
    BaseInfo, NearbyCto, NewTicket, UploadReport, ViabilityService, allocator::TicketAllocator,
};

pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    service: Arc<ViabilityService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    ApiError {
        status,
        body: ErrorResponse {
            code: code.to_string(),
            message: message.into(),
        },
    }
}

pub fn api_validation_error(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn api_unauthorized(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(err) => api_validation_error(err.to_string()),
            StoreError::NotFound(what) => {
                api_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
            }
            StoreError::Conflict(message) => api_error(StatusCode::CONFLICT, "conflict", message),
            StoreError::LockTimeout { key, waited } => {
                warn!(dataset = %key, waited_ms = waited.as_millis() as u64, "request timed out waiting for dataset");
                api_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "busy",
                    format!("dataset `{key}` is busy, try again"),
                )
            }
            err => {
                error!(error = %err, "request failed");
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(service: Arc<ViabilityService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/login", post(login))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/logout", post(logout))
        .route("/api/online", get(online))
        .route("/api/projetistas", get(list_designers).post(add_designer))
        .route(
            "/api/projetistas/:nome",
            put(update_designer).delete(remove_designer),
        )
        .route("/api/tabulacoes", get(list_tags).post(add_tag))
        .route("/api/tabulacoes/:nome", axum::routing::delete(remove_tag))
        .route("/api/vi-ala", get(list_tickets).post(commit_ticket))
        .route("/api/vi-ala/next", get(next_ticket))
        .route(
            "/api/base/upload",
            post(upload_base).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/base/info", get(base_info))
        .route("/api/ctos/nearby", get(nearby_ctos))
        .with_state(AppState { service })
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, service: Arc<ViabilityService>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?addr, "viability http listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ----- sessions -----

#[derive(Debug, Deserialize)]
struct LoginRequest {
    nome: String,
    #[serde(default)]
    senha: String,
}

#[derive(Debug, Deserialize)]
struct IdentityRequest {
    nome: String,
}

#[derive(Debug, Serialize)]
struct DesignerView {
    nome: String,
}

#[derive(Debug, Serialize)]
struct OnlineView {
    nome: String,
    login_time: u64,
    last_activity: u64,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<DesignerView>> {
    let now = auth::now_unix_secs();
    match state.service.login(&request.nome, &request.senha, now).await? {
        Some(entry) => Ok(Json(DesignerView { nome: entry.name })),
        None => {
            warn!(designer = %request.nome.trim(), "login rejected");
            Err(api_unauthorized("invalid name or password"))
        }
    }
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<IdentityRequest>,
) -> Json<serde_json::Value> {
    let active = state
        .service
        .sessions
        .heartbeat(request.nome.trim(), auth::now_unix_secs());
    Json(serde_json::json!({ "active": active }))
}

async fn logout(
    State(state): State<AppState>,
    Json(request): Json<IdentityRequest>,
) -> Json<serde_json::Value> {
    let logged_out = state.service.sessions.logout(request.nome.trim());
    Json(serde_json::json!({ "logged_out": logged_out }))
}

async fn online(State(state): State<AppState>) -> Json<Vec<OnlineView>> {
    let sessions = state.service.sessions.list_online(auth::now_unix_secs());
    Json(
        sessions
            .into_iter()
            .map(|session| OnlineView {
                nome: session.identity,
                login_time: session.login_time,
                last_activity: session.last_activity,
            })
            .collect(),
    )
}

// ----- roster -----

#[derive(Debug, Deserialize)]
struct NewDesigner {
    nome: String,
    senha: String,
}

#[derive(Debug, Default, Deserialize)]
struct DesignerUpdate {
    #[serde(default)]
    novo_nome: Option<String>,
    #[serde(default)]
    senha: Option<String>,
}

async fn list_designers(State(state): State<AppState>) -> ApiResult<Json<Vec<DesignerView>>> {
    let entries = state.service.roster.list().await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|entry| DesignerView { nome: entry.name })
            .collect(),
    ))
}

async fn add_designer(
    State(state): State<AppState>,
    Json(request): Json<NewDesigner>,
) -> ApiResult<(StatusCode, Json<DesignerView>)> {
    let entry = state.service.roster.add(&request.nome, &request.senha).await?;
    Ok((StatusCode::CREATED, Json(DesignerView { nome: entry.name })))
}

async fn update_designer(
    State(state): State<AppState>,
    Path(nome): Path<String>,
    Json(request): Json<DesignerUpdate>,
) -> ApiResult<Json<DesignerView>> {
    if request.novo_nome.is_none() && request.senha.is_none() {
        return Err(api_validation_error("nothing to update: send novo_nome or senha"));
    }
    let entry = state
        .service
        .roster
        .update(&nome, request.novo_nome.as_deref(), request.senha.as_deref())
        .await?;
    Ok(Json(DesignerView { nome: entry.name }))
}

async fn remove_designer(
    State(state): State<AppState>,
    Path(nome): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.roster.remove(&nome).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ----- tags -----

#[derive(Debug, Deserialize)]
struct NewTag {
    tabulacao: String,
}

fn tag_names(tags: Vec<OutcomeTag>) -> Json<Vec<String>> {
    Json(tags.into_iter().map(|tag| tag.name).collect())
}

async fn list_tags(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(tag_names(state.service.tags.list().await?))
}

async fn add_tag(
    State(state): State<AppState>,
    Json(request): Json<NewTag>,
) -> ApiResult<(StatusCode, Json<Vec<String>>)> {
    let tags = state.service.tags.add(&request.tabulacao).await?;
    Ok((StatusCode::CREATED, tag_names(tags)))
}

async fn remove_tag(
    State(state): State<AppState>,
    Path(nome): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(tag_names(state.service.tags.remove(&nome).await?))
}

// ----- ticket ledger -----

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    #[serde(default)]
    projetista: Option<String>,
}

#[derive(Debug, Serialize)]
struct NextTicket {
    ticket_id: String,
}

async fn list_tickets(
    State(state): State<AppState>,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<Json<Vec<TicketEntry>>> {
    let allocator: &TicketAllocator = &state.service.allocator;
    let entries = match query.projetista.as_deref().map(str::trim) {
        Some(operator) if !operator.is_empty() => allocator.for_operator(operator).await?,
        _ => allocator.list().await?,
    };
    Ok(Json(entries))
}

async fn next_ticket(State(state): State<AppState>) -> ApiResult<Json<NextTicket>> {
    let ticket_id = state.service.allocator.preview().await?;
    Ok(Json(NextTicket { ticket_id }))
}

async fn commit_ticket(
    State(state): State<AppState>,
    Json(ticket): Json<NewTicket>,
) -> ApiResult<(StatusCode, Json<TicketEntry>)> {
    let entry = state.service.allocator.commit(ticket).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

// ----- cto base -----

async fn upload_base(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<UploadReport>> {
    let report = state.service.uploads.commit(body.to_vec()).await?;
    Ok(Json(report))
}

async fn base_info(State(state): State<AppState>) -> ApiResult<Json<BaseInfo>> {
    Ok(Json(state.service.uploads.base_info().await?))
}

#[derive(Debug, Deserialize)]
struct NearbyQuery {
    lat: f64,
    lng: f64,
    #[serde(default)]
    raio: Option<f64>,
    #[serde(default)]
    limite: Option<usize>,
}

async fn nearby_ctos(
    State(state): State<AppState>,
    Query(query): Query<NearbyQuery>,
) -> ApiResult<Json<Vec<NearbyCto>>> {
    let found = state
        .service
        .ctos
        .nearby(query.lat, query.lng, query.raio, query.limite)
        .await?;
    Ok(Json(found))
}
