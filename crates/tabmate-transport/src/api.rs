//! HTTP routes for tables.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use tabmate_core::{
    ItemDelta, LineId, NewItem, OrderLine, Principal, Store, TableCode, TableId, TableMember,
    UserId,
};
use tabmate_session::ReconcileSummary;
use tracing::info;

use crate::{
    error::ApiError,
    websocket::{AppState, ws_handler},
};

/// Body of `POST /api/tables`.
#[derive(Debug, Deserialize)]
pub struct CreateTableRequest {
    pub tablename: String,
    pub restaurant: String,
}

/// Response of `POST /api/tables`.
#[derive(Debug, Serialize)]
pub struct CreatedTable {
    pub code: TableCode,
    pub id: TableId,
    pub name: String,
    pub restaurant: String,
    pub created_by: UserId,
}

/// Response of `GET /api/tables/{code}`.
#[derive(Debug, Serialize)]
pub struct TableView {
    pub code: TableCode,
    pub id: TableId,
    pub tablename: String,
    pub restaurant: String,
    pub usernames: Vec<String>,
}

/// Response of `POST /api/tables/{code}/join`.
#[derive(Debug, Serialize)]
pub struct JoinedTable {
    pub code: TableCode,
    pub id: TableId,
    pub tablename: String,
    pub restaurant: String,
    pub host: UserId,
}

/// Body of `PATCH /api/tables/{code}/items/{id}`.
#[derive(Debug, Deserialize)]
pub struct QuantityRequest {
    pub quantity: i64,
}

/// Body of `POST /api/tables/{code}/sync`.
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub updates: Vec<ItemDelta>,
}

/// Response of `POST /api/tables/{code}/sync`.
#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub status: String,
    #[serde(flatten)]
    pub summary: ReconcileSummary,
}

/// Build the HTTP router: table API, table WebSocket and health check.
pub fn router<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tables", post(create_table::<S>))
        .route("/api/tables/{code}", get(get_table::<S>))
        .route("/api/tables/{code}/join", post(join_table::<S>))
        .route("/api/tables/{code}/members", get(list_members::<S>))
        .route(
            "/api/tables/{code}/items",
            get(list_items::<S>).post(add_items::<S>),
        )
        .route(
            "/api/tables/{code}/items/{id}",
            patch(update_item::<S>).delete(delete_item::<S>),
        )
        .route("/api/tables/{code}/sync", post(sync_items::<S>))
        .route("/ws/table/{code}", get(ws_handler::<S>))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn authenticate<S: Store>(
    state: &AppState<S>,
    headers: &HeaderMap,
) -> Result<Principal, ApiError> {
    let credential = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    Ok(state.identity.authenticate(credential).await?)
}

async fn create_table<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(request): Json<CreateTableRequest>,
) -> Result<Json<CreatedTable>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    if request.tablename.trim().is_empty() {
        return Err(ApiError::BadRequest("tablename must not be empty".into()));
    }

    let (record, _session) = state
        .registry
        .create_new(request.tablename, request.restaurant, principal.user_id)
        .await?;

    Ok(Json(CreatedTable {
        code: record.code,
        id: record.id,
        name: record.name,
        restaurant: record.restaurant,
        created_by: record.created_by,
    }))
}

async fn get_table<S: Store>(
    State(state): State<AppState<S>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TableView>, ApiError> {
    authenticate(&state, &headers).await?;
    let (record, session) = state.registry.open(&TableCode::new(code)).await?;
    let usernames = session.hub.roster().await?;

    Ok(Json(TableView {
        code: record.code,
        id: record.id,
        tablename: record.name,
        restaurant: record.restaurant,
        usernames,
    }))
}

async fn join_table<S: Store>(
    State(state): State<AppState<S>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<JoinedTable>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let (record, _session) = state
        .registry
        .join(&TableCode::new(code), principal.user_id)
        .await?;

    Ok(Json(JoinedTable {
        code: record.code,
        id: record.id,
        tablename: record.name,
        restaurant: record.restaurant,
        host: record.created_by,
    }))
}

async fn list_members<S: Store>(
    State(state): State<AppState<S>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<TableMember>>, ApiError> {
    authenticate(&state, &headers).await?;
    Ok(Json(state.registry.members(&TableCode::new(code)).await?))
}

async fn list_items<S: Store>(
    State(state): State<AppState<S>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<OrderLine>>, ApiError> {
    authenticate(&state, &headers).await?;
    let code = TableCode::new(code);
    let store = state.registry.store();
    if store
        .get_table_by_code(&code)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .is_none()
    {
        return Err(ApiError::NotFound(format!("Table not found: {code}")));
    }
    let lines = store
        .list_order_lines(&code)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(lines))
}

async fn add_items<S: Store>(
    State(state): State<AppState<S>>,
    Path(code): Path<String>,
    headers: HeaderMap,
    Json(items): Json<Vec<NewItem>>,
) -> Result<Json<Vec<OrderLine>>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let code = TableCode::new(code);
    let lines = state
        .registry
        .reconciler()
        .add_items(&code, principal.user_id, &items)
        .await?;

    info!(table_code = %code, items = items.len(), "Items added over HTTP");
    Ok(Json(lines))
}

async fn update_item<S: Store>(
    State(state): State<AppState<S>>,
    Path((code, id)): Path<(String, LineId)>,
    headers: HeaderMap,
    Json(request): Json<QuantityRequest>,
) -> Result<Json<Option<OrderLine>>, ApiError> {
    authenticate(&state, &headers).await?;
    let line = state
        .registry
        .reconciler()
        .set_quantity(&TableCode::new(code), id, request.quantity)
        .await?;
    Ok(Json(line))
}

async fn delete_item<S: Store>(
    State(state): State<AppState<S>>,
    Path((code, id)): Path<(String, LineId)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authenticate(&state, &headers).await?;
    state
        .registry
        .reconciler()
        .remove_line(&TableCode::new(code), id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_items<S: Store>(
    State(state): State<AppState<S>>,
    Path(code): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let code = TableCode::new(code);
    let summary = state
        .registry
        .reconciler()
        .reconcile(&code, &request.updates)
        .await?;

    info!(
        table_code = %code,
        user = %principal.display_name,
        updates = request.updates.len(),
        "Order synced over HTTP"
    );
    Ok(Json(SyncResponse {
        status: "ok".into(),
        summary,
    }))
}
