//! WebSocket entry point for table sessions.

use std::{fmt::Display, sync::Arc};

use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::rejection::WebSocketUpgradeRejection,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, header::AUTHORIZATION},
    response::{IntoResponse, Response},
};
use futures::{Sink, Stream, StreamExt};
use serde::Deserialize;
use tabmate_core::{Identity, Principal, Store, TableCode};
use tabmate_session::{SessionRegistry, TableSession};
use tracing::{info, warn};

use crate::{
    connection::{Connection, ConnectionConfig, attach},
    error::{ApiError, SessionError},
};

/// Shared state handed to every handler.
pub struct AppState<S: Store> {
    pub registry: Arc<SessionRegistry<S>>,
    pub identity: Arc<dyn Identity>,
    pub connection: ConnectionConfig,
}

impl<S: Store> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            identity: Arc::clone(&self.identity),
            connection: self.connection.clone(),
        }
    }
}

impl<S: Store> AppState<S> {
    /// State with default connection limits.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry<S>>, identity: Arc<dyn Identity>) -> Self {
        Self {
            registry,
            identity,
            connection: ConnectionConfig::default(),
        }
    }

    /// Override per-connection limits and timers.
    #[must_use]
    pub fn with_connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

/// Resolve the table and the caller before any socket work, and record the
/// caller as a member of the table.
///
/// # Errors
/// `Registry(NotFound)` for an unknown table, `Identity` for a bad credential.
pub async fn admit<S: Store>(
    state: &AppState<S>,
    code: &TableCode,
    credential: &str,
) -> Result<(TableSession, Principal), SessionError> {
    let session = state.registry.resolve_or_open(code).await?;
    let principal = state.identity.authenticate(credential).await?;
    state.registry.enroll(&session, principal.user_id).await?;
    Ok((session, principal))
}

/// Join `socket` to the table `code` as the user behind `credential`.
///
/// # Errors
/// Returns error if the table is unknown, the credential is rejected, or the
/// hub has stopped.
pub async fn open_session<S, T>(
    state: &AppState<S>,
    code: &TableCode,
    credential: &str,
    socket: T,
) -> Result<Connection, SessionError>
where
    S: Store,
    T: Stream<Item = Result<Message, axum::Error>> + Sink<Message> + Send + 'static,
    <T as Sink<Message>>::Error: Display,
{
    let (session, principal) = admit(state, code, credential).await?;
    let (sink, stream) = socket.split();
    join(state, &session, principal, sink, stream).await
}

async fn join<S, W, R>(
    state: &AppState<S>,
    session: &TableSession,
    principal: Principal,
    sink: W,
    stream: R,
) -> Result<Connection, SessionError>
where
    S: Store,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let user = principal.display_name.clone();
    let connection = attach(
        state.registry.router(session),
        principal,
        sink,
        stream,
        &state.connection,
    )
    .await?;
    info!(
        table_code = %session.code,
        connection_id = %connection.id,
        user = %user,
        "Client connected"
    );
    Ok(connection)
}

/// Query parameters of the WebSocket route.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Bearer credential from the `Authorization` header, or `?token=`.
#[must_use]
pub fn credential(headers: &HeaderMap, token: Option<&str>) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .or(token)
        .unwrap_or_default()
        .to_string()
}

/// WebSocket upgrade handler for `/ws/table/{code}`.
///
/// Unknown tables answer 404 and bad credentials 401 before upgrading.
pub async fn ws_handler<S: Store>(
    State(state): State<AppState<S>>,
    Path(code): Path<String>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let code = TableCode::new(code);
    let credential = credential(&headers, params.token.as_deref());
    let (session, principal) = admit(&state, &code, &credential).await?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let max = state.connection.max_frame_bytes;
    Ok(ws
        .max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket: WebSocket| async move {
            let (sink, stream) = socket.split();
            if let Err(e) = join(&state, &session, principal, sink, stream).await {
                warn!(table_code = %session.code, error = %e, "Could not attach connection");
            }
        }))
}
