//! Transport errors and their HTTP mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tabmate_core::IdentityError;
use tabmate_session::{HubError, ReconcileError, RegistryError};
use thiserror::Error;
use tracing::error;

/// Failure to open a table session over a socket.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Error returned by HTTP handlers as a JSON `{"error": ...}` body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::MissingCredential | IdentityError::InvalidCredential => {
                Self::Unauthorized(e.to_string())
            }
            IdentityError::Unavailable(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) => Self::NotFound(e.to_string()),
            RegistryError::CodeExhausted(_) | RegistryError::Storage(_) => {
                Self::Internal(e.to_string())
            }
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::TableNotFound(_) | ReconcileError::LineNotFound(_) => {
                Self::NotFound(e.to_string())
            }
            ReconcileError::InvalidItem(_) | ReconcileError::QuantityOverflow(_) => {
                Self::BadRequest(e.to_string())
            }
            ReconcileError::Storage(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Registry(e) => e.into(),
            SessionError::Identity(e) => e.into(),
            SessionError::Hub(e) => e.into(),
        }
    }
}
