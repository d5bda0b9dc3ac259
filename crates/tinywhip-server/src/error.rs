use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Not implemented: {0}")]
    UnsupportedSignaling(String),

    #[error("Peer connection error: {0}")]
    PeerConnection(#[from] webrtc::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UnsupportedSignaling(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::Negotiation(_) | AppError::PeerConnection(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            AppError::NotFound(msg) => {
                tracing::debug!("Not found: {}", msg);
                status.into_response()
            }
            AppError::BadRequest(msg) | AppError::UnsupportedSignaling(msg) => {
                tracing::debug!("{}", self);
                (status, msg.clone()).into_response()
            }
            AppError::Negotiation(msg) => {
                tracing::error!("Negotiation failed: {}", msg);
                (status, "Negotiation failed").into_response()
            }
            AppError::PeerConnection(e) => {
                tracing::error!("Peer connection error: {:?}", e);
                (status, "Peer connection error").into_response()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (status, "Internal server error").into_response()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
