use super::{is_sdp, media_type};
use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use uuid::Uuid;

fn parse_session_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound(format!("Session {} not found", raw)))
}

/// PATCH completes a server-offered negotiation. Trickle ICE and ICE restart
/// use other content types and are not supported.
pub async fn update_session(
    State(state): State<AppState>,
    Path(session): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let session_id = parse_session_id(&session)?;
    state.sfu.sessions().get(session_id).await?;

    if !is_sdp(&headers) {
        return Err(AppError::UnsupportedSignaling(format!(
            "PATCH with content type {} (trickle ICE / ICE restart) is not supported",
            media_type(&headers).unwrap_or_else(|| "none".to_string())
        )));
    }

    let answer = String::from_utf8(body.to_vec())
        .map_err(|_| AppError::BadRequest("SDP body is not valid UTF-8".into()))?;
    if answer.trim().is_empty() {
        return Err(AppError::BadRequest("Empty SDP answer".into()));
    }

    state.sfu.apply_answer(session_id, answer).await?;
    Ok(StatusCode::OK)
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<StatusCode> {
    let session_id = parse_session_id(&session)?;
    state.sfu.close_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
