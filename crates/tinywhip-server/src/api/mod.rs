mod pages;
mod sessions;
mod whep;
mod whip;

use crate::error::{AppError, Result};
use crate::sfu::Negotiated;
use crate::state::AppState;
use axum::{
    body::Bytes,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::LOCATION]);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // WHIP ingest
        .route("/whip/{id}", get(pages::whip_page).post(whip::publish))
        // WHEP egress
        .route("/whep/{id}", get(pages::whep_page).post(whep::subscribe))
        // Session resources handed out in Location headers
        .route(
            "/{session}",
            axum::routing::patch(sessions::update_session).delete(sessions::delete_session),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Media type of a request, without parameters and lowercased
fn media_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
}

fn is_sdp(headers: &HeaderMap) -> bool {
    media_type(headers).as_deref() == Some(SDP_CONTENT_TYPE)
}

/// Read an optional SDP offer from a POST body.
///
/// An empty body asks the server to make the offer instead.
fn offer_from_body(headers: &HeaderMap, body: Bytes) -> Result<Option<String>> {
    if body.is_empty() {
        return Ok(None);
    }

    if !is_sdp(headers) {
        return Err(AppError::BadRequest(format!(
            "Expected Content-Type {}",
            SDP_CONTENT_TYPE
        )));
    }

    String::from_utf8(body.to_vec())
        .map(Some)
        .map_err(|_| AppError::BadRequest("SDP body is not valid UTF-8".into()))
}

/// 201 with the local SDP and the session resource in `Location`
fn sdp_created(negotiated: Negotiated) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::CONTENT_TYPE, SDP_CONTENT_TYPE.to_string()),
            (header::LOCATION, format!("/{}", negotiated.session_id)),
        ],
        negotiated.sdp,
    )
        .into_response()
}
