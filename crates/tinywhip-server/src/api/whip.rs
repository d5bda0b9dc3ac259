use super::{offer_from_body, sdp_created};
use crate::error::Result;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
};

pub async fn publish(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let offer = offer_from_body(&headers, body)?;
    tracing::info!(
        "WHIP publish request for stream {} ({})",
        stream_id,
        if offer.is_some() { "client offer" } else { "server offer" }
    );

    let negotiated = state.sfu.publish(&stream_id, offer).await?;
    Ok(sdp_created(negotiated))
}
