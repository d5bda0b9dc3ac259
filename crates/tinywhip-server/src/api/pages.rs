//! Browser test pages for publishing and playing a stream

use axum::{extract::Path, response::Html};

const WHIP_PAGE: &str = include_str!("../../assets/whip.html");
const WHEP_PAGE: &str = include_str!("../../assets/whep.html");

pub async fn whip_page(Path(_stream_id): Path<String>) -> Html<&'static str> {
    Html(WHIP_PAGE)
}

pub async fn whep_page(Path(_stream_id): Path<String>) -> Html<&'static str> {
    Html(WHEP_PAGE)
}
