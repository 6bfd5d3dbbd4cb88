use crate::server::SharedState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use tracing::instrument;

#[instrument(skip(state))]
pub async fn index_page(State(state): State<SharedState>) -> Response {
    match tokio::fs::read_to_string(state.index_file.as_path()).await {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            tracing::warn!("Index page {:?} unavailable: {}", state.index_file, e);
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    }
}
