use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Status {
    status: String,
    sessions: usize,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let status = if state.registry.is_closing() {
        "ShuttingDown"
    } else {
        "Available"
    };
    Json(Status {
        status: status.into(),
        sessions: state.registry.len(),
    })
}
