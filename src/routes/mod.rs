mod health;
mod index;
mod metrics;
mod ws;

use crate::server::SharedState;
use axum::{routing::get, Router};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index_page))
        .route("/ws", get(ws::websocket_handler))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
