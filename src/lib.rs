pub mod app;
pub mod config;
pub mod offload;
pub mod overlay;
pub mod pipeline;
pub mod predictor;
pub mod prompt;
pub mod registry;
mod routes;
mod server;
pub mod session;
pub mod telemetry;
pub mod tree;

pub use app::{start_app, App};
