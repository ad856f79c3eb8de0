mod ort_service;
mod routes;
mod telemetry;

pub mod app;
pub mod config;
pub mod model_service;
pub mod prediction;
pub mod server;
pub mod upload;

pub use app::start_app;
pub use telemetry::Metrics;
