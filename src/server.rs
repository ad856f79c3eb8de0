use crate::{
    config::{Config, ErrorMode, ServerConfig},
    prediction::PredictionService,
    routes::api_routes,
    telemetry::Metrics,
    upload::UploadStager,
};
use axum::{extract::DefaultBodyLimit, http, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct SharedState {
    pub prediction_service: Arc<PredictionService>,
    pub stager: UploadStager,
    pub allowed_extensions: Arc<Vec<String>>,
    pub error_mode: ErrorMode,
    pub metrics: Arc<Metrics>,
}

impl SharedState {
    pub fn new(
        prediction_service: Arc<PredictionService>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            prediction_service,
            stager: UploadStager::new(&config.upload.staging_dir),
            allowed_extensions: Arc::new(config.upload.allowed_extensions.clone()),
            error_mode: config.server.error_mode,
            metrics,
        }
    }
}

fn cors_layer(server_config: &ServerConfig) -> CorsLayer {
    if server_config.allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<http::HeaderValue> = server_config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<http::HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}: {}", origin, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers([http::header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600))
}

pub fn build_router(state: SharedState, config: &Config) -> Router {
    Router::new()
        .merge(api_routes())
        .layer(DefaultBodyLimit::max(config.upload.max_upload_bytes))
        .layer(cors_layer(&config.server))
        .with_state(state)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        prediction_service: Arc<PredictionService>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState::new(prediction_service, config, metrics);
        let router = build_router(app_state, config).layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async {
                shutdown_signal().await;
                tracing::info!("Shutdown signal received, starting graceful shutdown");
            })
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
