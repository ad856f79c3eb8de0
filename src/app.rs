use crate::config::Config;
use crate::prediction::PredictionService;
use crate::server::HttpServer;

use std::{error::Error, sync::Arc};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let model_config = config.model.clone();
    let prediction_service =
        tokio::task::spawn_blocking(move || PredictionService::load(&model_config)).await?;

    if !prediction_service.is_model_loaded() {
        tracing::warn!(
            "Starting without a model, predictions will fail until a .{} file is placed in {:?} and the service restarted",
            config.model.extension,
            config.model.model_dir
        );
    }

    let server = match HttpServer::new(Arc::new(prediction_service), &config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to initialize http server: {:?}", e);
            return Err(e.into());
        }
    };

    server.run().await?;

    tracing::info!("Server stopped");

    Ok(())
}
