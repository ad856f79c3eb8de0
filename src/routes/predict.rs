use crate::{
    config::ErrorMode,
    prediction::{PredictionError, PredictionResult},
    server::SharedState,
    upload::{allowed_file, UploadError},
};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

const ROUTE: &str = "/api/predict";
const IMAGE_FIELD: &str = "image";

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub results: Vec<PredictionResult>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No image provided")]
    MissingImage,
    #[error("No selected file")]
    EmptyFilename,
    #[error("Invalid file type")]
    InvalidFileType,
    #[error("Malformed upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Staging failed: {0}")]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingImage | ApiError::EmptyFilename | ApiError::InvalidFileType => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Multipart(e) => e.status(),
            ApiError::Upload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Prediction(e) => match e {
                PredictionError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                PredictionError::InvalidImage(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::MissingImage => "missing_image",
            ApiError::EmptyFilename => "empty_filename",
            ApiError::InvalidFileType => "invalid_file_type",
            ApiError::Multipart(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                "payload_too_large"
            }
            ApiError::Multipart(_) => "invalid_multipart",
            ApiError::Upload(_) => "internal",
            ApiError::Prediction(e) => match e {
                PredictionError::ModelUnavailable => "model_unavailable",
                PredictionError::InvalidImage(_) => "invalid_image",
                PredictionError::Inference(_)
                | PredictionError::InvalidOutput(_)
                | PredictionError::UnknownClass(_) => "inference_failed",
                PredictionError::Task(_) => "internal",
            },
        }
    }

    /// Client facing message. Server side failures only carry a generic
    /// description, the detail goes to the log.
    fn message(&self) -> String {
        match self {
            ApiError::Multipart(e) => e.body_text(),
            ApiError::Prediction(PredictionError::InvalidImage(_))
            | ApiError::Prediction(PredictionError::ModelUnavailable) => self.to_string(),
            ApiError::Prediction(PredictionError::Task(_)) | ApiError::Upload(_) => {
                "Internal server error".into()
            }
            ApiError::Prediction(_) => "Inference failed".into(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }

        let body = ErrorBody {
            error: self.message(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Pulls the `image` file field out of the form. A field without a filename
/// is not a file upload and is skipped.
async fn read_image_field(multipart: &mut Multipart) -> Result<(String, Bytes), ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let data = field.bytes().await?;
        return Ok((filename, data));
    }

    Err(ApiError::MissingImage)
}

#[instrument(skip(state, multipart))]
pub async fn predict(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    state.metrics.record_request(ROUTE);

    // Anything that is not a multipart form cannot carry an image.
    let mut multipart = multipart.map_err(|_| ApiError::MissingImage)?;
    let (filename, data) = read_image_field(&mut multipart).await?;

    if filename.is_empty() {
        return Err(ApiError::EmptyFilename);
    }
    if !allowed_file(&filename, state.allowed_extensions.as_slice()) {
        return Err(ApiError::InvalidFileType);
    }

    tracing::info!("Image received: {} ({} bytes)", filename, data.len());

    let staged = state.stager.stage(&filename, &data).await?;
    let started = Instant::now();
    let outcome = state.prediction_service.predict(staged.path()).await;
    drop(staged);

    state
        .metrics
        .record_prediction_duration(started.elapsed().as_millis() as u64, ROUTE);

    let result = match outcome {
        Ok(result) => {
            state.metrics.record_prediction("success");
            result
        }
        Err(e) => {
            state.metrics.record_prediction("error");
            match state.error_mode {
                ErrorMode::Structured => return Err(e.into()),
                ErrorMode::Legacy => {
                    tracing::error!("Prediction failed: {}", e);
                    PredictionResult::sentinel(&e)
                }
            }
        }
    };

    Ok(Json(PredictResponse {
        results: vec![result],
    }))
}
