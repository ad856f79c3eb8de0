use crate::{
    config::{InputLayout, ModelConfig},
    model_service::{ModelError, ModelService},
    ort_service::OrtModelService,
};
use image::imageops::FilterType;
use ndarray::{Array, Ix4};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::instrument;

const MODEL_UNAVAILABLE_CATEGORY: &str = "Error1";
const FAILURE_CATEGORY: &str = "Error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub category: String,
    pub percentage: f64,
}

impl PredictionResult {
    /// Placeholder result standing in for a failed prediction.
    pub fn sentinel(error: &PredictionError) -> Self {
        Self {
            category: error.sentinel_category().to_string(),
            percentage: 0.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("No model is loaded")]
    ModelUnavailable,
    #[error("Could not process image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("Inference failed: {0}")]
    Inference(#[from] ModelError),
    #[error("Model returned unusable scores: {0}")]
    InvalidOutput(String),
    #[error("Predicted class index {0} has no label")]
    UnknownClass(usize),
    #[error("Prediction task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PredictionError {
    /// Category reported in place of a label when the error is surfaced as a
    /// sentinel result.
    pub fn sentinel_category(&self) -> &'static str {
        match self {
            PredictionError::ModelUnavailable => MODEL_UNAVAILABLE_CATEGORY,
            _ => FAILURE_CATEGORY,
        }
    }
}

/// Decodes the image at `path` into a `[1, size, size, 3]` (or
/// `[1, 3, size, size]`) tensor of RGB values scaled to [0, 1].
pub fn load_image_tensor(
    path: &Path,
    size: u32,
    layout: InputLayout,
) -> Result<Array<f32, Ix4>, image::ImageError> {
    let original_img = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;

    let img = original_img
        .resize_exact(size, size, FilterType::Nearest)
        .to_rgb8();

    let side = size as usize;
    let mut input: Array<f32, Ix4> = match layout {
        InputLayout::Nhwc => Array::zeros((1, side, side, 3)),
        InputLayout::Nchw => Array::zeros((1, 3, side, side)),
    };

    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        for (channel, value) in pixel.0.iter().enumerate() {
            let value = (*value as f32) / 255.;
            match layout {
                InputLayout::Nhwc => input[[0, y, x, channel]] = value,
                InputLayout::Nchw => input[[0, channel, y, x]] = value,
            }
        }
    }

    Ok(input)
}

/// Turns raw model output into probabilities. Outputs that already look like
/// probabilities are returned unchanged, anything else goes through softmax.
///
/// Only the range is checked, not the sum: independent per-class scores such
/// as sigmoid outputs in [0, 1] are reported as they are, `score * 100`.
fn to_probabilities(scores: Vec<f32>) -> Result<Vec<f32>, PredictionError> {
    if scores.is_empty() {
        return Err(PredictionError::InvalidOutput("empty output".into()));
    }
    if scores.iter().any(|s| !s.is_finite()) {
        return Err(PredictionError::InvalidOutput(format!(
            "non-finite scores {:?}",
            scores
        )));
    }
    if scores.iter().all(|s| (0.0..=1.0).contains(s)) {
        return Ok(scores);
    }

    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    Ok(exps.into_iter().map(|e| e / sum).collect())
}

/// Index and value of the highest score. Ties go to the lowest index.
fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .enumerate()
        .map(|(index, value)| (index, *value))
        .reduce(|accum, row| if row.1 > accum.1 { row } else { accum })
}

fn classify(scores: Vec<f32>, labels: &[String]) -> Result<PredictionResult, PredictionError> {
    let probabilities = to_probabilities(scores)?;
    let (index, probability) = argmax(&probabilities)
        .ok_or_else(|| PredictionError::InvalidOutput("empty output".into()))?;
    let label = labels
        .get(index)
        .ok_or(PredictionError::UnknownClass(index))?;

    Ok(PredictionResult {
        category: label.clone(),
        percentage: (f64::from(probability) * 100.0).clamp(0.0, 100.0),
    })
}

pub struct PredictionService {
    model: Option<Arc<dyn ModelService>>,
    labels: Vec<String>,
    input_size: u32,
    input_layout: InputLayout,
}

impl PredictionService {
    /// Loads the newest model artifact from the configured directory. A
    /// missing or broken artifact leaves the service without a model instead
    /// of failing startup.
    pub fn load(model_config: &ModelConfig) -> Self {
        let model: Option<Arc<dyn ModelService>> = match OrtModelService::from_config(model_config)
        {
            Ok(model) => Some(Arc::new(model)),
            Err(e) => {
                tracing::error!("Model unavailable: {}", e);
                None
            }
        };

        Self {
            model,
            labels: model_config.labels.clone(),
            input_size: model_config.input_size,
            input_layout: model_config.input_layout,
        }
    }

    pub fn with_model(model: impl ModelService, labels: Vec<String>) -> Self {
        Self {
            model: Some(Arc::new(model)),
            labels,
            input_size: 150,
            input_layout: InputLayout::Nhwc,
        }
    }

    pub fn unavailable(labels: Vec<String>) -> Self {
        Self {
            model: None,
            labels,
            input_size: 150,
            input_layout: InputLayout::Nhwc,
        }
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Classifies the image at `image_path`. Decoding and inference run on
    /// the blocking thread pool.
    #[instrument(skip(self))]
    pub async fn predict(&self, image_path: &Path) -> Result<PredictionResult, PredictionError> {
        let model = self
            .model
            .clone()
            .ok_or(PredictionError::ModelUnavailable)?;

        let path: PathBuf = image_path.to_path_buf();
        let size = self.input_size;
        let layout = self.input_layout;

        let scores = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, PredictionError> {
            let input = load_image_tensor(&path, size, layout)?;
            Ok(model.predict(input.view())?)
        })
        .await??;

        let result = classify(scores, &self.labels)?;
        tracing::info!(
            "Predicted class: {} ({:.2}%)",
            result.category,
            result.percentage
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    struct FixedScores(Vec<f32>);

    impl ModelService for FixedScores {
        fn predict(&self, input: ndarray::ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError> {
            assert_eq!(input.shape(), &[1, 150, 150, 3]);
            Ok(self.0.clone())
        }
    }

    struct FailingModel;

    impl ModelService for FailingModel {
        fn predict(&self, _input: ndarray::ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError> {
            Err(ModelError::MissingOutput("dense_1".into()))
        }
    }

    fn labels() -> Vec<String> {
        vec!["Caries".into(), "Gingivitis".into(), "Healthy".into()]
    }

    fn write_png(dir: &Path, width: u32, height: u32) -> PathBuf {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb([255, 0, 51]));
        let path = dir.join("tooth.png");
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_load_image_tensor_nhwc() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), 40, 20);

        let input = load_image_tensor(&path, 150, InputLayout::Nhwc).unwrap();

        assert_eq!(input.shape(), &[1, 150, 150, 3]);
        assert_eq!(input[[0, 10, 10, 0]], 1.0);
        assert_eq!(input[[0, 10, 10, 1]], 0.0);
        assert_eq!(input[[0, 149, 149, 2]], 0.2);
        assert!(input.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_load_image_tensor_nchw() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), 100, 100);

        let input = load_image_tensor(&path, 64, InputLayout::Nchw).unwrap();

        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert_eq!(input[[0, 0, 5, 5]], 1.0);
        assert_eq!(input[[0, 2, 5, 5]], 0.2);
    }

    #[test]
    fn test_load_image_tensor_ignores_extension() {
        let dir = tempfile::tempdir().unwrap();
        let png = write_png(dir.path(), 8, 8);
        let renamed = dir.path().join("tooth.jpg");
        std::fs::rename(&png, &renamed).unwrap();

        assert!(load_image_tensor(&renamed, 150, InputLayout::Nhwc).is_ok());
    }

    #[test]
    fn test_argmax_prefers_first_on_tie() {
        assert_eq!(argmax(&[0.4, 0.4, 0.2]), Some((0, 0.4)));
        assert_eq!(argmax(&[0.1, 0.2, 0.7]), Some((2, 0.7)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_logits_go_through_softmax() {
        let result = classify(vec![-1.0, 3.0, 0.5], &labels()).unwrap();
        assert_eq!(result.category, "Gingivitis");
        assert!(result.percentage > 50.0 && result.percentage <= 100.0);

        let probabilities = to_probabilities(vec![-1.0, 3.0, 0.5]).unwrap();
        let total: f32 = probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_in_range_scores_are_not_renormalized() {
        let result = classify(vec![0.9, 0.8, 0.7], &labels()).unwrap();
        assert_eq!(result.category, "Caries");
        assert!((result.percentage - 90.0).abs() < 1e-4);
    }

    #[test]
    fn test_classify_rejects_bad_output() {
        assert!(matches!(
            classify(vec![], &labels()),
            Err(PredictionError::InvalidOutput(_))
        ));
        assert!(matches!(
            classify(vec![0.1, f32::NAN, 0.2], &labels()),
            Err(PredictionError::InvalidOutput(_))
        ));
        assert!(matches!(
            classify(vec![0.1, 0.1, 0.1, 0.7], &labels()),
            Err(PredictionError::UnknownClass(3))
        ));
    }

    #[tokio::test]
    async fn test_predict_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), 30, 30);
        let service = PredictionService::with_model(FixedScores(vec![0.1, 0.2, 0.7]), labels());

        let result = service.predict(&path).await.unwrap();

        assert_eq!(result.category, "Healthy");
        assert!((result.percentage - 70.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_predict_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), 30, 30);
        let service = PredictionService::unavailable(labels());

        assert!(!service.is_model_loaded());
        let err = service.predict(&path).await.unwrap_err();
        assert!(matches!(err, PredictionError::ModelUnavailable));
        assert_eq!(
            PredictionResult::sentinel(&err),
            PredictionResult {
                category: "Error1".into(),
                percentage: 0.0
            }
        );
    }

    #[tokio::test]
    async fn test_predict_undecodable_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tooth.jpg");
        std::fs::write(&path, b"plain text, not an image").unwrap();
        let service = PredictionService::with_model(FixedScores(vec![0.1, 0.2, 0.7]), labels());

        let err = service.predict(&path).await.unwrap_err();
        assert!(matches!(err, PredictionError::InvalidImage(_)));
        assert_eq!(
            PredictionResult::sentinel(&err),
            PredictionResult {
                category: "Error".into(),
                percentage: 0.0
            }
        );
    }

    #[tokio::test]
    async fn test_predict_inference_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), 30, 30);
        let service = PredictionService::with_model(FailingModel, labels());

        let err = service.predict(&path).await.unwrap_err();
        assert!(matches!(err, PredictionError::Inference(_)));
        assert_eq!(PredictionResult::sentinel(&err).category, "Error");
    }
}
