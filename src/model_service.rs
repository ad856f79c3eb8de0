use ndarray::ArrayView4;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("No .{extension} model found in {dir:?}")]
    NotFound { dir: PathBuf, extension: String },
    #[error("Failed to scan model directory {0:?}: {1}")]
    ReadDir(PathBuf, std::io::Error),
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Model has no output named {0}")]
    MissingOutput(String),
}

/// A loaded classifier: one preprocessed image in, one score per class out.
pub trait ModelService: Send + Sync + 'static {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError>;
}
