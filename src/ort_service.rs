use crate::{
    config::ModelConfig,
    model_service::{ModelError, ModelService},
};
use ndarray::{ArrayView4, CowArray, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

/// Picks the most recently modified file in `dir` whose extension matches
/// `extension` (case-insensitive).
pub fn find_latest_model(dir: &Path, extension: &str) -> Result<PathBuf, ModelError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ModelError::ReadDir(dir.to_path_buf(), e))?;

    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| ModelError::ReadDir(dir.to_path_buf(), e))?;
        let path = entry.path();

        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if !matches || !path.is_file() {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                tracing::warn!("Skipping {:?}, cannot read modification time: {}", path, e);
                continue;
            }
        };

        match &latest {
            Some((newest, _)) if *newest >= modified => {}
            _ => latest = Some((modified, path)),
        }
    }

    latest.map(|(_, path)| path).ok_or_else(|| ModelError::NotFound {
        dir: dir.to_path_buf(),
        extension: extension.to_string(),
    })
}

/// Borrows `input` when it is already in standard layout, copies it otherwise.
fn contiguous(input: ArrayView4<'_, f32>) -> CowArray<'_, f32, Ix4> {
    if input.is_standard_layout() {
        CowArray::from(input)
    } else {
        CowArray::from(input.as_standard_layout().into_owned())
    }
}

pub struct OrtModelService {
    session: Mutex<Session>,
    output_name: String,
}

impl OrtModelService {
    pub fn from_config(model_config: &ModelConfig) -> Result<Self, ModelError> {
        let model_path = find_latest_model(&model_config.model_dir, &model_config.extension)?;
        let service = Self::from_file(&model_path, model_config.output_name.as_deref())?;
        tracing::info!("Loaded model: {:?}", model_path);
        Ok(service)
    }

    pub fn from_file(path: &Path, output_name: Option<&str>) -> Result<Self, ModelError> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(path)?;

        let output_name = match output_name {
            Some(name) => {
                if !session.outputs.iter().any(|o| o.name == name) {
                    return Err(ModelError::MissingOutput(name.to_string()));
                }
                name.to_string()
            }
            None => session
                .outputs
                .first()
                .map(|o| o.name.clone())
                .ok_or_else(|| ModelError::MissingOutput("<first output>".into()))?,
        };

        tracing::debug!("Reading scores from output {}", output_name);

        Ok(Self {
            session: Mutex::new(session),
            output_name,
        })
    }
}

impl ModelService for OrtModelService {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError> {
        let input = contiguous(input);
        let tensor_ref = TensorRef::from_array_view(input.view())?;

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (_, scores) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;

        Ok(scores.to_vec())
    }
}
