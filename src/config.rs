use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    pub upload: UploadConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.model.validate()?;
        self.upload.validate()
    }
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub error_mode: ErrorMode,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        for origin in &self.allowed_origins {
            if origin.parse::<axum::http::HeaderValue>().is_err() {
                return Err(format!(
                    "server.allowed_origins contains an invalid origin: {:?}",
                    origin
                ));
            }
        }
        Ok(())
    }
}

/// How model and inference failures reach the client.
///
/// `Structured` answers with an HTTP error status and a stable error code.
/// `Legacy` answers 200 with a sentinel result (`Error1` when no model is
/// loaded, `Error` otherwise) for clients built against the first version
/// of the API.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    #[default]
    Structured,
    Legacy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    #[serde(default = "default_model_extension")]
    pub extension: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default)]
    pub input_layout: InputLayout,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.input_size == 0 {
            return Err("model.input_size must be greater than zero".into());
        }
        if self.extension.is_empty() {
            return Err("model.extension must not be empty".into());
        }
        if self.labels.is_empty() {
            return Err("model.labels must not be empty".into());
        }
        Ok(())
    }
}

fn default_model_extension() -> String {
    "onnx".into()
}

fn default_input_size() -> u32 {
    150
}

fn default_labels() -> Vec<String> {
    vec!["Caries".into(), "Gingivitis".into(), "Healthy".into()]
}

/// Memory layout of the model input tensor.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    /// `[1, height, width, 3]`, the layout of models exported from Keras.
    #[default]
    Nhwc,
    /// `[1, 3, height, width]`
    Nchw,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    pub staging_dir: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_max_upload_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["png".into(), "jpg".into(), "jpeg".into()]
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.allowed_extensions.is_empty() {
            return Err("upload.allowed_extensions must not be empty".into());
        }
        if self.max_upload_bytes == 0 {
            return Err("upload.max_upload_bytes must be greater than zero".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert!(matches!(
            LogLevel::try_from("DEBUG".to_string()),
            Ok(LogLevel::Debug)
        ));
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!(
            Environment::try_from("Production".to_string())
                .unwrap()
                .as_str(),
            "production"
        );
        assert!(Environment::try_from("staging".to_string()).is_err());
    }

    #[test]
    fn test_defaults_from_yaml() {
        let yaml = r#"
log_level: info
server:
  host: 127.0.0.1
  port: 5000
model:
  model_dir: model
upload:
  staging_dir: uploads
"#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.server.get_address(), "127.0.0.1:5000");
        assert_eq!(config.server.error_mode, ErrorMode::Structured);
        assert_eq!(config.model.extension, "onnx");
        assert_eq!(config.model.input_size, 150);
        assert_eq!(config.model.input_layout, InputLayout::Nhwc);
        assert_eq!(config.model.labels, vec!["Caries", "Gingivitis", "Healthy"]);
        assert_eq!(config.upload.max_upload_bytes, 16 * 1024 * 1024);
        assert_eq!(config.upload.allowed_extensions, vec!["png", "jpg", "jpeg"]);
        assert!(config.validate().is_ok());
    }

    fn model_config() -> ModelConfig {
        ModelConfig {
            model_dir: PathBuf::from("model"),
            extension: "onnx".into(),
            input_size: 150,
            input_layout: InputLayout::Nhwc,
            output_name: None,
            labels: default_labels(),
        }
    }

    #[test]
    fn test_model_validation() {
        assert!(model_config().validate().is_ok());

        let zero_size = ModelConfig {
            input_size: 0,
            ..model_config()
        };
        assert!(zero_size.validate().is_err());

        let no_labels = ModelConfig {
            labels: vec![],
            ..model_config()
        };
        assert!(no_labels.validate().is_err());
    }

    #[test]
    fn test_server_validation_rejects_bad_origin() {
        let mut server = ServerConfig {
            host: "127.0.0.1".into(),
            port: 5000,
            allowed_origins: vec!["https://clinic.example".into()],
            error_mode: ErrorMode::Structured,
        };
        assert!(server.validate().is_ok());

        server.allowed_origins.push("https://clinic\n.example".into());
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_upload_validation_rejects_empty_allow_set() {
        let upload = UploadConfig {
            staging_dir: PathBuf::from("uploads"),
            max_upload_bytes: 1024,
            allowed_extensions: vec![],
        };
        assert!(upload.validate().is_err());
    }
}
