use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

const DEFAULT_CONFIG_PATH: &str = "config/classifier.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub limits: LimitsConfig,
    pub preprocessing: PreprocessingConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub path: String,
    pub labels_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_file_size: usize,
    pub min_dimension: u32,
    pub max_dimension: u32,
    pub max_batch_size: usize,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub max_parallel_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub input_size: u32,
    pub resize_method: String,
    pub normalization: NormalizationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// JSON Lines file; the log lives only in memory when unset.
    pub path: Option<String>,
    pub max_entries: usize,
    pub default_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            static_dir: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "MobileNetV2 (ImageNet)".to_string(),
            path: "models/mobilenet_v2.pt".to_string(),
            labels_path: "models/imagenet_labels.txt".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 16 * 1024 * 1024,
            min_dimension: 32,
            max_dimension: 4096,
            max_batch_size: 10,
            default_top_k: 5,
            max_top_k: 1000,
            max_parallel_items: 4,
        }
    }
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            resize_method: "catmull_rom".to_string(),
            normalization: NormalizationConfig::default(),
        }
    }
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: 1000,
            default_limit: 50,
        }
    }
}

impl AppConfig {
    /// Reads the YAML file named by `CLASSIFIER_CONFIG` (or the default path when
    /// present), then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = env::var("CLASSIFIER_CONFIG").ok();
        let config_path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if explicit.is_some() || Path::new(&config_path).exists() {
            log::info!("Loading configuration from {}", config_path);
            Self::from_file(&config_path)?
        } else {
            log::info!("No configuration file at {}, using defaults", config_path);
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT is not a valid port: {}", port)))?;
        }
        if let Ok(dir) = env::var("STATIC_DIR") {
            self.server.static_dir = Some(dir);
        }
        if let Ok(path) = env::var("MODEL_PATH") {
            self.model.path = path;
        }
        if let Ok(path) = env::var("LABELS_PATH") {
            self.model.labels_path = path;
        }
        if let Ok(path) = env::var("HISTORY_PATH") {
            self.history.path = Some(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.min_dimension == 0 || limits.min_dimension > limits.max_dimension {
            return Err(ConfigError::Invalid(format!(
                "dimension range [{}, {}] is empty",
                limits.min_dimension, limits.max_dimension
            )));
        }
        if limits.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be positive".into()));
        }
        if limits.default_top_k == 0 || limits.default_top_k > limits.max_top_k {
            return Err(ConfigError::Invalid(format!(
                "default_top_k {} must be in [1, {}]",
                limits.default_top_k, limits.max_top_k
            )));
        }
        if limits.max_parallel_items == 0 {
            return Err(ConfigError::Invalid("max_parallel_items must be positive".into()));
        }
        if self.preprocessing.input_size == 0 {
            return Err(ConfigError::Invalid("input_size must be positive".into()));
        }
        if self.preprocessing.normalization.std.iter().any(|s| *s <= 0.0) {
            return Err(ConfigError::Invalid("normalization std must be positive".into()));
        }
        if self.history.max_entries == 0 {
            return Err(ConfigError::Invalid("history.max_entries must be positive".into()));
        }
        Ok(())
    }
}
