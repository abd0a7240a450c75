//! Settings
//!
//! Typed view of the configuration values used to locate and load the model.

use crate::storage::config_manager::ConfigManager;
use crate::storage::get_data_dir;
use crate::types::{DevicePreference, MIN_CONTEXT_SIZE};
use std::path::PathBuf;
use std::time::Duration;

/// Primary model when `MODEL_NAME` is unset
pub const DEFAULT_MODEL_NAME: &str =
    "TheBloke/deepseek-llm-7B-chat-GGUF/deepseek-llm-7b-chat.Q4_K_M.gguf";

/// Hub endpoint when `HF_ENDPOINT` is unset
pub const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";

/// Context window used when `CONTEXT_SIZE` is unset
pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;

/// Model loading and runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Primary model: local GGUF path or Hugging Face reference
    pub model_name: String,
    /// Model tried when the primary fails to load
    pub fallback_model_name: String,
    /// Hugging Face access token
    pub hf_token: Option<String>,
    /// Hub base URL, overridable to use a mirror
    pub hf_endpoint: String,
    /// Directory where downloaded model files (.gguf) are stored
    pub models_dir: PathBuf,
    /// Number of layers to offload, `None` to derive it from the device
    pub gpu_layers: Option<u32>,
    /// Context window size
    pub context_size: u32,
    /// Device selection preference
    pub device: DevicePreference,
    /// Upper bound on a single async generation
    pub generation_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            fallback_model_name: DEFAULT_MODEL_NAME.to_string(),
            hf_token: None,
            hf_endpoint: DEFAULT_HF_ENDPOINT.to_string(),
            models_dir: default_models_dir(),
            gpu_layers: None,
            context_size: DEFAULT_CONTEXT_SIZE,
            device: DevicePreference::Auto,
            generation_timeout: None,
        }
    }
}

impl Settings {
    /// Build settings from the configuration store
    pub fn from_config(config: &ConfigManager) -> Self {
        let defaults = Self::default();

        let model_name = config
            .get("MODEL_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.model_name);
        let fallback_model_name = config
            .get("FALLBACK_MODEL_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| model_name.clone());
        let hf_token = config.get("HF_API_TOKEN").filter(|v| !v.trim().is_empty());
        let hf_endpoint = config
            .get("HF_ENDPOINT")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.hf_endpoint);
        let models_dir = config
            .get("MODELS_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.models_dir);
        let context_size = config
            .get_parsed::<u32>("CONTEXT_SIZE")
            .filter(|v| *v >= MIN_CONTEXT_SIZE)
            .unwrap_or(defaults.context_size);
        let device = config
            .get("DEVICE")
            .map(|raw| {
                raw.parse::<DevicePreference>().unwrap_or_else(|e| {
                    tracing::warn!("{}, using auto", e);
                    DevicePreference::Auto
                })
            })
            .unwrap_or_default();
        let generation_timeout = config
            .get_parsed::<u64>("GENERATION_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            model_name,
            fallback_model_name,
            hf_token,
            hf_endpoint,
            models_dir,
            gpu_layers: config.get_parsed::<u32>("GPU_LAYERS"),
            context_size,
            device,
            generation_timeout,
        }
    }
}

fn default_models_dir() -> PathBuf {
    get_data_dir()
        .ok()
        .map(|d| d.join("models"))
        .unwrap_or_else(|| PathBuf::from("./models"))
}
