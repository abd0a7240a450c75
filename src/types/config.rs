//! Configuration types
//!
//! Sampling parameters used for every generation call.

use serde::{Deserialize, Serialize};

use crate::storage::config_manager::ConfigManager;

pub const MAX_TOKENS_KEY: &str = "MAX_TOKENS";
pub const TEMPERATURE_KEY: &str = "TEMPERATURE";
pub const TOP_P_KEY: &str = "TOP_P";
pub const REP_PENALTY_KEY: &str = "REP_PENALTY";
pub const SEED_KEY: &str = "SEED";

/// Generation parameters, fixed for the lifetime of a generator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate (> 0)
    pub max_new_tokens: u32,
    /// Sampling temperature (> 0)
    pub temperature: f32,
    /// Nucleus sampling threshold, in (0, 1]
    pub top_p: f32,
    /// Repetition penalty (>= 1)
    pub repetition_penalty: f32,
    /// Sampling seed, random per call when unset
    pub seed: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            repetition_penalty: 1.1,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Read the generation knobs, keeping defaults for absent or invalid values
    pub fn from_config(config: &ConfigManager) -> Self {
        let defaults = Self::default();

        let max_new_tokens = config
            .get_parsed::<u32>(MAX_TOKENS_KEY)
            .filter(|v| *v > 0)
            .unwrap_or(defaults.max_new_tokens);
        let temperature = config
            .get_parsed::<f32>(TEMPERATURE_KEY)
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(defaults.temperature);
        let top_p = config
            .get_parsed::<f32>(TOP_P_KEY)
            .filter(|v| *v > 0.0 && *v <= 1.0)
            .unwrap_or(defaults.top_p);
        let repetition_penalty = config
            .get_parsed::<f32>(REP_PENALTY_KEY)
            .filter(|v| v.is_finite() && *v >= 1.0)
            .unwrap_or(defaults.repetition_penalty);
        let seed = config.get_parsed::<u32>(SEED_KEY);

        let gen_config = Self {
            max_new_tokens,
            temperature,
            top_p,
            repetition_penalty,
            seed,
        };

        if gen_config.max_new_tokens != defaults.max_new_tokens
            || gen_config.temperature != defaults.temperature
            || gen_config.top_p != defaults.top_p
            || gen_config.repetition_penalty != defaults.repetition_penalty
        {
            tracing::info!("Using custom generation config: {:?}", gen_config);
        }

        gen_config
    }
}
