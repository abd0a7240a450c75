//! Model types
//!
//! Execution devices and tokenizer special-token ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Smallest context window accepted from configuration
pub const MIN_CONTEXT_SIZE: u32 = 512;

/// Context window to create for a model trained on `trained` tokens
///
/// Honors the request down to [`MIN_CONTEXT_SIZE`] but never exceeds the
/// training context. A model reporting no training context gets the request.
pub fn effective_context_size(requested: u32, trained: u32) -> u32 {
    let requested = requested.max(MIN_CONTEXT_SIZE);
    if trained == 0 {
        requested
    } else {
        requested.min(trained)
    }
}

/// Layer count large enough to offload every layer of any supported model
pub const ALL_GPU_LAYERS: u32 = 99;

/// Execution target selected for inference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    /// A GPU (Metal, CUDA or Vulkan depending on the build)
    Accelerator { name: String },
    /// General-purpose CPU
    Cpu,
}

impl Device {
    /// Number of layers to offload when the user did not pick one
    pub fn default_gpu_layers(&self) -> u32 {
        match self {
            Device::Accelerator { .. } => ALL_GPU_LAYERS,
            Device::Cpu => 0,
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator { .. })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Accelerator { name } => write!(f, "gpu ({})", name),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// User preference for device selection (`DEVICE` setting)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DevicePreference {
    /// Use an accelerator when one is detected
    #[default]
    Auto,
    /// Force CPU inference
    Cpu,
    /// Require an accelerator, falling back to CPU with a warning
    Gpu,
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "gpu" | "cuda" | "metal" | "mps" | "vulkan" => Ok(DevicePreference::Gpu),
            other => Err(format!("unknown device preference: {}", other)),
        }
    }
}

/// Token ids the generator needs for stopping and decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    /// End-of-sequence token
    pub eos: i32,
    /// Padding token, `None` when the vocabulary has none
    pub pad: Option<i32>,
}

impl SpecialTokens {
    /// Alias the padding token to end-of-sequence when the model lacks one
    pub fn with_pad_fallback(self) -> Self {
        Self {
            eos: self.eos,
            pad: Some(self.pad.unwrap_or(self.eos)),
        }
    }

    /// Padding token id, end-of-sequence when unset
    pub fn pad_id(&self) -> i32 {
        self.pad.unwrap_or(self.eos)
    }

    /// Whether `token` should be dropped from decoded output
    pub fn is_special(&self, token: i32) -> bool {
        token == self.eos || token == self.pad_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_fallback_aliases_eos() {
        let tokens = SpecialTokens { eos: 2, pad: None }.with_pad_fallback();
        assert_eq!(tokens.pad, Some(2));

        let tokens = SpecialTokens { eos: 2, pad: Some(0) }.with_pad_fallback();
        assert_eq!(tokens.pad, Some(0));
        assert!(tokens.is_special(0));
        assert!(tokens.is_special(2));
        assert!(!tokens.is_special(5));
    }

    #[test]
    fn test_device_preference_parse() {
        assert_eq!("auto".parse::<DevicePreference>(), Ok(DevicePreference::Auto));
        assert_eq!("CPU".parse::<DevicePreference>(), Ok(DevicePreference::Cpu));
        assert_eq!("mps".parse::<DevicePreference>(), Ok(DevicePreference::Gpu));
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_effective_context_size() {
        assert_eq!(effective_context_size(4096, 32768), 4096);
        assert_eq!(effective_context_size(4096, 2048), 2048);
        assert_eq!(effective_context_size(100, 32768), MIN_CONTEXT_SIZE);
        // Never above the training context, even below the floor
        assert_eq!(effective_context_size(4096, 256), 256);
        assert_eq!(effective_context_size(1024, 0), 1024);
    }

    #[test]
    fn test_default_gpu_layers() {
        assert_eq!(Device::Cpu.default_gpu_layers(), 0);
        let gpu = Device::Accelerator {
            name: "Apple M2 (Metal)".to_string(),
        };
        assert_eq!(gpu.default_gpu_layers(), ALL_GPU_LAYERS);
        assert_eq!(Device::Cpu.to_string(), "cpu");
    }
}
