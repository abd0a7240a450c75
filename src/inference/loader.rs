//! Model loader
//!
//! Loads the configured model exactly once and hands out shared handles to it.
//! When the primary model fails to load, the fallback model is tried once.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::inference::engine::{EngineError, LanguageModel};
use crate::inference::provider::ModelProvider;
use crate::storage::huggingface::HubError;
use crate::storage::Settings;
use crate::system::select_device;
use crate::types::{Device, DevicePreference, SpecialTokens};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Model has not been initialized")]
    NotInitialized,

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Primary and fallback models failed to load (primary: {primary}; fallback: {fallback})")]
    AllModelsFailed { primary: String, fallback: String },

    #[error("Loader task failed: {0}")]
    Worker(String),
}

/// Shared reference to the loaded model
#[derive(Clone)]
pub struct ModelHandle {
    pub model: Arc<dyn LanguageModel>,
    /// Special tokens with the pad fallback applied
    pub tokens: SpecialTokens,
    pub device: Device,
    /// Name the model was loaded from (primary or fallback)
    pub model_name: String,
}

impl ModelHandle {
    /// Whether both handles point at the same loaded model
    pub fn same_model(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.model, &other.model)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_name", &self.model_name)
            .field("device", &self.device)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

/// One-time model initialization shared by every front-end
pub struct ModelLoader {
    model_name: String,
    fallback_model_name: String,
    device_preference: DevicePreference,
    provider: Arc<dyn ModelProvider>,
    handle: OnceCell<ModelHandle>,
}

impl ModelLoader {
    /// Cheap; nothing is loaded until [`get`](ModelLoader::get)
    pub fn new(settings: &Settings, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            model_name: settings.model_name.clone(),
            fallback_model_name: settings.fallback_model_name.clone(),
            device_preference: settings.device,
            provider,
            handle: OnceCell::new(),
        }
    }

    /// Load the model on first call; later and concurrent calls share the result
    pub async fn get(&self) -> Result<ModelHandle, LoaderError> {
        let handle = self.handle.get_or_try_init(|| self.initialize()).await?;
        Ok(handle.clone())
    }

    /// The loaded model, without triggering a load
    pub fn get_model(&self) -> Result<ModelHandle, LoaderError> {
        self.handle.get().cloned().ok_or(LoaderError::NotInitialized)
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.initialized()
    }

    async fn initialize(&self) -> Result<ModelHandle, LoaderError> {
        let started = Instant::now();

        let preference = self.device_preference;
        let device = tokio::task::spawn_blocking(move || select_device(preference))
            .await
            .map_err(|e| LoaderError::Worker(e.to_string()))?;

        self.provider.prepare().await;

        let (model_name, model) = match self.provider.load(&self.model_name, &device).await {
            Ok(model) => (self.model_name.clone(), model),
            Err(primary) => {
                tracing::error!("Failed to load model {}: {}", self.model_name, primary);
                if self.fallback_model_name == self.model_name {
                    tracing::warn!("No distinct fallback model configured, retrying {}", self.model_name);
                } else {
                    tracing::warn!("Trying fallback model {}", self.fallback_model_name);
                }

                match self.provider.load(&self.fallback_model_name, &device).await {
                    Ok(model) => (self.fallback_model_name.clone(), model),
                    Err(fallback) => {
                        tracing::error!(
                            "Failed to load fallback model {}: {}",
                            self.fallback_model_name,
                            fallback
                        );
                        return Err(LoaderError::AllModelsFailed {
                            primary: primary.to_string(),
                            fallback: fallback.to_string(),
                        });
                    }
                }
            }
        };

        let declared = model.special_tokens()?;
        if declared.pad.is_none() {
            tracing::info!("Model declares no padding token, using eos ({})", declared.eos);
        }
        let tokens = declared.with_pad_fallback();

        tracing::info!(
            "Model {} ready on {} in {:.2}s",
            model_name,
            device,
            started.elapsed().as_secs_f64()
        );

        Ok(ModelHandle {
            model,
            tokens,
            device,
            model_name,
        })
    }
}
