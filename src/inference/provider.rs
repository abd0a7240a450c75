//! Model providers
//!
//! A provider turns a model name into a loaded [`LanguageModel`]. The llama.cpp
//! provider resolves the name to a GGUF file (downloading it from the hub
//! when needed) and loads it into a shared [`LlamaEngine`].

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::inference::engine::{LanguageModel, LlamaEngine};
use crate::inference::loader::LoaderError;
use crate::storage::huggingface::{HubClient, RetryPolicy};
use crate::storage::Settings;
use crate::types::Device;

/// Source of loaded models
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// One-time setup before the first load (hub login and the like)
    async fn prepare(&self) {}

    /// Load `model_name` onto `device`
    async fn load(
        &self,
        model_name: &str,
        device: &Device,
    ) -> Result<Arc<dyn LanguageModel>, LoaderError>;
}

/// Provider backed by llama.cpp and the Hugging Face Hub
pub struct LlamaProvider {
    hub: HubClient,
    models_dir: PathBuf,
    gpu_layers: Option<u32>,
    context_size: u32,
    engine: OnceCell<Arc<LlamaEngine>>,
}

impl LlamaProvider {
    pub fn new(settings: &Settings) -> Result<Self, LoaderError> {
        let hub = HubClient::new(
            settings.hf_endpoint.clone(),
            settings.hf_token.clone(),
            RetryPolicy::default(),
        )?;

        Ok(Self {
            hub,
            models_dir: settings.models_dir.clone(),
            gpu_layers: settings.gpu_layers,
            context_size: settings.context_size,
            engine: OnceCell::new(),
        })
    }

    /// The engine, started on first use
    async fn engine(&self) -> Result<Arc<LlamaEngine>, LoaderError> {
        let context_size = self.context_size;
        let engine = self
            .engine
            .get_or_try_init(|| async move {
                let engine = tokio::task::spawn_blocking(move || LlamaEngine::start(context_size))
                    .await
                    .map_err(|e| LoaderError::Worker(e.to_string()))??;
                Ok::<_, LoaderError>(Arc::new(engine))
            })
            .await?;
        Ok(Arc::clone(engine))
    }
}

#[async_trait]
impl ModelProvider for LlamaProvider {
    async fn prepare(&self) {
        if !self.hub.has_token() {
            tracing::debug!("No HF_API_TOKEN set, skipping hub login");
            return;
        }
        match self.hub.login().await {
            Ok(Some(name)) => tracing::info!("Logged in to Hugging Face Hub as {}", name),
            Ok(None) => {}
            Err(e) => tracing::warn!("Hugging Face Hub login failed: {}", e),
        }
    }

    async fn load(
        &self,
        model_name: &str,
        device: &Device,
    ) -> Result<Arc<dyn LanguageModel>, LoaderError> {
        let path = self.hub.resolve(model_name, &self.models_dir).await?;
        let gpu_layers = self
            .gpu_layers
            .unwrap_or_else(|| device.default_gpu_layers());
        tracing::info!(
            "Loading {} on {} ({} gpu layers)",
            path.display(),
            device,
            gpu_layers
        );

        let engine = self.engine().await?;
        let loading = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || loading.load_model(&path, gpu_layers))
            .await
            .map_err(|e| LoaderError::Worker(e.to_string()))?
            .map_err(LoaderError::Engine)?;

        Ok(engine as Arc<dyn LanguageModel>)
    }
}

