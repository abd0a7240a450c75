//! Application wiring
//!
//! Builds the configuration store, the model loader and the response
//! generator once, and shares them with the front-ends.

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::chat::ChatHandler;
use crate::inference::{LlamaProvider, LoaderError, ModelLoader, ModelProvider, ResponseGenerator};
use crate::storage::{ConfigError, ConfigManager, ConfigWatcher, Settings};
use crate::system::Summary;
use crate::types::Device;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Model initialization failed: {0}")]
    Loader(#[from] LoaderError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Everything a front-end needs, initialized once
pub struct App {
    pub config: Arc<ConfigManager>,
    pub settings: Settings,
    /// Model actually loaded (primary or fallback)
    pub model_name: String,
    /// Device the model was loaded on
    pub device: Device,
    pub loader: Arc<ModelLoader>,
    pub generator: ResponseGenerator,
    pub metrics: Arc<Summary>,
}

impl App {
    /// Load configuration and the model from the default locations
    pub async fn bootstrap() -> Result<Self, AppError> {
        let config = Arc::new(ConfigManager::from_default_location());
        let settings = Settings::from_config(&config);
        let provider = Arc::new(LlamaProvider::new(&settings)?);
        Self::with_provider(config, settings, provider).await
    }

    /// Same as [`bootstrap`](App::bootstrap) with an explicit model provider
    pub async fn with_provider(
        config: Arc<ConfigManager>,
        settings: Settings,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<Self, AppError> {
        let started = Instant::now();
        tracing::info!(
            "Initializing with model {} (fallback {})",
            settings.model_name,
            settings.fallback_model_name
        );

        let loader = Arc::new(ModelLoader::new(&settings, provider));
        let handle = loader.get().await?;

        let metrics = Arc::new(Summary::response_time());
        let generator = ResponseGenerator::new(&handle, &config, Arc::clone(&metrics))
            .with_timeout(settings.generation_timeout);

        tracing::info!(
            "Initialization finished in {:.2}s",
            started.elapsed().as_secs_f64()
        );

        Ok(Self {
            config,
            settings,
            model_name: handle.model_name.clone(),
            device: handle.device.clone(),
            loader,
            generator,
            metrics,
        })
    }

    pub fn chat_handler(&self) -> ChatHandler {
        ChatHandler::new(self.generator.clone())
    }

    /// Start reloading the configuration file on change
    pub fn watch_config(&self) -> Result<ConfigWatcher, AppError> {
        Ok(self.config.watch()?)
    }
}
