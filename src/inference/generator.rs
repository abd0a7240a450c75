//! Response generation
//!
//! Wraps the loaded model with the configured sampling parameters. The
//! blocking [`ResponseGenerator::generate`] runs inline; the async variants
//! move it onto tokio's blocking pool and record the `response_time` metric.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::inference::engine::{EngineError, GenerationRequest, LanguageModel};
use crate::inference::loader::ModelHandle;
use crate::storage::ConfigManager;
use crate::system::Summary;
use crate::types::{GenerationConfig, Role, SpecialTokens};

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Generation failed: {0}")]
    Engine(#[from] EngineError),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generation task failed: {0}")]
    Worker(String),
}

/// A generated answer
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Trimmed model output, prompt excluded
    pub response: String,
    /// Wall-clock generation time
    pub elapsed: Duration,
}

impl GenerationResult {
    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// Question answering over a loaded model
#[derive(Clone)]
pub struct ResponseGenerator {
    model: Arc<dyn LanguageModel>,
    config: GenerationConfig,
    tokens: SpecialTokens,
    metrics: Arc<Summary>,
    timeout: Option<Duration>,
}

impl ResponseGenerator {
    pub fn new(handle: &ModelHandle, config: &ConfigManager, metrics: Arc<Summary>) -> Self {
        Self::with_config(handle, GenerationConfig::from_config(config), metrics)
    }

    pub fn with_config(handle: &ModelHandle, config: GenerationConfig, metrics: Arc<Summary>) -> Self {
        Self {
            model: Arc::clone(&handle.model),
            config,
            tokens: handle.tokens,
            metrics,
            timeout: None,
        }
    }

    /// Bound every async generation; `None` disables the limit
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build_prompt(question: &str) -> String {
        format!("{}: {}\n{}:", Role::User.label(), question, Role::Assistant.label())
    }

    /// Generate an answer, blocking the calling thread
    pub fn generate(&self, question: &str) -> Result<GenerationResult, GenerateError> {
        self.generate_with_stop(question, Arc::new(AtomicBool::new(false)))
    }

    /// Generate on the blocking pool without stalling the async scheduler
    pub async fn async_generate(&self, question: &str) -> Result<GenerationResult, GenerateError> {
        self.async_generate_with_stop(question, Arc::new(AtomicBool::new(false)))
            .await
    }

    /// Like [`async_generate`](Self::async_generate), stoppable by setting `stop`
    pub async fn async_generate_with_stop(
        &self,
        question: &str,
        stop: Arc<AtomicBool>,
    ) -> Result<GenerationResult, GenerateError> {
        self.metrics
            .time(self.dispatch(question.to_string(), stop))
            .await
    }

    async fn dispatch(
        &self,
        question: String,
        stop: Arc<AtomicBool>,
    ) -> Result<GenerationResult, GenerateError> {
        let generator = self.clone();
        let task_stop = Arc::clone(&stop);
        let task =
            tokio::task::spawn_blocking(move || generator.generate_with_stop(&question, task_stop));

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // The blocking task notices the flag on its next token
                    stop.store(true, Ordering::SeqCst);
                    tracing::warn!("Generation exceeded {:?}, stopping", limit);
                    return Err(GenerateError::Timeout(limit));
                }
            },
            None => task.await,
        };

        joined.map_err(|e| GenerateError::Worker(e.to_string()))?
    }

    fn generate_with_stop(
        &self,
        question: &str,
        stop: Arc<AtomicBool>,
    ) -> Result<GenerationResult, GenerateError> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        tracing::debug!(
            "[{}] Generating answer for {} chars of input",
            request_id,
            question.chars().count()
        );

        let output = self.model.generate(GenerationRequest {
            prompt: Self::build_prompt(question),
            config: self.config,
            tokens: self.tokens,
            stop_signal: stop,
        })?;

        let result = GenerationResult {
            response: output.trim().to_string(),
            elapsed: started.elapsed(),
        };
        tracing::debug!(
            "[{}] Generated {} chars in {:.2}s",
            request_id,
            result.response.chars().count(),
            result.elapsed_seconds()
        );
        Ok(result)
    }
}
