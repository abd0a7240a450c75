//! Test doubles for the inference layer

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::inference::engine::{EngineError, GenerationRequest, LanguageModel};
use crate::inference::loader::LoaderError;
use crate::inference::provider::ModelProvider;
use crate::storage::huggingface::HubError;
use crate::types::{Device, SpecialTokens};

/// Model that answers with a canned reply after an optional delay
pub struct FakeModel {
    reply: String,
    delay: Duration,
    fail: bool,
    tokens: SpecialTokens,
    calls: AtomicUsize,
    cancellations: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl FakeModel {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            delay: Duration::ZERO,
            fail: false,
            tokens: SpecialTokens { eos: 2, pad: Some(0) },
            calls: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_tokens(mut self, tokens: SpecialTokens) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Generations that ended because the stop flag was set
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().unwrap().clone()
    }
}

impl LanguageModel for FakeModel {
    fn special_tokens(&self) -> Result<SpecialTokens, EngineError> {
        Ok(self.tokens)
    }

    fn generate(&self, request: GenerationRequest) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(request.prompt.clone());

        // Poll the stop flag the way the engine does between tokens
        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if request.stop_signal.load(Ordering::SeqCst) {
                self.cancellations.fetch_add(1, Ordering::SeqCst);
                return Err(EngineError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        if self.fail {
            return Err(EngineError::Inference("fake failure".to_string()));
        }
        Ok(self.reply.clone())
    }
}

/// Provider serving fake models by name
#[derive(Default)]
pub struct FakeProvider {
    models: HashMap<String, Arc<FakeModel>>,
    loads: AtomicUsize,
    prepares: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, name: &str, model: FakeModel) -> Self {
        self.models.insert(name.to_string(), Arc::new(model));
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for FakeProvider {
    async fn prepare(&self) {
        self.prepares.fetch_add(1, Ordering::SeqCst);
    }

    async fn load(
        &self,
        model_name: &str,
        _device: &Device,
    ) -> Result<Arc<dyn LanguageModel>, LoaderError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to race the initialization
        tokio::time::sleep(Duration::from_millis(20)).await;
        match self.models.get(model_name) {
            Some(model) => Ok(Arc::clone(model) as Arc<dyn LanguageModel>),
            None => Err(HubError::InvalidModelName(model_name.to_string()).into()),
        }
    }
}
