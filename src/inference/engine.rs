//! Inference engine implementation
//!
//! Core logic for managing the llama-cpp backend and running generation.
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) wrap raw
//! pointers, so they are owned by a dedicated worker thread. Callers talk to
//! it over channels and block until the worker answers. The worker handles
//! one command at a time, which serializes generation on the shared model.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use thiserror::Error;

use crate::inference::model::{validate_gguf, ModelError};
use crate::types::{effective_context_size, GenerationConfig, SpecialTokens};

/// Max tokens per decode call; longer prompts are prefilled in chunks
const PREFILL_BATCH_SIZE: usize = 512;

/// Window of recent tokens the repetition penalty looks at
const REPEAT_LAST_N: i32 = 64;

/// Candidate cut-off applied before nucleus sampling
const DEFAULT_TOP_K: i32 = 50;

/// GGUF metadata key holding the padding token id
const PAD_TOKEN_KEY: &str = "tokenizer.ggml.padding_token_id";

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Prompt of {prompt_tokens} tokens does not fit a {context} token context")]
    PromptTooLong { prompt_tokens: usize, context: u32 },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// One generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Full prompt text
    pub prompt: String,
    /// Sampling parameters
    pub config: GenerationConfig,
    /// Stop and skip token ids
    pub tokens: SpecialTokens,
    /// Set to abort generation between tokens
    pub stop_signal: Arc<AtomicBool>,
}

/// A loaded model that turns a prompt into its continuation
///
/// `generate` blocks for the whole generation and returns only the newly
/// generated text, prompt excluded and special tokens skipped.
pub trait LanguageModel: Send + Sync {
    /// Special token ids as declared by the model's vocabulary
    fn special_tokens(&self) -> Result<SpecialTokens, EngineError>;

    fn generate(&self, request: GenerationRequest) -> Result<String, EngineError>;
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
    /// Special tokens read from the vocabulary
    pub special_tokens: SpecialTokens,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadModel {
        path: PathBuf,
        gpu_layers: u32,
        response_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    },
    Generate {
        request: GenerationRequest,
        response_tx: Sender<Result<String, EngineError>>,
    },
    Shutdown,
}

/// The LLM inference engine using llama-cpp-2
pub struct LlamaEngine {
    /// Channel to send commands to the worker thread
    command_tx: Sender<WorkerCommand>,
    /// Handle to the worker thread
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    /// Cached model info (updated after load)
    model_info: Mutex<Option<LoadedModelInfo>>,
}

impl LlamaEngine {
    /// Spawns the worker thread and initializes the llama.cpp backend on it
    pub fn start(context_size: u32) -> Result<Self, EngineError> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_thread_main(command_rx, ready_tx, context_size))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        tracing::info!("LlamaEngine worker thread started (context {})", context_size);
        Ok(Self {
            command_tx,
            worker_handle: Mutex::new(Some(handle)),
            model_info: Mutex::new(None),
        })
    }

    /// Loads a GGUF model, replacing any model loaded before
    ///
    /// `gpu_layers` is the number of layers to offload (0 = CPU only).
    pub fn load_model(&self, path: &Path, gpu_layers: u32) -> Result<LoadedModelInfo, EngineError> {
        let metadata = validate_gguf(path)?;
        tracing::debug!(
            "GGUF v{} header ok for {} ({} tensors)",
            metadata.version,
            path.display(),
            metadata.tensor_count
        );

        let (response_tx, response_rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::LoadModel {
                path: path.to_path_buf(),
                gpu_layers,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let result = response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()));

        let mut cached = self.model_info.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(Ok(info)) => {
                *cached = Some(info.clone());
                Ok(info)
            }
            Ok(Err(e)) | Err(e) => {
                // The worker drops the previous model before loading
                *cached = None;
                Err(e)
            }
        }
    }

    /// Returns information about the currently loaded model
    pub fn model_info(&self) -> Option<LoadedModelInfo> {
        self.model_info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl LanguageModel for LlamaEngine {
    fn special_tokens(&self) -> Result<SpecialTokens, EngineError> {
        self.model_info()
            .map(|info| info.special_tokens)
            .ok_or(EngineError::NoModelLoaded)
    }

    fn generate(&self, request: GenerationRequest) -> Result<String, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::Generate {
                request,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        let handle = self
            .worker_handle
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and LlamaModel, processes commands in order.
fn worker_thread_main(
    command_rx: Receiver<WorkerCommand>,
    ready_tx: Sender<Result<(), EngineError>>,
    context_size: u32,
) {
    let backend = match LlamaBackend::init() {
        Ok(backend) => {
            let _ = ready_tx.send(Ok(()));
            backend
        }
        Err(e) => {
            tracing::error!("Failed to init backend: {}", e);
            let _ = ready_tx.send(Err(EngineError::BackendInit(e.to_string())));
            return;
        }
    };
    let mut model: Option<LlamaModel> = None;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::LoadModel {
                path,
                gpu_layers,
                response_tx,
            }) => {
                // Free the previous weights first so two models never coexist
                model = None;
                match load_model_internal(&backend, &path, gpu_layers) {
                    Ok((loaded, info)) => {
                        model = Some(loaded);
                        let _ = response_tx.send(Ok(info));
                    }
                    Err(e) => {
                        let _ = response_tx.send(Err(e));
                    }
                }
            }
            Ok(WorkerCommand::Generate {
                request,
                response_tx,
            }) => {
                let result = match &model {
                    Some(m) => run_generation(&backend, m, &request, context_size),
                    None => Err(EngineError::NoModelLoaded),
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Load a model and extract its info (worker thread)
fn load_model_internal(
    backend: &LlamaBackend,
    path: &Path,
    gpu_layers: u32,
) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let pad = model
        .meta_val_str(PAD_TOKEN_KEY)
        .ok()
        .and_then(|raw| raw.trim().parse::<i32>().ok());

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
        special_tokens: SpecialTokens {
            eos: model.token_eos().0,
            pad,
        },
    };

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx, {} gpu layers)",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_length,
        gpu_layers
    );

    Ok((model, info))
}

/// Run one generation (worker thread)
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    request: &GenerationRequest,
    context_size: u32,
) -> Result<String, EngineError> {
    let prompt_tokens = model
        .str_to_token(&request.prompt, AddBos::Always)
        .map_err(|e| EngineError::Tokenization(e.to_string()))?;
    if prompt_tokens.is_empty() {
        return Err(EngineError::Tokenization("prompt produced no tokens".to_string()));
    }

    let n_ctx = effective_context_size(context_size, model.n_ctx_train());
    if prompt_tokens.len() as u32 >= n_ctx {
        return Err(EngineError::PromptTooLong {
            prompt_tokens: prompt_tokens.len(),
            context: n_ctx,
        });
    }
    tracing::debug!("Tokenized prompt into {} tokens", prompt_tokens.len());

    let n_threads = thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4);
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(PREFILL_BATCH_SIZE as u32)
        .with_n_threads(n_threads)
        .with_n_threads_batch(n_threads);
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

    // Prefill in chunks so long prompts never exceed the batch size
    let mut batch = LlamaBatch::new(PREFILL_BATCH_SIZE, 1);
    let last_index = prompt_tokens.len() - 1;
    for (chunk_index, chunk) in prompt_tokens.chunks(PREFILL_BATCH_SIZE).enumerate() {
        batch.clear();
        for (offset, &token) in chunk.iter().enumerate() {
            let pos = chunk_index * PREFILL_BATCH_SIZE + offset;
            batch
                .add(token, pos as i32, &[0], pos == last_index)
                .map_err(|e| EngineError::Inference(e.to_string()))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
    }

    let mut sampler = build_sampler(&request.config);
    for &token in &prompt_tokens {
        sampler.accept(token);
    }

    let eos = LlamaToken::new(request.tokens.eos);
    let budget = request
        .config
        .max_new_tokens
        .min(n_ctx - prompt_tokens.len() as u32);
    let mut generated: Vec<LlamaToken> = Vec::new();
    let mut n_cur = prompt_tokens.len() as i32;

    for _ in 0..budget {
        if request.stop_signal.load(Ordering::Relaxed) {
            tracing::debug!("Generation stopped after {} tokens", generated.len());
            return Err(EngineError::Cancelled);
        }

        let token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if token == eos || model.is_eog_token(token) {
            break;
        }
        generated.push(token);

        batch.clear();
        batch
            .add(token, n_cur, &[0], true)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        n_cur += 1;

        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
    }

    tracing::debug!("Generated {} tokens", generated.len());

    let ids: Vec<i32> = generated.iter().map(|t| t.0).collect();
    decode_pieces(&ids, &request.tokens, |id| {
        model
            .token_to_bytes(LlamaToken::new(id), Special::Plaintext)
            .map_err(|e| EngineError::Inference(format!("Failed to detokenize: {}", e)))
    })
}

fn build_sampler(config: &GenerationConfig) -> LlamaSampler {
    let seed = config.seed.unwrap_or_else(rand_seed);
    LlamaSampler::chain_simple([
        LlamaSampler::penalties(REPEAT_LAST_N, config.repetition_penalty, 0.0, 0.0),
        LlamaSampler::top_k(DEFAULT_TOP_K),
        LlamaSampler::top_p(config.top_p, 1),
        LlamaSampler::temp(config.temperature),
        LlamaSampler::dist(seed),
    ])
}

/// Concatenate token bytes, skipping special tokens, and decode as UTF-8
///
/// Bytes are joined before decoding because a multi-byte character can be
/// split across tokens.
fn decode_pieces<F>(
    token_ids: &[i32],
    special: &SpecialTokens,
    mut to_bytes: F,
) -> Result<String, EngineError>
where
    F: FnMut(i32) -> Result<Vec<u8>, EngineError>,
{
    let mut bytes = Vec::new();
    for &id in token_ids {
        if special.is_special(id) {
            continue;
        }
        bytes.extend_from_slice(&to_bytes(id)?);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
