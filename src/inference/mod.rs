//! LLM inference
//!
//! Model loading and response generation on top of llama-cpp.

pub mod engine;
pub mod generator;
pub mod loader;
pub mod model;
pub mod provider;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EngineError, GenerationRequest, LanguageModel, LlamaEngine, LoadedModelInfo};
pub use generator::{GenerateError, GenerationResult, ResponseGenerator};
pub use loader::{LoaderError, ModelHandle, ModelLoader};
pub use provider::{LlamaProvider, ModelProvider};
