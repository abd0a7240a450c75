//! localqa library
//!
//! Question answering over a locally hosted GGUF model.

pub mod app;
pub mod chat;
pub mod inference;
pub mod storage;
pub mod system;
pub mod types;
