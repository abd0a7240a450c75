//! Shared type definitions
//!
//! This module contains all shared data types used across the application.

pub mod config;
pub mod message;
pub mod model;

pub use config::GenerationConfig;
pub use message::{ConversationTurn, Role};
pub use model::{effective_context_size, Device, DevicePreference, SpecialTokens, MIN_CONTEXT_SIZE};
