//! Chat front-end
//!
//! Input sanitizing, the message handler shared by the chat adapters and the
//! interactive question loop.

pub mod handler;
pub mod input;
pub mod session;

pub use handler::{ChatHandler, ChatReply};
pub use input::{format_history, sanitize_input, MAX_INPUT_CHARS};
pub use session::{run_session, spawn_stdin_reader, SessionEnd};
