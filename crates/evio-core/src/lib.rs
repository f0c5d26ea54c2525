//! # evio-core
//!
//! Core types shared by the evio event loop and its I/O wrappers.
//!
//! This crate has no event loop and performs no I/O of its own. The
//! runtime lives in `evio-runtime`; descriptors live in `evio`.
//!
//! ## Modules
//!
//! - `error` - Error and end-of-input types
//! - `buffer` - Fixed-capacity input buffer with start/end cursors
//! - `parser` - Parser protocol and built-in parsers
//! - `kprint` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

pub mod error;
pub mod buffer;
pub mod parser;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use error::{EndReason, Error, Result};
pub use buffer::{InputBuffer, INPUT_BUFFER_SIZE};
pub use parser::{All, Available, Line, Parse, Parser, Target};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt};
pub use nix::errno::Errno;
