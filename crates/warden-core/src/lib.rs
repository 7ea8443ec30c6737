//! # warden-core
//!
//! Core types, errors, and utilities shared by every warden crate.
//!
//! This crate provides:
//! - [`WardenError`] - Error type for all warden operations
//! - [`logging`] - Tracing setup and log management utilities
//! - [`types`] - Worker status, output stream and exit information
//!
//! ## Example
//!
//! ```no_run
//! use warden_core::{WardenError, logging};
//!
//! fn main() -> warden_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!
//!     let script = std::path::Path::new("/srv/bot/bot.py");
//!     if !script.exists() {
//!         return Err(WardenError::script_not_found(script));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export main types for convenience
pub use error::{Result, WardenError};
pub use logging::{LogGuard, init_logging};
pub use types::{ExitInfo, LogStream, WorkerStatus};
