//! ficsync: keep a Calibre library of web fiction up to date and serve it over OPDS.
//!
//! The crate wraps two external tools. `calibredb` lists and edits the
//! library, and the FanFicFare plugin run through `calibre-debug` fetches
//! new chapters for each story.
//!
//! # Features
//!
//! - Periodic update cycles over the whole library or in fixed-size batches
//! - Metadata write-back after each successful update
//! - OPDS 1.2 acquisition feed with EPUB downloads, covers and thumbnails
//! - Clean shutdown on Ctrl-C with no work left half-done

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Calibre library access.
pub mod calibre;
/// Configuration and CLI.
pub mod config;
/// Error types.
pub mod error;
/// Book model.
pub mod library;
/// OPDS feed generation.
pub mod opds;
/// External command execution.
pub mod process;
/// Update cycle scheduling.
pub mod scheduler;
/// HTTP server.
pub mod server;
/// Story updates through FanFicFare.
pub mod updater;

#[cfg(test)]
mod tests;

pub use calibre::Calibre;
pub use config::{Cli, Command, Config};
pub use error::{AppError, Result};
pub use scheduler::BatchScheduler;
pub use server::AppState;
pub use updater::UpdateProcessor;
