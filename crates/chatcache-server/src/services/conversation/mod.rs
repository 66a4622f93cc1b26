//! Conversation context management
//!
//! Estimates the token cost of a session's history and, when it no longer
//! fits the budget, trims it to the newest messages plus a summary.

mod compressor;
mod summary;
pub mod types;

pub use compressor::ContextCompressor;
pub use types::{CompressionResult, ContextAnalysis};
