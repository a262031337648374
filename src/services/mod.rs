//! Service layer module
//!
//! Model routing, protocol translation, stream conversion and upstream I/O

pub mod client;
pub mod router;
pub mod streaming;
pub mod translator;

pub use client::UpstreamClient;
pub use router::{ModelRouter, ResolvedModel, Tier};
pub use streaming::{ClaudeEventAssembler, StreamState};
pub use translator::Translator;
