//! Utilities module
//!
//! Error taxonomy and token estimation helpers

pub mod error;
pub mod token_count;
