//! Middleware module
//!
//! Client-facing request middleware

pub mod auth;
