//! Shared types for the Lumina job client.
//!
//! Wire types for backend jobs, client configuration, and the crate-level
//! error type used by every other workspace crate.

pub mod config;
pub mod error;
pub mod types;
