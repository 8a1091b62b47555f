//! # coverid common library
//!
//! Shared code for the cover recognition service and its tooling:
//! - Error type shared by library crates
//! - Event types (`CoverEvent`) and the `EventBus`
//! - Configuration loading (TOML / environment / defaults)
//! - Server-Sent Events helpers

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
