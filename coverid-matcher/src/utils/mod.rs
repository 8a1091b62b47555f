//! Utility modules for coverid-matcher

pub mod base64_bytes;
pub mod db_retry;

pub use db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
