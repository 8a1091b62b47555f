//! HTTP API handlers for coverid-matcher
//!
//! JSON over HTTP plus SSE for progress; image bytes travel as base64.

pub mod cache;
pub mod health;
pub mod presets;
pub mod sessions;
pub mod sse;

pub use cache::cache_routes;
pub use health::health_routes;
pub use presets::preset_routes;
pub use sessions::session_routes;
pub use sse::event_routes;
