//! Engine services: session orchestration, progress streaming, presets and
//! background maintenance

pub mod broadcaster;
pub mod maintenance;
pub mod orchestrator;
pub mod presets;

pub use broadcaster::{ProgressBroadcaster, ProgressMessage, SnapshotSource};
pub use orchestrator::{SessionOrchestrator, SessionResults, SubmitOptions};
pub use presets::PresetStore;
