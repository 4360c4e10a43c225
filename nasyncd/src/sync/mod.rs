pub mod backoff;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod glob;
pub mod local;
pub mod local_watcher;
pub mod model;
pub mod observe;
pub mod orchestrator;
pub mod paths;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod store;
mod store_queue;
pub mod transfer;
pub mod upload_queue;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorClass, SyncError};
pub use orchestrator::{EngineConfig, PassOutcome, PassReport, SyncOrchestrator, SyncPhase};
pub use registry::SyncFolderRegistry;
