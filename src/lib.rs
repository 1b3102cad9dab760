//! Incremental synchronisation of web application bundles into a local cache.
//!
//! A sync compares the local manifest with the remote one, deletes what is gone,
//! downloads what changed (loose files or whole archives) and persists the merged
//! manifest once every download is confirmed.

pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod manifest;
pub mod networking;
pub mod planner;
pub mod registry;
pub mod retry;
pub mod space;
pub mod storage;
pub mod util;

pub use config::{AppConfig, EngineConfig};
pub use engine::{SyncControl, SyncEngine, SyncHandle, SyncProgress, SyncReport, SyncRequest, SyncState};
pub use error::{SyncError, SyncResult};
pub use manifest::{ArchiveDescriptor, ChangeSet, DiffFilter, FileEntry, Manifest};
pub use networking::{HttpTransport, Transport};
pub use planner::ArchivePolicy;
pub use registry::{GameRecord, GameRegistry};
pub use space::{SpaceArbiter, SpaceProbe, SystemSpaceProbe};
