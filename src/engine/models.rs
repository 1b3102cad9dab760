use std::path::PathBuf;
use std::time::Duration;

use crate::config::APP_CONFIG_FILE;
use crate::manifest::Manifest;
use crate::planner::{ArchivePolicy, PlannedItem};
use crate::retry::RetrySchedule;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Everything one sync needs to know about the application it updates.
#[derive(Clone, Debug)]
pub struct SyncRequest {
    /// Content root; the manifest, configuration and files live beneath it.
    pub remote_url: String,
    pub local_path: PathBuf,
    pub manifest_name: String,
    /// Remote configuration document, or `None` to skip fetching it.
    pub config_name: Option<String>,
    pub archive_policy: ArchivePolicy,
    pub fail_early: bool,
    /// Forces code files to keep their local copy even if the remote config does not ask for it.
    pub omit_code_updates: bool,
    /// Registry id to shield from eviction while this sync runs.
    pub app_id: Option<String>,
}

impl SyncRequest {
    pub fn new(remote_url: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_url: remote_url.into(),
            local_path: local_path.into(),
            manifest_name: MANIFEST_FILE.into(),
            config_name: Some(APP_CONFIG_FILE.into()),
            archive_policy: ArchivePolicy::default(),
            fail_early: false,
            omit_code_updates: false,
            app_id: None,
        }
    }
}

/// Outcome of a successful sync.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncReport {
    pub manifest: Manifest,
    pub had_local_cache: bool,
    /// Whether anything changed on disk.
    pub modified: bool,
    pub files_downloaded: usize,
    pub files_removed: usize,
    pub bytes_downloaded: u64,
}

/// One unit of download work and the retry state travelling with it.
#[derive(Clone, Debug)]
pub(crate) struct PendingItem {
    pub key: u64,
    pub item: PlannedItem,
    pub schedule: RetrySchedule,
    pub retry_count: u32,
    /// Wait before the next start, set when an extraction failed.
    pub backoff: Option<Duration>,
}
