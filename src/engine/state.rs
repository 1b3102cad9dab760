/// Lifecycle of a single sync, published through the handle's watch channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    FetchingRemoteManifest,
    Diffing,
    PlanningArchives,
    CheckingSpace,
    Downloading,
    Paused,
    Finalizing,
    Done,
    Error,
}

impl SyncState {
    pub fn label(self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::FetchingRemoteManifest => "fetching manifest",
            SyncState::Diffing => "comparing manifests",
            SyncState::PlanningArchives => "planning archives",
            SyncState::CheckingSpace => "checking free space",
            SyncState::Downloading => "downloading",
            SyncState::Paused => "paused",
            SyncState::Finalizing => "finalizing",
            SyncState::Done => "done",
            SyncState::Error => "error",
        }
    }
}

/// Requests sent from a handle to the running sync task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncCommand {
    Pause,
    Resume,
    Cancel,
    /// The host is going to background; flush the working manifest.
    Suspend,
}

/// Progress snapshot emitted after every completed item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub files_done: usize,
    pub files_total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub current: Option<String>,
}

impl SyncProgress {
    pub fn percent(&self) -> f32 {
        crate::util::progress_percent(self.bytes_done, Some(self.bytes_total))
    }
}
