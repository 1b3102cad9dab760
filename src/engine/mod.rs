use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{APP_CONFIG_FILE, AppConfig, EngineConfig};
use crate::engine::models::PendingItem;
use crate::error::{SyncError, SyncResult};
use crate::manifest::{ArchiveDescriptor, DiffFilter, FileEntry, Manifest};
use crate::networking::{DISTRIBUTION_HEADER, HttpRequest, Transport, join_url};
use crate::planner::{DownloadPlan, PlannedArchive, PlannedItem, plan_downloads};
use crate::registry::GameRegistry;
use crate::retry::{RetryDecision, RetryPolicy, RetrySchedule, with_retries};
use crate::space::{SpaceArbiter, SpaceProbe};
use crate::storage::{StorageManager, content_hash, is_verifiable_hash};

pub mod models;
pub mod state;

pub use models::{MANIFEST_FILE, SyncReport, SyncRequest};
pub use state::{SyncCommand, SyncProgress, SyncState};

/// Shared collaborators for every sync started from this engine.
pub struct SyncEngine<T: Transport, P: SpaceProbe> {
    transport: Arc<T>,
    space: Arc<SpaceArbiter<P>>,
    registry: Option<Arc<GameRegistry>>,
    config: EngineConfig,
}

impl<T: Transport, P: SpaceProbe> SyncEngine<T, P> {
    pub fn new(transport: T, space: SpaceArbiter<P>, config: EngineConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            space: Arc::new(space),
            registry: None,
            config,
        }
    }

    /// Apps named by `SyncRequest::app_id` are marked as updating in this registry.
    pub fn with_registry(mut self, registry: Arc<GameRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate `request` and run it on its own task of the current tokio runtime.
    pub fn start(
        &self,
        request: SyncRequest,
        progress: Option<UnboundedSender<SyncProgress>>,
    ) -> SyncResult<SyncHandle> {
        if request.remote_url.trim().is_empty() {
            return Err(SyncError::InvalidArgument("remote url is empty".into()));
        }
        if request.local_path.as_os_str().is_empty() {
            return Err(SyncError::InvalidArgument("local path is empty".into()));
        }
        if request.manifest_name.trim().is_empty() {
            return Err(SyncError::InvalidArgument("manifest name is empty".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::InvalidArgument("no tokio runtime to run the sync on".into()))?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);
        let storage = StorageManager::new(request.local_path.clone());
        let policy = self.config.retry_policy(request.fail_early);
        info!(
            "sync: starting {} into {}",
            request.remote_url,
            request.local_path.display()
        );

        let session = Session {
            ctx: TransferContext {
                transport: self.transport.clone(),
                storage: storage.clone(),
                content_url: request.remote_url.clone(),
                verify_hashes: self.config.verify_hashes,
            },
            space: self.space.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            app_config: AppConfig::for_content_url(request.remote_url.clone()),
            request,
            storage,
            policy,
            state: state_tx,
            progress,
            working: Manifest::new(),
            remote: Manifest::new(),
            had_local_cache: false,
            modified: false,
            pending: VecDeque::new(),
            active: HashMap::new(),
            extracting: HashMap::new(),
            generation: 0,
            stats: SyncProgress::default(),
            files_downloaded: 0,
            files_removed: 0,
        };
        let task = runtime.spawn(session.run(command_rx));

        Ok(SyncHandle {
            control: SyncControl { commands },
            state: state_rx,
            task,
        })
    }
}

/// Cloneable sender for lifecycle commands. Commands sent after the sync ends are ignored.
#[derive(Clone, Debug)]
pub struct SyncControl {
    commands: UnboundedSender<SyncCommand>,
}

impl SyncControl {
    pub fn pause(&self) {
        self.send(SyncCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(SyncCommand::Resume);
    }

    pub fn cancel(&self) {
        self.send(SyncCommand::Cancel);
    }

    /// Persist the working manifest now, e.g. before the host process is suspended.
    pub fn suspend(&self) {
        self.send(SyncCommand::Suspend);
    }

    fn send(&self, command: SyncCommand) {
        if self.commands.send(command).is_err() {
            debug!("sync: {command:?} ignored, sync already finished");
        }
    }
}

pub struct SyncHandle {
    control: SyncControl,
    state: watch::Receiver<SyncState>,
    task: JoinHandle<SyncResult<SyncReport>>,
}

impl SyncHandle {
    pub fn control(&self) -> SyncControl {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn suspend(&self) {
        self.control.suspend();
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Wait for the sync to finish. Cancellation surfaces as `SyncError::Cancelled`.
    pub async fn wait(self) -> SyncResult<SyncReport> {
        self.task
            .await
            .map_err(|e| SyncError::Io(format!("sync task failed: {e}")))?
    }
}

/// What a transfer needs, detached from the session so it can run as a `'static` future.
struct TransferContext<T> {
    transport: Arc<T>,
    storage: StorageManager,
    content_url: String,
    verify_hashes: bool,
}

impl<T> Clone for TransferContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            storage: self.storage.clone(),
            content_url: self.content_url.clone(),
            verify_hashes: self.verify_hashes,
        }
    }
}

impl<T: Transport> TransferContext<T> {
    async fn fetch(self, item: PlannedItem) -> SyncResult<()> {
        match item {
            PlannedItem::File(entry) => self.fetch_file(&entry).await,
            PlannedItem::Archive(archive) => self.fetch_archive(&archive.descriptor).await,
        }
    }

    /// Download into the temp sibling, verify, then move into place.
    async fn fetch_file(&self, entry: &FileEntry) -> SyncResult<()> {
        let tmp = self.storage.temp_path(&entry.path)?;
        let url = join_url(&self.content_url, &entry.path);
        let written = self.transport.download(HttpRequest::get(&url), &tmp).await?;
        debug!("download: {} ({written} bytes)", entry.path);

        if self.verify_hashes && is_verifiable_hash(&entry.hash) {
            let actual = hash_file(tmp.clone()).await?;
            if !actual.eq_ignore_ascii_case(&entry.hash) {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(SyncError::ContentMismatch {
                    path: entry.path.clone(),
                    expected: entry.hash.clone(),
                    actual,
                });
            }
        }
        self.storage.commit_temp(&entry.path).await
    }

    async fn fetch_archive(&self, descriptor: &ArchiveDescriptor) -> SyncResult<()> {
        let relative = descriptor.remote_path();
        let tmp = self.storage.temp_path(&relative)?;
        let url = join_url(&self.content_url, &relative);
        let written = self.transport.download(HttpRequest::get(&url), &tmp).await?;
        debug!("download: archive {} ({written} bytes)", descriptor.id);
        self.storage.commit_temp(&relative).await
    }
}

async fn hash_file(path: PathBuf) -> SyncResult<String> {
    tokio::task::spawn_blocking(move || content_hash(&path))
        .await
        .map_err(|e| SyncError::Io(format!("checksum task failed: {e}")))?
}

/// Extract an archive into the content root and check every member it should hold.
async fn extract_and_verify(
    storage: StorageManager,
    archive: PathBuf,
    members: Vec<FileEntry>,
    verify: bool,
) -> SyncResult<()> {
    let extracted = storage.decompress(archive).await?;
    for member in &members {
        if !extracted.contains(&member.path) {
            return Err(SyncError::Decompression(format!(
                "archive is missing {}",
                member.path
            )));
        }
        if verify && is_verifiable_hash(&member.hash) {
            let actual = hash_file(storage.path_for(&member.path)?).await?;
            if !actual.eq_ignore_ascii_case(&member.hash) {
                return Err(SyncError::ContentMismatch {
                    path: member.path.clone(),
                    expected: member.hash.clone(),
                    actual,
                });
            }
        }
    }
    Ok(())
}

struct TransferDone {
    key: u64,
    schedule: RetrySchedule,
    result: SyncResult<()>,
}

struct Extracted {
    key: u64,
    generation: u64,
    result: SyncResult<()>,
}

#[derive(Default)]
struct InFlight {
    transfers: FuturesUnordered<BoxFuture<'static, TransferDone>>,
    extractions: FuturesUnordered<BoxFuture<'static, Extracted>>,
}

impl InFlight {
    fn is_idle(&self) -> bool {
        self.transfers.is_empty() && self.extractions.is_empty()
    }
}

/// State owned by the task running one sync.
struct Session<T: Transport, P: SpaceProbe> {
    ctx: TransferContext<T>,
    space: Arc<SpaceArbiter<P>>,
    registry: Option<Arc<GameRegistry>>,
    config: EngineConfig,
    app_config: AppConfig,
    request: SyncRequest,
    storage: StorageManager,
    policy: RetryPolicy,
    state: watch::Sender<SyncState>,
    progress: Option<UnboundedSender<SyncProgress>>,
    /// Local manifest with every confirmed change folded in.
    working: Manifest,
    remote: Manifest,
    had_local_cache: bool,
    modified: bool,
    pending: VecDeque<PendingItem>,
    active: HashMap<u64, PendingItem>,
    extracting: HashMap<u64, PendingItem>,
    /// Bumped on pause; extractions from an older generation are discarded.
    generation: u64,
    stats: SyncProgress,
    files_downloaded: usize,
    files_removed: usize,
}

impl<T: Transport, P: SpaceProbe> Session<T, P> {
    async fn run(mut self, mut commands: UnboundedReceiver<SyncCommand>) -> SyncResult<SyncReport> {
        let app_id = self.request.app_id.clone();
        if let (Some(registry), Some(id)) = (&self.registry, &app_id) {
            registry.begin_update(id).await;
        }

        let result = self.sync(&mut commands).await;

        if let (Some(registry), Some(id)) = (&self.registry, &app_id) {
            registry.end_update(id).await;
        }
        match &result {
            Ok(report) => {
                info!(
                    "sync: {} done ({} downloaded, {} removed)",
                    self.request.remote_url, report.files_downloaded, report.files_removed
                );
                self.set_state(SyncState::Done);
            }
            Err(SyncError::Cancelled) => {
                info!("sync: {} cancelled", self.request.remote_url);
                self.set_state(SyncState::Idle);
            }
            Err(err) => {
                error!("sync: {} failed: {err}", self.request.remote_url);
                self.set_state(SyncState::Error);
            }
        }
        result
    }

    async fn sync(
        &mut self,
        commands: &mut UnboundedReceiver<SyncCommand>,
    ) -> SyncResult<SyncReport> {
        let mut deferred = DeferredCommands::default();
        let plan = tokio::select! {
            plan = self.prepare() => plan?,
            () = wait_for_cancel(commands, &mut deferred) => {
                return Err(SyncError::Cancelled);
            }
        };
        if deferred.suspend {
            self.flush_manifest().await?;
        }
        self.download(plan, commands, deferred.pause).await?;
        self.finalize().await
    }

    /// Fetch, diff, apply removals, plan and check space.
    async fn prepare(&mut self) -> SyncResult<DownloadPlan> {
        self.set_state(SyncState::FetchingRemoteManifest);
        self.app_config = self.fetch_app_config().await?;
        let remote_text = self.fetch_remote_manifest().await?;
        let remote = Manifest::parse(&remote_text)?;

        let local_text = self
            .storage
            .read_text(&self.request.manifest_name)
            .await
            .unwrap_or_else(|err| {
                warn!("sync: local manifest unreadable ({err}); starting from empty");
                None
            });
        let local = Manifest::parse_or_empty(local_text.as_deref());
        self.had_local_cache = !local.is_empty();

        self.set_state(SyncState::Diffing);
        let filter = DiffFilter {
            omit_code_updates: self.request.omit_code_updates
                || self.app_config.omit_code_updates(),
            entry_document: self.config.entry_document.clone(),
        };
        let changes = local.diff(&remote, &filter);
        info!(
            "sync: {} to download ({} bytes), {} to remove, {} unchanged",
            changes.added.len(),
            changes.total_bytes,
            changes.removed.len(),
            changes.unchanged
        );

        self.working = local;
        for path in &changes.removed {
            self.storage.delete_file(path).await?;
            self.working.remove(path);
        }
        for entry in &changes.metadata_only {
            self.working.insert(entry.clone());
        }
        self.files_removed = changes.removed.len();
        self.modified = changes.is_modified() || !self.working.archives().eq(remote.archives());

        self.set_state(SyncState::PlanningArchives);
        let plan = plan_downloads(&changes.added, remote.archives(), self.request.archive_policy);
        self.remote = remote;

        self.set_state(SyncState::CheckingSpace);
        if plan.space_needed > 0 {
            let check = self.space.ensure_free(plan.space_needed).await?;
            if !check.ok {
                return Err(SyncError::StorageFull {
                    needed: plan.space_needed,
                    available: check.available,
                });
            }
        }
        Ok(plan)
    }

    /// Remote configuration; a missing or unreadable document falls back to defaults.
    async fn fetch_app_config(&self) -> SyncResult<AppConfig> {
        let fallback = AppConfig::for_content_url(self.request.remote_url.clone());
        let Some(name) = self.request.config_name.as_deref() else {
            return Ok(fallback);
        };
        let url = join_url(&self.request.remote_url, name);
        let distribution = self.config.distribution.as_deref();
        let mut schedule = RetrySchedule::new(self.policy);

        let fetched = with_retries(&mut schedule, name, || {
            let mut request = HttpRequest::get(&url);
            if let Some(distribution) = distribution {
                request = request.with_header(DISTRIBUTION_HEADER, distribution);
            }
            let transport = self.ctx.transport.clone();
            let url = url.clone();
            async move { transport.get(request).await?.into_body(&url) }
        })
        .await;

        match fetched {
            Ok(body) => match AppConfig::parse(&String::from_utf8_lossy(&body)) {
                Ok(mut config) => {
                    if config.content_url.is_empty() {
                        config.content_url = self.request.remote_url.clone();
                    }
                    Ok(config)
                }
                Err(err) => {
                    warn!("sync: ignoring remote {name}: {err}");
                    Ok(fallback)
                }
            },
            Err(SyncError::NotFound(_)) => {
                debug!("sync: no remote {name}, using defaults");
                Ok(fallback)
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_remote_manifest(&self) -> SyncResult<String> {
        let url = join_url(&self.request.remote_url, &self.request.manifest_name);
        let mut schedule = RetrySchedule::new(self.policy);
        let body = with_retries(&mut schedule, &self.request.manifest_name, || {
            let transport = self.ctx.transport.clone();
            let url = url.clone();
            async move {
                transport
                    .get(HttpRequest::get(&url))
                    .await?
                    .into_body(&url)
            }
        })
        .await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn download(
        &mut self,
        plan: DownloadPlan,
        commands: &mut UnboundedReceiver<SyncCommand>,
        mut paused: bool,
    ) -> SyncResult<()> {
        self.stats = SyncProgress {
            files_total: plan
                .items
                .iter()
                .map(|item| match item {
                    PlannedItem::File(_) => 1,
                    PlannedItem::Archive(archive) => archive.pending.len(),
                })
                .sum(),
            bytes_total: plan.total_bytes,
            ..Default::default()
        };
        self.pending = plan
            .items
            .into_iter()
            .enumerate()
            .map(|(key, item)| PendingItem {
                key: key as u64,
                item,
                schedule: RetrySchedule::new(self.policy),
                retry_count: 0,
                backoff: None,
            })
            .collect();
        if self.pending.is_empty() {
            return Ok(());
        }

        self.set_state(if paused {
            SyncState::Paused
        } else {
            SyncState::Downloading
        });
        let mut flight = InFlight::default();
        let mut commands_open = true;

        loop {
            if !paused {
                self.fill_slots(&mut flight);
            }
            if self.pending.is_empty() && self.extracting.is_empty() && flight.is_idle() {
                break;
            }

            tokio::select! {
                Some(done) = flight.transfers.next(), if !flight.transfers.is_empty() => {
                    self.on_transfer_done(&mut flight, done)?;
                }
                Some(done) = flight.extractions.next(), if !flight.extractions.is_empty() => {
                    self.on_extracted(done).await?;
                }
                command = commands.recv(), if commands_open => match command {
                    Some(SyncCommand::Pause) if !paused => {
                        paused = true;
                        self.pause(&mut flight);
                    }
                    Some(SyncCommand::Resume) if paused => {
                        paused = false;
                        info!("sync: resuming with {} items pending", self.pending.len());
                        self.set_state(SyncState::Downloading);
                    }
                    Some(SyncCommand::Cancel) => return Err(SyncError::Cancelled),
                    Some(SyncCommand::Suspend) => self.flush_manifest().await?,
                    Some(other) => debug!("sync: ignoring {other:?} while {}", self.current_state().label()),
                    None => commands_open = false,
                },
                else => {
                    warn!("sync: paused with no handle left to resume it");
                    return Err(SyncError::Cancelled);
                }
            }
        }
        Ok(())
    }

    fn fill_slots(&mut self, flight: &mut InFlight) {
        // One extra slot while an extraction holds the CPU instead of the network.
        let limit = self.config.concurrency_limit.max(1) + usize::from(!self.extracting.is_empty());
        while self.active.len() < limit {
            let Some(item) = self.pending.pop_front() else {
                break;
            };
            flight.transfers.push(self.start_transfer(&item));
            self.active.insert(item.key, item);
        }
    }

    fn start_transfer(&self, pending: &PendingItem) -> BoxFuture<'static, TransferDone> {
        let ctx = self.ctx.clone();
        let key = pending.key;
        let item = pending.item.clone();
        let mut schedule = pending.schedule.clone();
        let backoff = pending.backoff;
        let label = item.label();
        debug!("sync: starting {label} (retries so far: {})", pending.retry_count);

        async move {
            if let Some(delay) = backoff {
                tokio::time::sleep(delay).await;
            }
            let result = with_retries(&mut schedule, &label, || ctx.clone().fetch(item.clone())).await;
            TransferDone {
                key,
                schedule,
                result,
            }
        }
        .boxed()
    }

    fn on_transfer_done(&mut self, flight: &mut InFlight, done: TransferDone) -> SyncResult<()> {
        let Some(mut pending) = self.active.remove(&done.key) else {
            debug!("sync: dropping completion for unknown item {}", done.key);
            return Ok(());
        };
        pending.retry_count = done.schedule.attempts();
        pending.schedule = done.schedule;
        pending.backoff = None;
        if let Err(err) = done.result {
            error!("sync: {} failed: {err}", pending.item.label());
            return Err(err);
        }

        match pending.item.clone() {
            PlannedItem::File(entry) => {
                self.files_downloaded += 1;
                self.record_progress(1, pending.item.content_bytes(), &entry.path);
                self.working.insert(entry);
                Ok(())
            }
            PlannedItem::Archive(archive) => self.start_extraction(flight, pending, archive),
        }
    }

    fn start_extraction(
        &mut self,
        flight: &mut InFlight,
        pending: PendingItem,
        archive: PlannedArchive,
    ) -> SyncResult<()> {
        let archive_path = self.storage.path_for(&archive.descriptor.remote_path())?;
        let members: Vec<FileEntry> = archive
            .descriptor
            .files
            .iter()
            .filter_map(|path| self.remote.get(path))
            .cloned()
            .collect();
        let storage = self.storage.clone();
        let verify = self.config.verify_hashes;
        let key = pending.key;
        let generation = self.generation;
        debug!(
            "sync: extracting archive {} ({} members)",
            archive.descriptor.id,
            members.len()
        );

        flight.extractions.push(
            async move {
                let result = extract_and_verify(storage, archive_path, members, verify).await;
                Extracted {
                    key,
                    generation,
                    result,
                }
            }
            .boxed(),
        );
        self.extracting.insert(key, pending);
        Ok(())
    }

    async fn on_extracted(&mut self, done: Extracted) -> SyncResult<()> {
        if done.generation != self.generation {
            debug!("sync: discarding extraction of item {} from before a pause", done.key);
            return Ok(());
        }
        let Some(mut pending) = self.extracting.remove(&done.key) else {
            return Ok(());
        };
        let PlannedItem::Archive(archive) = pending.item.clone() else {
            return Ok(());
        };

        match done.result {
            Ok(()) => {
                self.storage.delete_file(&archive.descriptor.remote_path()).await?;
                for path in &archive.descriptor.files {
                    if let Some(entry) = self.remote.get(path) {
                        self.working.insert(entry.clone());
                    }
                }
                self.files_downloaded += archive.pending.len();
                self.record_progress(
                    archive.pending.len(),
                    pending.item.content_bytes(),
                    &archive.descriptor.remote_path(),
                );
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                pending.schedule.arm();
                match pending.schedule.record_failure() {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            "sync: archive {} unusable ({err}); downloading again in {delay:?}",
                            archive.descriptor.id
                        );
                        pending.retry_count = pending.schedule.attempts();
                        pending.backoff = Some(delay);
                        self.pending.push_front(pending);
                        Ok(())
                    }
                    RetryDecision::GiveUp | RetryDecision::Ignored => {
                        error!("sync: archive {} failed: {err}", archive.descriptor.id);
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Drop in-flight transfers and requeue their items, in plan order, ahead of the rest.
    fn pause(&mut self, flight: &mut InFlight) {
        flight.transfers = FuturesUnordered::new();
        self.generation += 1;

        let mut interrupted: Vec<PendingItem> = self
            .active
            .drain()
            .chain(self.extracting.drain())
            .map(|(_, item)| item)
            .collect();
        interrupted.sort_by_key(|item| std::cmp::Reverse(item.key));
        for mut item in interrupted {
            item.schedule = RetrySchedule::new(self.policy);
            item.backoff = None;
            self.pending.push_front(item);
        }

        info!("sync: paused with {} items waiting", self.pending.len());
        self.set_state(SyncState::Paused);
    }

    async fn flush_manifest(&self) -> SyncResult<()> {
        let text = self.working.to_json()?;
        self.storage
            .write_atomic(&self.request.manifest_name, text.as_bytes())
            .await?;
        info!("sync: flushed working manifest ({} files)", self.working.len());
        Ok(())
    }

    async fn finalize(&mut self) -> SyncResult<SyncReport> {
        self.set_state(SyncState::Finalizing);
        self.working.set_archives(self.remote.archives().cloned());
        if self.modified {
            self.flush_manifest().await?;
        } else {
            debug!("sync: manifest unchanged");
        }

        let config_text = self.app_config.to_json()?;
        self.storage
            .write_atomic(APP_CONFIG_FILE, config_text.as_bytes())
            .await?;

        Ok(SyncReport {
            manifest: self.working.clone(),
            had_local_cache: self.had_local_cache,
            modified: self.modified,
            files_downloaded: self.files_downloaded,
            files_removed: self.files_removed,
            bytes_downloaded: self.stats.bytes_done,
        })
    }

    fn record_progress(&mut self, files: usize, bytes: u64, current: &str) {
        self.stats.files_done += files;
        self.stats.bytes_done += bytes;
        self.stats.current = Some(current.to_owned());
        if let Some(progress) = &self.progress {
            progress.send(self.stats.clone()).ok();
        }
    }

    fn current_state(&self) -> SyncState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("sync: {} -> {}", previous.label(), state.label());
        }
    }
}

/// Commands received before the download phase, applied once it starts.
#[derive(Default)]
struct DeferredCommands {
    pause: bool,
    suspend: bool,
}

/// Resolves on `Cancel`; other commands are recorded in `deferred`.
async fn wait_for_cancel(
    commands: &mut UnboundedReceiver<SyncCommand>,
    deferred: &mut DeferredCommands,
) {
    while let Some(command) = commands.recv().await {
        match command {
            SyncCommand::Cancel => return,
            SyncCommand::Pause => deferred.pause = true,
            SyncCommand::Resume => deferred.pause = false,
            SyncCommand::Suspend => deferred.suspend = true,
        }
    }
    std::future::pending::<()>().await;
}
