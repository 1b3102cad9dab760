use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::storage::StorageManager;

const REGISTRY_FILE: &str = "registry.json";
const APPS_DIR: &str = "apps";

/// One application known to this device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    /// Content hash of the origin URL.
    #[serde(rename = "name")]
    pub id: String,
    pub url: String,
    /// Unix millis of the last launch.
    #[serde(rename = "lastRun")]
    pub last_run: i64,
}

#[derive(Debug, Default)]
struct RegistryState {
    records: BTreeMap<String, GameRecord>,
    updating: HashSet<String>,
    closed: bool,
}

/// Persisted set of known applications, ordered by last run for LRU eviction.
#[derive(Debug)]
pub struct GameRegistry {
    base: StorageManager,
    state: Mutex<RegistryState>,
}

impl GameRegistry {
    /// Load the registry under `base_dir`. An unreadable registry starts empty.
    pub async fn open(base_dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let base = StorageManager::new(base_dir);
        let records = match base.read_text(REGISTRY_FILE).await? {
            Some(text) => match serde_json::from_str::<Vec<GameRecord>>(&text) {
                Ok(list) => list.into_iter().map(|r| (r.id.clone(), r)).collect(),
                Err(err) => {
                    warn!("registry: discarding unreadable {REGISTRY_FILE}: {err}");
                    BTreeMap::new()
                }
            },
            None => BTreeMap::new(),
        };
        debug!("registry: loaded {} records", records.len());
        Ok(Self {
            base,
            state: Mutex::new(RegistryState {
                records,
                ..Default::default()
            }),
        })
    }

    /// Flush and refuse further mutations.
    pub async fn close(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        self.persist(&state).await?;
        state.closed = true;
        info!("registry: closed");
        Ok(())
    }

    pub fn app_id(url: &str) -> String {
        format!("{:x}", Sha256::digest(url.as_bytes()))
    }

    /// Local content directory of an application.
    pub fn app_dir(&self, id: &str) -> PathBuf {
        self.base.root().join(APPS_DIR).join(id)
    }

    /// Record a launch of `url` now, creating the record on first use.
    pub async fn touch(&self, url: &str) -> SyncResult<GameRecord> {
        self.touch_at(url, Utc::now().timestamp_millis()).await
    }

    pub async fn touch_at(&self, url: &str, last_run: i64) -> SyncResult<GameRecord> {
        if url.is_empty() {
            return Err(SyncError::InvalidArgument("empty app url".into()));
        }
        let mut state = self.open_state().await?;
        let id = Self::app_id(url);
        let record = state
            .records
            .entry(id.clone())
            .and_modify(|r| r.last_run = last_run)
            .or_insert_with(|| GameRecord {
                id,
                url: url.to_owned(),
                last_run,
            })
            .clone();
        self.persist(&state).await?;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<GameRecord> {
        self.state.lock().await.records.get(id).cloned()
    }

    /// All records, most recently run first.
    pub async fn records(&self) -> Vec<GameRecord> {
        let state = self.state.lock().await;
        let mut list: Vec<_> = state.records.values().cloned().collect();
        list.sort_by(|a, b| b.last_run.cmp(&a.last_run).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Delete an application's files and its record.
    pub async fn remove(&self, id: &str) -> SyncResult<Option<GameRecord>> {
        let mut state = self.open_state().await?;
        if state.updating.contains(id) {
            return Err(SyncError::Registry(format!("{id} is being updated")));
        }
        let removed = state.records.remove(id);
        if removed.is_some() {
            StorageManager::new(self.app_dir(id)).remove_all().await?;
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    /// Protect an application from eviction while a sync writes into it.
    pub async fn begin_update(&self, id: &str) {
        self.state.lock().await.updating.insert(id.to_owned());
    }

    pub async fn end_update(&self, id: &str) {
        self.state.lock().await.updating.remove(id);
    }

    pub async fn is_updating(&self, id: &str) -> bool {
        self.state.lock().await.updating.contains(id)
    }

    /// Evict the least recently run application that is not being updated.
    pub async fn evict_least_recent(&self) -> SyncResult<Option<GameRecord>> {
        let mut state = self.open_state().await?;
        let victim = state
            .records
            .values()
            .filter(|r| !state.updating.contains(&r.id))
            .min_by(|a, b| a.last_run.cmp(&b.last_run).then_with(|| a.id.cmp(&b.id)))
            .cloned();
        let Some(victim) = victim else {
            debug!("registry: nothing left to evict");
            return Ok(None);
        };
        let freed = StorageManager::new(self.app_dir(&victim.id))
            .remove_all()
            .await?;
        state.records.remove(&victim.id);
        self.persist(&state).await?;
        info!(
            "registry: evicted {} ({}), freed {} bytes",
            victim.id, victim.url, freed
        );
        Ok(Some(victim))
    }

    async fn open_state(&self) -> SyncResult<tokio::sync::MutexGuard<'_, RegistryState>> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(SyncError::Registry("registry is closed".into()));
        }
        Ok(state)
    }

    async fn persist(&self, state: &RegistryState) -> SyncResult<()> {
        let list: Vec<&GameRecord> = state.records.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)
            .map_err(|e| SyncError::Registry(format!("serialize registry: {e}")))?;
        self.base.write_atomic(REGISTRY_FILE, &bytes).await
    }
}
