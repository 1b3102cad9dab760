use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use log::{debug, info, warn};
use sysinfo::Disks;
use tokio::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::registry::GameRegistry;

/// Host query for free bytes on the volume holding `path`.
pub trait SpaceProbe: Send + Sync + 'static {
    fn available_bytes(&self, path: &Path) -> impl Future<Output = SyncResult<u64>> + Send;
}

/// Reads free space from the operating system's disk list.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSpaceProbe;

impl SpaceProbe for SystemSpaceProbe {
    fn available_bytes(&self, path: &Path) -> impl Future<Output = SyncResult<u64>> + Send {
        let path = path.to_path_buf();
        async move {
            tokio::task::spawn_blocking(move || disk_free_for(&path))
                .await
                .map_err(|e| SyncError::Io(format!("disk query task failed: {e}")))?
        }
    }
}

fn disk_free_for(path: &Path) -> SyncResult<u64> {
    let target = path
        .ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let target = target.canonicalize().unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .ok_or_else(|| SyncError::Io(format!("no volume found for {}", target.display())))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceCheck {
    pub ok: bool,
    pub available: u64,
}

type PendingQuery = Shared<BoxFuture<'static, SyncResult<u64>>>;

/// Gates downloads on free space; concurrent callers share one host query.
pub struct SpaceArbiter<P: SpaceProbe> {
    probe: Arc<P>,
    path: PathBuf,
    in_flight: Mutex<Option<PendingQuery>>,
    registry: Option<Arc<GameRegistry>>,
    legacy_eviction: bool,
}

impl<P: SpaceProbe> SpaceArbiter<P> {
    pub fn new(probe: P, path: impl Into<PathBuf>) -> Self {
        Self {
            probe: Arc::new(probe),
            path: path.into(),
            in_flight: Mutex::new(None),
            registry: None,
            legacy_eviction: false,
        }
    }

    /// Enable the legacy path that evicts least recently run apps until space suffices.
    pub fn with_lru_eviction(mut self, registry: Arc<GameRegistry>, enabled: bool) -> Self {
        self.registry = Some(registry);
        self.legacy_eviction = enabled;
        self
    }

    /// Free bytes, joining any query already in flight.
    pub async fn query_free(&self) -> SyncResult<u64> {
        let query = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(existing) => {
                    debug!("space: joining in-flight query");
                    existing.clone()
                }
                None => {
                    let probe = self.probe.clone();
                    let path = self.path.clone();
                    let query = async move { probe.available_bytes(&path).await }
                        .boxed()
                        .shared();
                    *slot = Some(query.clone());
                    query
                }
            }
        };

        let result = query.clone().await;
        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().is_some_and(|q| q.ptr_eq(&query)) {
            *slot = None;
        }
        result
    }

    /// Check that `bytes_needed` fit, evicting old apps first when enabled.
    pub async fn ensure_free(&self, bytes_needed: u64) -> SyncResult<SpaceCheck> {
        let mut available = self.query_free().await?;
        debug!("space: need {bytes_needed} bytes, {available} available");
        if available >= bytes_needed {
            return Ok(SpaceCheck {
                ok: true,
                available,
            });
        }

        let registry = match (&self.registry, self.legacy_eviction) {
            (Some(registry), true) => registry,
            _ => {
                warn!("space: insufficient space ({available} < {bytes_needed})");
                return Ok(SpaceCheck {
                    ok: false,
                    available,
                });
            }
        };

        while let Some(evicted) = registry.evict_least_recent().await? {
            available = self.query_free().await?;
            info!(
                "space: after evicting {} there are {available} bytes free",
                evicted.id
            );
            if available >= bytes_needed {
                return Ok(SpaceCheck {
                    ok: true,
                    available,
                });
            }
        }

        warn!("space: nothing left to evict ({available} < {bytes_needed})");
        Ok(SpaceCheck {
            ok: false,
            available,
        })
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::test_support::FixedProbe;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_query() {
        let probe = FixedProbe {
            latency: Duration::from_millis(50),
            ..FixedProbe::new(1_000)
        };
        let queries = probe.queries.clone();
        let arbiter = SpaceArbiter::new(probe, "/data");

        let (a, b, c) = tokio::join!(
            arbiter.ensure_free(10),
            arbiter.ensure_free(5_000),
            arbiter.query_free()
        );
        assert_eq!(
            a.unwrap(),
            SpaceCheck {
                ok: true,
                available: 1_000
            }
        );
        assert!(!b.unwrap().ok);
        assert_eq!(c.unwrap(), 1_000);
        assert_eq!(queries.load(Ordering::SeqCst), 1);

        arbiter.query_free().await.unwrap();
        assert_eq!(queries.load(Ordering::SeqCst), 2);
    }

    /// Replays a scripted sequence of free-space readings.
    struct ScriptedProbe(std::sync::Mutex<Vec<u64>>);

    impl SpaceProbe for ScriptedProbe {
        fn available_bytes(&self, _path: &Path) -> impl Future<Output = SyncResult<u64>> + Send {
            let next = {
                let mut readings = self.0.lock().unwrap();
                if readings.len() > 1 {
                    readings.remove(0)
                } else {
                    readings[0]
                }
            };
            std::future::ready(Ok(next))
        }
    }

    #[tokio::test]
    async fn eviction_runs_until_space_suffices() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(GameRegistry::open(dir.path()).await.unwrap());
        let oldest = registry.touch_at("https://one.example", 1).await.unwrap();
        let second = registry.touch_at("https://two.example", 2).await.unwrap();
        let third = registry.touch_at("https://three.example", 3).await.unwrap();
        let current = registry.touch_at("https://four.example", 0).await.unwrap();
        registry.begin_update(&current.id).await;

        let big = registry.app_dir(&oldest.id);
        std::fs::create_dir_all(&big).unwrap();
        std::fs::write(big.join("data.bin"), vec![0u8; 64]).unwrap();

        let probe = ScriptedProbe(std::sync::Mutex::new(vec![100, 120, 200]));
        let arbiter =
            SpaceArbiter::new(probe, dir.path()).with_lru_eviction(registry.clone(), true);

        let check = arbiter.ensure_free(150).await.unwrap();
        assert_eq!(
            check,
            SpaceCheck {
                ok: true,
                available: 200
            }
        );
        assert!(!big.exists());
        assert!(registry.get(&oldest.id).await.is_none());
        assert!(registry.get(&second.id).await.is_none());
        assert!(registry.get(&third.id).await.is_some());
        assert!(registry.get(&current.id).await.is_some());
    }

    #[tokio::test]
    async fn without_eviction_reports_shortfall() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(GameRegistry::open(dir.path()).await.unwrap());
        registry.touch_at("https://one.example", 1).await.unwrap();

        let arbiter =
            SpaceArbiter::new(FixedProbe::new(10), dir.path()).with_lru_eviction(registry.clone(), false);
        let check = arbiter.ensure_free(11).await.unwrap();
        assert_eq!(
            check,
            SpaceCheck {
                ok: false,
                available: 10
            }
        );
        assert_eq!(registry.records().await.len(), 1);
    }

    #[tokio::test]
    async fn eviction_gives_up_when_only_updating_apps_remain() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(GameRegistry::open(dir.path()).await.unwrap());
        let busy = registry.touch_at("https://busy.example", 1).await.unwrap();
        registry.begin_update(&busy.id).await;

        let arbiter =
            SpaceArbiter::new(FixedProbe::new(0), dir.path()).with_lru_eviction(registry.clone(), true);
        assert!(!arbiter.ensure_free(1).await.unwrap().ok);
        assert!(registry.get(&busy.id).await.is_some());
    }
}
