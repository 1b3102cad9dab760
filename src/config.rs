use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

pub const ENGINE_CONFIG_FILE: &str = "engine.json";
pub const APP_CONFIG_FILE: &str = "configuration.json";

/// Tunables for the sync engine. Every field has a default so partial files load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub concurrency_limit: usize,
    pub retry_initial_delay_ms: u64,
    /// Sent as `X-Distribution` on configuration fetches.
    pub distribution: Option<String>,
    pub legacy_lru_eviction: bool,
    pub entry_document: String,
    pub verify_hashes: bool,
    pub http_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 6,
            retry_initial_delay_ms: 500,
            distribution: None,
            legacy_lru_eviction: false,
            entry_document: "index.html".into(),
            verify_hashes: true,
            http_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, falling back to defaults when the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!("config: no engine config at {} ({err})", path.display());
                return Self::default();
            }
        };
        serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!(
                "config: {} parse error ({err}); using defaults",
                path.display()
            );
            Self::default()
        })
    }

    pub fn retry_policy(&self, fail_early: bool) -> RetryPolicy {
        RetryPolicy::for_mode(
            fail_early,
            Duration::from_millis(self.retry_initial_delay_ms),
        )
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Per-application `configuration.json`, persisted after every successful sync.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub content_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit_js_update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_overrides: Option<Vec<Value>>,
    /// Unknown keys are carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppConfig {
    pub fn for_content_url(content_url: impl Into<String>) -> Self {
        Self {
            content_url: content_url.into(),
            ..Default::default()
        }
    }

    pub fn parse(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::parse("configuration", e))
    }

    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SyncError::parse("configuration", e))
    }

    pub fn omit_code_updates(&self) -> bool {
        self.omit_js_update.unwrap_or(false)
    }
}
