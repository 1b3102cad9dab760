use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ENGINE_CONFIG_FILE;

pub const HOME_VAR: &str = "BUNDLE_SYNC_HOME";

/// Root directory for registry, engine config and app content.
pub fn default_app_dir() -> PathBuf {
    if let Some(dir) = env::var_os(HOME_VAR) {
        return PathBuf::from(dir);
    }
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("XDG_DATA_HOME").map(PathBuf::from).or_else(|| {
            env::var_os("HOME")
                .map(PathBuf::from)
                .map(|home| home.join(".local").join("share"))
        }),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("bundle-sync")
}

pub fn engine_config_path(root: &Path) -> PathBuf {
    root.join(ENGINE_CONFIG_FILE)
}

pub fn apps_dir(root: &Path) -> PathBuf {
    root.join("apps")
}

/// Create the on-disk folder layout.
pub fn ensure_base_dirs(root: &Path) -> std::io::Result<()> {
    for dir in [root.to_path_buf(), apps_dir(root)] {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}
