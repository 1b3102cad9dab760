use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bundle_sync::engine::SyncControl;
use bundle_sync::util::{format_bytes, format_speed};
use bundle_sync::{
    ArchivePolicy, EngineConfig, GameRegistry, HttpTransport, SpaceArbiter, SyncEngine,
    SyncError, SyncProgress, SyncRequest, SyncResult, SystemSpaceProbe, env,
};
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(
    name = "bundle-sync",
    author,
    version,
    about = "Keeps local copies of web application bundles in step with their origin"
)]
struct Cli {
    /// Data directory; defaults to $BUNDLE_SYNC_HOME or the platform data dir.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the local copy of an application up to date.
    Sync {
        /// Content root holding manifest.json.
        url: String,
        /// Give up after three attempts instead of retrying patiently.
        #[arg(long)]
        fail_early: bool,
        /// Download every file individually.
        #[arg(long, conflicts_with = "always_archives")]
        disable_archives: bool,
        /// Fetch an archive whenever any of its members changed.
        #[arg(long)]
        always_archives: bool,
        /// Keep local code files even when the remote copy changed.
        #[arg(long)]
        omit_code: bool,
        /// Content directory; defaults to apps/<id> under the data directory.
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// List known applications, most recently run first.
    List,
    /// Delete an application's files and its record.
    Remove { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let home = cli.home.unwrap_or_else(env::default_app_dir);
    let result = match cli.command {
        Command::Sync {
            url,
            fail_early,
            disable_archives,
            always_archives,
            omit_code,
            dest,
        } => {
            let policy = if disable_archives {
                ArchivePolicy::Disabled
            } else if always_archives {
                ArchivePolicy::Always
            } else {
                ArchivePolicy::ForcedOnly
            };
            run_sync(&home, url, dest, policy, fail_early, omit_code).await
        }
        Command::List => list(&home).await,
        Command::Remove { id } => remove(&home, &id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(SyncError::Cancelled) => {
            warn!("sync cancelled");
            ExitCode::from(130)
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_sync(
    home: &Path,
    url: String,
    dest: Option<PathBuf>,
    policy: ArchivePolicy,
    fail_early: bool,
    omit_code: bool,
) -> SyncResult<()> {
    env::ensure_base_dirs(home).map_err(|e| SyncError::io("create data dir", e))?;
    let config = EngineConfig::load(&env::engine_config_path(home));
    let registry = Arc::new(GameRegistry::open(home).await?);
    let record = registry.touch(&url).await?;
    info!("app {} ({})", record.id, record.url);

    let local_path = content_dir(&registry, &record.id, dest);
    let space = SpaceArbiter::new(SystemSpaceProbe, local_path.clone())
        .with_lru_eviction(registry.clone(), config.legacy_lru_eviction);
    let transport = HttpTransport::new(config.http_timeout());
    let engine = SyncEngine::new(transport, space, config).with_registry(registry.clone());

    let mut request = SyncRequest::new(url, local_path);
    request.archive_policy = policy;
    request.fail_early = fail_early;
    request.omit_code_updates = omit_code;
    request.app_id = Some(record.id.clone());

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let handle = engine.start(request, Some(progress_tx))?;
    let control = handle.control();
    let bar = progress_bar();
    let started = Instant::now();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut paused = false;
    let mut wait = Box::pin(handle.wait());

    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            Some(update) = progress_rx.recv() => render(&bar, &update, started),
            _ = tokio::signal::ctrl_c() => {
                if paused {
                    control.cancel();
                } else {
                    paused = true;
                    pause(&control, &bar);
                }
            }
            Ok(Some(_)) = stdin.next_line(), if paused => {
                paused = false;
                bar.set_message("resuming");
                control.resume();
            }
        }
    };

    registry.close().await?;
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            bar.abandon_with_message("failed");
            return Err(err);
        }
    };
    bar.finish_with_message(format!(
        "{} files, {} in {:.1}s",
        report.files_downloaded,
        format_bytes(report.bytes_downloaded),
        started.elapsed().as_secs_f64()
    ));
    if !report.modified {
        info!("already up to date ({} files)", report.manifest.len());
    }
    Ok(())
}

/// Where the app's files live; free space is checked on this volume.
fn content_dir(registry: &GameRegistry, id: &str, dest: Option<PathBuf>) -> PathBuf {
    dest.unwrap_or_else(|| registry.app_dir(id))
}

fn pause(control: &SyncControl, bar: &ProgressBar) {
    control.pause();
    control.suspend();
    bar.set_message("paused: Enter resumes, ctrl-c cancels");
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/dim}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn render(bar: &ProgressBar, update: &SyncProgress, started: Instant) {
    let speed = update.bytes_done as f64 / started.elapsed().as_secs_f64().max(0.001);
    bar.set_length(update.bytes_total);
    bar.set_position(update.bytes_done);
    bar.set_message(format!(
        "{}/{} files {:.0}% {}",
        update.files_done,
        update.files_total,
        update.percent(),
        format_speed(speed)
    ));
}

async fn list(home: &Path) -> SyncResult<()> {
    let registry = GameRegistry::open(home).await?;
    let records = registry.records().await;
    if records.is_empty() {
        println!("no applications");
    }
    for record in records {
        let last_run = chrono::DateTime::from_timestamp_millis(record.last_run)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".into());
        println!("{}  {}  {}", record.id, last_run, record.url);
    }
    Ok(())
}

async fn remove(home: &Path, id: &str) -> SyncResult<()> {
    let registry = GameRegistry::open(home).await?;
    match registry.remove(id).await? {
        Some(record) => println!("removed {}", record.url),
        None => println!("no application with id {id}"),
    }
    registry.close().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn content_dir_prefers_the_destination_flag() {
        let home = tempfile::tempdir().unwrap();
        let registry = GameRegistry::open(home.path()).await.unwrap();
        let id = GameRegistry::app_id("https://cdn.example/app");

        assert_eq!(
            content_dir(&registry, &id, Some(PathBuf::from("/mnt/games/app"))),
            PathBuf::from("/mnt/games/app")
        );
        assert_eq!(
            content_dir(&registry, &id, None),
            env::apps_dir(home.path()).join(&id)
        );
    }
}
