//! Temp-area lifecycle: the periodic sweeper, the per-download deferred
//! cleanup task, and the job manifest that lets sweep obligations survive a
//! process restart.
//!
//! All deletion here is best-effort and idempotent. The sweeper, a deferred
//! timer, and an inline failure-path delete may race on the same directory;
//! a second delete only observes NotFound, which is absorbed.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{
    JOB_DIR_PREFIX, LOOSE_TEMP_PREFIX, MANIFEST_FILE_NAME, STALE_JOB_SECS,
};

/// Tracks every live download directory with its creation time, persisted as
/// JSON in the temp root. After a restart the sweeper reloads it, so a job
/// whose deferred timer died with the process is still reclaimed.
#[derive(Clone)]
pub struct ManifestStore {
    path: PathBuf,
    jobs: Arc<Mutex<HashMap<PathBuf, DateTime<Utc>>>>,
}

impl ManifestStore {
    /// Load the manifest from `temp_root`, starting empty if the file is
    /// missing or unreadable.
    pub async fn load(temp_root: &Path) -> Self {
        let path = temp_root.join(MANIFEST_FILE_NAME);
        let jobs = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(jobs) => jobs,
                Err(error) => {
                    warn!("discarding unreadable job manifest: {error}");
                    HashMap::new()
                }
            },
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("could not open job manifest: {error}");
                }
                HashMap::new()
            }
        };

        Self {
            path,
            jobs: Arc::new(Mutex::new(jobs)),
        }
    }

    /// Record a freshly allocated job directory.
    pub async fn register(&self, job_dir: &Path) {
        let snapshot = {
            let mut jobs = self.jobs.lock().await;
            jobs.insert(job_dir.to_path_buf(), Utc::now());
            jobs.clone()
        };
        self.persist(&snapshot).await;
    }

    /// Drop a job directory from the manifest once it has been deleted.
    pub async fn forget(&self, job_dir: &Path) {
        let snapshot = {
            let mut jobs = self.jobs.lock().await;
            if jobs.remove(job_dir).is_none() {
                return;
            }
            jobs.clone()
        };
        self.persist(&snapshot).await;
    }

    /// Job directories registered before `cutoff`.
    pub async fn stale_entries(&self, cutoff: DateTime<Utc>) -> Vec<PathBuf> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|(_, created_at)| **created_at < cutoff)
            .map(|(path, _)| path.clone())
            .collect()
    }

    async fn persist(&self, jobs: &HashMap<PathBuf, DateTime<Utc>>) {
        let payload = match serde_json::to_string_pretty(jobs) {
            Ok(payload) => payload,
            Err(error) => {
                warn!("could not serialize job manifest: {error}");
                return;
            }
        };

        if let Err(error) = tokio::fs::write(&self.path, payload).await {
            warn!("could not persist job manifest: {error}");
        }
    }
}

/// Recursively delete a job directory and drop its manifest entry. Deleting
/// an already-removed directory is a no-op.
pub async fn remove_job_dir(manifest: &ManifestStore, job_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!(
            "could not remove job directory {}: {error}",
            job_dir.display()
        );
    }
    manifest.forget(job_dir).await;
}

/// One-shot deferred reclaim of a served download's directory. Detached from
/// the request lifecycle; the process may exit before it fires, in which
/// case the manifest-backed sweeper picks the directory up instead.
pub fn schedule_deferred_cleanup(
    manifest: ManifestStore,
    job_dir: PathBuf,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        remove_job_dir(&manifest, &job_dir).await;
        info!("reclaimed job directory {}", job_dir.display());
    });
}

/// Long-lived sweep loop, running for the process lifetime. The first sweep
/// happens immediately, then every `interval`.
pub fn spawn_sweeper(manifest: ManifestStore, temp_root: PathBuf, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            sweep_once(&manifest, &temp_root, Duration::from_secs(STALE_JOB_SECS)).await;
        }
    });
}

/// One sweep cycle: delete prefix-matched directories and loose temp files
/// older than `max_age`, then reap manifest entries past the same age even
/// when the directory's mtime could not be probed.
pub async fn sweep_once(manifest: &ManifestStore, temp_root: &Path, max_age: Duration) {
    sweep_temp_entries(temp_root, max_age).await;
    sweep_manifest_backlog(manifest, max_age).await;
}

async fn sweep_temp_entries(temp_root: &Path, max_age: Duration) {
    let mut entries = match tokio::fs::read_dir(temp_root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open temp root for sweeping: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("could not iterate temp root: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name == MANIFEST_FILE_NAME {
            continue;
        }

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                debug!("could not stat {}: {error}", path.display());
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or(Duration::ZERO);
        if age < max_age {
            continue;
        }

        if metadata.is_dir() && name.starts_with(JOB_DIR_PREFIX) {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => info!("swept stale download directory {}", path.display()),
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => {
                    warn!("could not sweep directory {}: {error}", path.display());
                }
            }
        } else if metadata.is_file()
            && name.starts_with(LOOSE_TEMP_PREFIX)
            && let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("could not sweep file {}: {error}", path.display());
        }
    }
}

async fn sweep_manifest_backlog(manifest: &ManifestStore, max_age: Duration) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());

    for job_dir in manifest.stale_entries(cutoff).await {
        remove_job_dir(manifest, &job_dir).await;
        info!("reaped manifest entry {}", job_dir.display());
    }
}
