use std::{path::PathBuf, time::Duration};

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 100;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Directories older than this are reclaimed by the sweeper.
pub const STALE_JOB_SECS: u64 = 3600;
/// Delay before a served download's directory is reclaimed.
pub const DEFERRED_CLEANUP_SECS: u64 = 60;
pub const YT_DLP_TIMEOUT_SECONDS: u64 = 180;

pub const JOB_DIR_PREFIX: &str = "yt_download_";
pub const LOOSE_TEMP_PREFIX: &str = "tmp";
pub const MANIFEST_FILE_NAME: &str = "yt_download_manifest.json";

pub const FORMAT_LIST_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub max_file_bytes: u64,
    pub cleanup_interval: Duration,
    pub temp_root: PathBuf,
}

impl Config {
    /// Resolve the runtime configuration from environment variables.
    /// Missing or unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        let cleanup_secs = read_u64_env("CLEANUP_INTERVAL")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS);

        Self {
            bind_addr: resolve_bind_addr(),
            max_file_bytes: max_file_bytes_from_mb(read_u64_env("MAX_FILE_SIZE")),
            cleanup_interval: Duration::from_secs(cleanup_secs),
            temp_root: std::env::temp_dir(),
        }
    }
}

fn max_file_bytes_from_mb(megabytes: Option<u64>) -> u64 {
    megabytes
        .filter(|value| *value > 0)
        .and_then(|value| value.checked_mul(1024 * 1024))
        .unwrap_or(DEFAULT_MAX_FILE_SIZE_MB * 1024 * 1024)
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return configured;
    }

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_ceiling_falls_back_on_bad_values() {
        let default_bytes = DEFAULT_MAX_FILE_SIZE_MB * 1024 * 1024;
        assert_eq!(max_file_bytes_from_mb(None), default_bytes);
        assert_eq!(max_file_bytes_from_mb(Some(0)), default_bytes);
        // Values whose byte count would overflow are treated as invalid.
        assert_eq!(max_file_bytes_from_mb(Some(u64::MAX)), default_bytes);
        assert_eq!(max_file_bytes_from_mb(Some(50)), 50 * 1024 * 1024);
    }
}
