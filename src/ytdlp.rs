//! Thin layer over the `yt-dlp` executable: subprocess invocation, metadata
//! parsing, format-selector construction, and format-list shaping.

use std::{
    cmp::Reverse,
    collections::HashSet,
    io::ErrorKind,
    path::Path,
    process::Output,
};

use serde::{Deserialize, Serialize};
use tokio::{
    process::Command,
    time::{Duration, timeout},
};

use crate::{
    config::{FORMAT_LIST_LIMIT, YT_DLP_TIMEOUT_SECONDS},
    error::ApiError,
};

/// Requested download kind. Anything other than `audio` is treated as
/// video, mirroring the quality label's fall-back-to-best tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    Audio,
    #[default]
    #[serde(other)]
    Video,
}

/// The subset of yt-dlp's `-J` output this service reads.
#[derive(Debug, Deserialize)]
pub struct VideoMetadata {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub view_count: Option<u64>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub upload_date: Option<String>,
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub height: Option<u32>,
    pub filesize: Option<u64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub fps: Option<f32>,
}

impl RawFormat {
    fn kind(&self) -> FormatKind {
        if self.vcodec.as_deref() == Some("none") {
            FormatKind::Audio
        } else {
            FormatKind::Video
        }
    }
}

/// Normalized metadata returned by `/api/video-info`.
#[derive(Debug, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub duration: u64,
    pub uploader: String,
    pub view_count: Option<u64>,
    pub description: String,
    pub thumbnail: Option<String>,
    pub upload_date: Option<String>,
    pub formats_available: usize,
    pub id: String,
    pub webpage_url: String,
}

impl VideoInfo {
    pub fn from_metadata(info: VideoMetadata, requested_url: &str) -> Self {
        let description = info
            .description
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| format!("{}...", truncate_chars(value, 200)))
            .unwrap_or_default();

        Self {
            title: non_empty_or(info.title, "Unknown"),
            duration: info.duration.unwrap_or(0.0).round() as u64,
            uploader: non_empty_or(info.uploader, "Unknown"),
            view_count: info.view_count,
            description,
            thumbnail: info.thumbnail,
            upload_date: info.upload_date,
            formats_available: info.formats.len(),
            id: info.id.unwrap_or_default(),
            webpage_url: info
                .webpage_url
                .unwrap_or_else(|| requested_url.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Video,
    Audio,
}

/// One entry of the `/api/formats` listing.
#[derive(Debug, Serialize)]
pub struct FormatEntry {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub resolution: String,
    pub height: Option<u32>,
    pub filesize: Option<u64>,
    pub filesize_mb: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub fps: Option<f32>,
    #[serde(rename = "type")]
    pub kind: FormatKind,
}

/// Shape yt-dlp's raw format list for clients: dedup by
/// `(height, ext, kind)` keeping the first occurrence, sort audio-only
/// formats last and video formats by descending height, cap the result.
pub fn build_format_list(formats: &[RawFormat]) -> Vec<FormatEntry> {
    let mut seen = HashSet::new();
    let mut entries: Vec<FormatEntry> = formats
        .iter()
        .filter(|raw| seen.insert((raw.height, raw.ext.clone(), raw.kind())))
        .map(|raw| {
            let kind = raw.kind();
            let resolution = raw.resolution.clone().unwrap_or_else(|| {
                match kind {
                    FormatKind::Audio => "audio only",
                    FormatKind::Video => "unknown",
                }
                .to_string()
            });

            FormatEntry {
                format_id: raw.format_id.clone(),
                ext: raw.ext.clone(),
                resolution,
                height: raw.height,
                filesize: raw.filesize,
                filesize_mb: raw.filesize.map(|bytes| {
                    (bytes as f64 / 1_048_576.0 * 10.0).round() / 10.0
                }),
                vcodec: raw.vcodec.clone(),
                acodec: raw.acodec.clone(),
                fps: raw.fps,
                kind,
            }
        })
        .collect();

    entries.sort_by_key(|entry| {
        (
            entry.kind == FormatKind::Audio,
            Reverse(entry.height.unwrap_or(0)),
        )
    });
    entries.truncate(FORMAT_LIST_LIMIT);
    entries
}

/// Quality label → yt-dlp format selector, each paired with a filesize
/// ceiling so web transfers stay bounded.
pub fn video_format_selector(quality: &str) -> &'static str {
    match quality {
        "720p" => "best[height<=720][filesize<80M]/best[height<=720]",
        "480p" => "best[height<=480][filesize<50M]/best[height<=480]",
        "360p" => "best[height<=360][filesize<30M]/best[height<=360]",
        "worst" => "worst[filesize<20M]/worst",
        _ => "best[filesize<100M]/best[height<=1080]",
    }
}

/// Build the yt-dlp argument list for a download into `job_dir`.
pub fn download_args(
    url: &str,
    kind: DownloadKind,
    quality: &str,
    job_dir: &Path,
) -> Vec<String> {
    let output_template = format!("{}/%(title)s.%(ext)s", job_dir.display());

    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "-o".to_string(),
        output_template,
    ];

    match kind {
        DownloadKind::Video => {
            args.push("-f".to_string());
            args.push(video_format_selector(quality).to_string());
        }
        DownloadKind::Audio => {
            args.extend(
                [
                    "-f",
                    "bestaudio/best",
                    "-x",
                    "--audio-format",
                    "mp3",
                    "--audio-quality",
                    "192K",
                ]
                .map(String::from),
            );
        }
    }

    args.push(url.to_string());
    args
}

/// Fetch metadata without downloading anything.
pub async fn fetch_metadata(url: &str) -> Result<VideoMetadata, ApiError> {
    let output = run_yt_dlp(vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        url.to_string(),
    ])
    .await?;

    serde_json::from_slice(&output.stdout).map_err(|error| {
        ApiError::extraction(format!("Could not parse yt-dlp metadata: {error}"))
    })
}

/// Run the yt-dlp binary with a hard timeout. A non-zero exit becomes an
/// extraction error carrying the last stderr line.
pub async fn run_yt_dlp(args: Vec<String>) -> Result<Output, ApiError> {
    let command_future = Command::new("yt-dlp").args(&args).output();
    let output = timeout(Duration::from_secs(YT_DLP_TIMEOUT_SECONDS), command_future)
        .await
        .map_err(|_| {
            ApiError::extraction(
                "The operation exceeded the time limit. Try another URL or format.",
            )
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::internal(
                    "yt-dlp is not installed on this system. Install yt-dlp and restart the service.",
                )
            } else {
                ApiError::internal(format!("Could not run yt-dlp: {error}"))
            }
        })?;

    if !output.status.success() {
        return Err(ApiError::extraction(extraction_error_message(
            &output.stderr,
        )));
    }

    Ok(output)
}

fn extraction_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

fn non_empty_or(value: Option<String>, fallback: &str) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn truncate_chars(value: &str, limit: usize) -> String {
    value.chars().take(limit).collect()
}
