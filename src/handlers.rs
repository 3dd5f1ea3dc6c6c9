//! HTTP surface: routing, request validation, and the four endpoint
//! handlers in front of the yt-dlp layer.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::{
    cleanup::{ManifestStore, remove_job_dir, schedule_deferred_cleanup},
    config::{Config, DEFERRED_CLEANUP_SECS, JOB_DIR_PREFIX},
    error::ApiError,
    ytdlp::{self, DownloadKind, VideoInfo},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub started_at: Instant,
    pub manifest: ManifestStore,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/api/video-info", post(video_info))
        .route("/api/download", post(download))
        .route("/api/formats", post(formats))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn home() -> Json<serde_json::Value> {
    Json(json!({
        "message": "YouTube Downloader API v1.0",
        "status": "healthy",
        "endpoints": {
            "GET /": "API information",
            "GET /health": "Health check",
            "POST /api/video-info": "Get video information",
            "POST /api/download": "Download video/audio",
            "POST /api/formats": "Get available formats"
        },
        "usage": {
            "video-info": {
                "method": "POST",
                "body": {"url": "youtube_url"}
            },
            "download": {
                "method": "POST",
                "body": {
                    "url": "youtube_url",
                    "type": "video|audio",
                    "quality": "best|720p|480p|360p|worst"
                }
            }
        }
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().timestamp(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "temp_files": count_job_dirs(&state.config.temp_root).await,
    }))
}

#[derive(Debug, Deserialize)]
struct UrlRequest {
    url: Option<String>,
}

async fn video_info(
    Json(payload): Json<UrlRequest>,
) -> Result<Json<VideoInfo>, ApiError> {
    let url = require_supported_url(payload.url.as_deref())?;
    info!("getting info for {url}");

    let metadata = ytdlp::fetch_metadata(&url).await?;
    let normalized = VideoInfo::from_metadata(metadata, &url);
    info!("extracted info for {:?}", normalized.title);
    Ok(Json(normalized))
}

async fn formats(
    Json(payload): Json<UrlRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = require_supported_url(payload.url.as_deref())?;

    let metadata = ytdlp::fetch_metadata(&url).await?;
    let formats = ytdlp::build_format_list(&metadata.formats);
    Ok(Json(json!({ "formats": formats })))
}

fn default_quality() -> String {
    "best".to_string()
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    #[serde(rename = "type", default)]
    kind: DownloadKind,
    #[serde(default = "default_quality")]
    quality: String,
}

async fn download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = require_supported_url(payload.url.as_deref())?;
    info!(
        "downloading {:?} from {url} (quality: {})",
        payload.kind, payload.quality
    );

    let job_dir = state
        .config
        .temp_root
        .join(format!("{JOB_DIR_PREFIX}{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&job_dir).await.map_err(|error| {
        ApiError::internal(format!("Could not create download directory: {error}"))
    })?;
    state.manifest.register(&job_dir).await;

    let args = ytdlp::download_args(&url, payload.kind, &payload.quality, &job_dir);
    if let Err(error) = ytdlp::run_yt_dlp(args).await {
        remove_job_dir(&state.manifest, &job_dir).await;
        return Err(error);
    }

    serve_job_payload(&state, job_dir).await
}

/// Post-download step: pick the payload, enforce the size ceiling, and
/// stream it as an attachment. Success schedules the deferred cleanup; any
/// failure deletes the directory immediately, never leaving it for the
/// sweeper.
pub async fn serve_job_payload(
    state: &AppState,
    job_dir: PathBuf,
) -> Result<Response, ApiError> {
    match prepare_response(state, &job_dir).await {
        Ok(response) => {
            schedule_deferred_cleanup(
                state.manifest.clone(),
                job_dir,
                Duration::from_secs(DEFERRED_CLEANUP_SECS),
            );
            Ok(response)
        }
        Err(error) => {
            remove_job_dir(&state.manifest, &job_dir).await;
            Err(error)
        }
    }
}

async fn prepare_response(state: &AppState, job_dir: &Path) -> Result<Response, ApiError> {
    let (file_path, file_size) = largest_file_in(job_dir).await?.ok_or_else(|| {
        ApiError::no_file(
            "No file was downloaded. The video might be unavailable or too large.",
        )
    })?;

    if file_size > state.config.max_file_bytes {
        return Err(ApiError::too_large(format!(
            "File too large ({:.1}MB). Max allowed: {}MB",
            file_size as f64 / 1_048_576.0,
            state.config.max_file_bytes / 1_048_576
        )));
    }

    let filename = file_path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());
    info!(
        "sending {filename} ({:.2} MB)",
        file_size as f64 / 1_048_576.0
    );

    let file = tokio::fs::File::open(&file_path).await.map_err(|error| {
        ApiError::internal(format!("Could not open the downloaded file: {error}"))
    })?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&file_size.to_string())
            .map_err(|_| ApiError::internal("Could not build the length header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the attachment header."))?,
    );

    Ok((headers, body).into_response())
}

const SUPPORTED_DOMAINS: [&str; 2] = ["youtube.com", "youtu.be"];

/// A URL is accepted iff it parses and its host is a supported domain or a
/// subdomain of one (m.youtube.com, music.youtube.com, ...).
pub fn is_supported_url(input: &str) -> bool {
    let Ok(parsed) = Url::parse(input) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();

    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

fn require_supported_url(url: Option<&str>) -> Result<String, ApiError> {
    let url = url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::validation("URL is required"))?;

    if !is_supported_url(url) {
        return Err(ApiError::validation("Please provide a valid YouTube URL"));
    }

    Ok(url.to_string())
}

async fn count_job_dirs(temp_root: &Path) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(temp_root).await else {
        return 0;
    };

    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_dir())
            .unwrap_or(false);
        if is_dir
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(JOB_DIR_PREFIX))
        {
            count += 1;
        }
    }
    count
}

/// The payload is the largest regular file in the job directory. Heuristic:
/// a postprocessing byproduct could in principle outgrow the primary output.
pub async fn largest_file_in(dir: &Path) -> Result<Option<(PathBuf, u64)>, ApiError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|error| {
        ApiError::internal(format!("Could not read the download directory: {error}"))
    })?;

    let mut largest: Option<(PathBuf, u64)> = None;
    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        ApiError::internal(format!("Could not list downloaded files: {error}"))
    })? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        if !metadata.is_file() {
            continue;
        }
        let size = metadata.len();
        if largest.as_ref().is_none_or(|(_, best)| size > *best) {
            largest = Some((entry.path(), size));
        }
    }

    Ok(largest)
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;

    #[test]
    fn supported_urls_cover_youtube_hosts() {
        assert!(is_supported_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_supported_url("https://youtu.be/abc"));
        assert!(is_supported_url("https://m.youtube.com/watch?v=abc"));
        assert!(is_supported_url("https://music.youtube.com/watch?v=abc"));
    }

    #[test]
    fn unsupported_urls_are_rejected() {
        assert!(!is_supported_url("https://vimeo.com/12345"));
        assert!(!is_supported_url("https://notyoutube.com/watch"));
        assert!(!is_supported_url("https://evilyoutu.be.example.com/x"));
        assert!(!is_supported_url("ftp://youtube.com/watch"));
        assert!(!is_supported_url("not a url"));
    }

    #[test]
    fn missing_or_invalid_url_is_a_validation_error() {
        assert_eq!(
            require_supported_url(None).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            require_supported_url(Some("  ")).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            require_supported_url(Some("https://vimeo.com/1"))
                .unwrap_err()
                .status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            require_supported_url(Some(" https://youtu.be/abc ")).unwrap(),
            "https://youtu.be/abc"
        );
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for_filename("song.mp3"), "audio/mpeg");
        assert_eq!(content_type_for_filename("clip.MP4"), "video/mp4");
        assert_eq!(content_type_for_filename("clip.webm"), "video/webm");
        assert_eq!(
            content_type_for_filename("archive.mkv"),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for_filename("noext"),
            "application/octet-stream"
        );
    }

    #[test]
    fn content_disposition_keeps_ascii_and_utf8_names() {
        let header = build_content_disposition("vidéo (1).mp4");
        assert!(header.starts_with("attachment; filename=\"vid_o (1).mp4\""));
        assert!(header.contains("filename*=UTF-8''vid%C3%A9o%20%281%29.mp4"));
    }

    #[tokio::test]
    async fn largest_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.webm"), vec![0u8; 16]).unwrap();
        std::fs::write(dir.path().join("big.mp4"), vec![0u8; 4096]).unwrap();
        std::fs::create_dir(dir.path().join("ignored_subdir")).unwrap();

        let (path, size) = largest_file_in(dir.path()).await.unwrap().unwrap();
        assert_eq!(path.file_name().unwrap(), "big.mp4");
        assert_eq!(size, 4096);
    }

    #[tokio::test]
    async fn empty_directory_has_no_payload() {
        let dir = tempfile::tempdir().unwrap();
        assert!(largest_file_in(dir.path()).await.unwrap().is_none());
    }

    #[test]
    fn download_request_tolerates_unknown_labels() {
        let request: DownloadRequest = serde_json::from_str(
            r#"{"url": "https://youtu.be/abc", "type": "gif", "quality": "ultra"}"#,
        )
        .unwrap();
        assert_eq!(request.kind, DownloadKind::Video);
        assert_eq!(
            ytdlp::video_format_selector(&request.quality),
            ytdlp::video_format_selector("best")
        );
    }

    async fn test_state(temp_root: &Path, max_file_bytes: u64) -> AppState {
        AppState {
            config: Config {
                bind_addr: "127.0.0.1:0".to_string(),
                max_file_bytes,
                cleanup_interval: Duration::from_secs(300),
                temp_root: temp_root.to_path_buf(),
            },
            started_at: Instant::now(),
            manifest: ManifestStore::load(temp_root).await,
        }
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_and_directory_deleted() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), 1024).await;

        let job_dir = root.path().join("yt_download_oversize");
        std::fs::create_dir(&job_dir).unwrap();
        std::fs::write(job_dir.join("huge.mp4"), vec![0u8; 4096]).unwrap();
        state.manifest.register(&job_dir).await;

        let error = serve_job_payload(&state, job_dir.clone())
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::PAYLOAD_TOO_LARGE);
        // The directory is deleted immediately, not left for the sweeper.
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn empty_job_directory_is_a_server_error_and_deleted() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), 1024).await;

        let job_dir = root.path().join("yt_download_empty");
        std::fs::create_dir(&job_dir).unwrap();
        state.manifest.register(&job_dir).await;

        let error = serve_job_payload(&state, job_dir.clone())
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn payload_under_ceiling_is_streamed_as_attachment() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), 1024).await;

        let job_dir = root.path().join("yt_download_ok");
        std::fs::create_dir(&job_dir).unwrap();
        std::fs::write(job_dir.join("clip.mp4"), vec![0u8; 16]).unwrap();
        state.manifest.register(&job_dir).await;

        let response = serve_job_payload(&state, job_dir.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert_eq!(headers[CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[CONTENT_LENGTH], "16");
        assert!(
            headers[CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .starts_with("attachment; filename=\"clip.mp4\"")
        );
        // Reclaim is deferred, not inline.
        assert!(job_dir.exists());
    }
}
