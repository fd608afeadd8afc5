use std::{
    future::Future,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    net::TcpListener,
    process::Command,
    time::{Duration, sleep},
};
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    downloads_dir: PathBuf,
    cookie_path: PathBuf,
}

const SERVICE_NAME: &str = "ytrelay";
const CREATOR: &str = "ytrelay team";
const YT_DLP_BIN: &str = "yt-dlp";
const DOWNLOAD_DIR: &str = "downloads";
const COOKIE_FILE: &str = "cookies.txt";
const DEFAULT_PORT: u16 = 8000;

const PLATFORM_URL_MARKER: &str = "youtu";
const DEFAULT_QUALITY: &str = "best[height<=720]";
const AUDIO_FORMAT_SELECTOR: &str = "bestaudio/best";
const AUDIO_QUALITY: &str = "192K";

const MAX_METADATA_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 2;

const EXTRACTOR_RETRIES: u32 = 5;
const FRAGMENT_RETRIES: u32 = 5;
const SOCKET_TIMEOUT_SECS: u32 = 30;
const MIN_SLEEP_SECS: u32 = 1;
const MAX_SLEEP_SECS: u32 = 3;
const GEO_BYPASS_COUNTRY: &str = "US";

const DESCRIPTION_LIMIT: usize = 200;
const RESPONSE_ERROR_LIMIT: usize = 100;
const EXTRACTOR_ERROR_LIMIT: usize = 150;
const MAX_VIDEO_FORMATS: usize = 5;
const MAX_AUDIO_FORMATS: usize = 3;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "m4a"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a"];

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

const BROWSER_HEADERS: &[&str] = &[
    "Accept:text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    "Accept-Language:en-US,en;q=0.5",
    "Accept-Encoding:gzip, deflate",
    "DNT:1",
    "Connection:keep-alive",
    "Upgrade-Insecure-Requests:1",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum ResponseStatus {
    Success,
    Error,
    Warning,
}

/// Uniform wrapper returned by every JSON endpoint.
#[derive(Debug, Serialize)]
struct Envelope {
    status: ResponseStatus,
    message: String,
    creator: &'static str,
    timestamp: DateTime<Utc>,
    service: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl Envelope {
    fn new(status: ResponseStatus, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status,
            message: message.into(),
            creator: CREATOR,
            timestamp: Utc::now(),
            service: SERVICE_NAME,
            data,
        }
    }

    fn success(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::new(ResponseStatus::Success, message, data)
    }

    fn error(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::new(ResponseStatus::Error, message, data)
    }

    fn warning(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::new(ResponseStatus::Warning, message, data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    BotChallenge,
    AgeRestricted,
    Unavailable,
    Other,
}

/// Substring table used to classify free-text yt-dlp errors. There is no
/// structured error-code contract with yt-dlp, so upstream wording changes can
/// silently break this classification. Age-restriction markers come first:
/// "Sign in to confirm your age" would otherwise match the bot markers.
const ERROR_SIGNATURES: &[(&str, FailureKind)] = &[
    ("confirm your age", FailureKind::AgeRestricted),
    ("age restricted", FailureKind::AgeRestricted),
    ("age-restricted", FailureKind::AgeRestricted),
    ("sign in", FailureKind::BotChallenge),
    ("confirm", FailureKind::BotChallenge),
    ("bot", FailureKind::BotChallenge),
    ("unavailable", FailureKind::Unavailable),
];

fn classify_failure(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    ERROR_SIGNATURES
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, kind)| *kind)
        .unwrap_or(FailureKind::Other)
}

#[derive(Debug, Clone)]
struct ExtractError {
    kind: FailureKind,
    message: String,
}

impl ExtractError {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }

    fn from_message(message: &str) -> Self {
        // Classify before truncating: a marker past the storage bound must
        // still drive the retry decision.
        Self {
            kind: classify_failure(message),
            message: truncate_chars(message, EXTRACTOR_ERROR_LIMIT),
        }
    }

    fn from_stderr(stderr: &[u8]) -> Self {
        let message = String::from_utf8_lossy(stderr)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .unwrap_or("yt-dlp exited with an error")
            .to_string();
        Self::from_message(&message)
    }
}

/// Per-call configuration handed to yt-dlp. Built fresh for every invocation
/// so the user agent rotates between attempts.
#[derive(Debug, Clone)]
struct ExtractOptions {
    user_agent: &'static str,
    authenticated: bool,
}

impl ExtractOptions {
    fn new(authenticated: bool) -> Self {
        Self {
            user_agent: random_user_agent(),
            authenticated,
        }
    }

    fn common_args(&self, cookie_path: &Path) -> Vec<String> {
        let mut args = vec![
            "--no-warnings".to_string(),
            "--no-check-certificates".to_string(),
            "--no-playlist".to_string(),
            "--user-agent".to_string(),
            self.user_agent.to_string(),
        ];

        for header in BROWSER_HEADERS {
            args.push("--add-header".to_string());
            args.push((*header).to_string());
        }

        args.push("--retries".to_string());
        args.push(EXTRACTOR_RETRIES.to_string());
        args.push("--fragment-retries".to_string());
        args.push(FRAGMENT_RETRIES.to_string());
        args.push("--skip-unavailable-fragments".to_string());
        args.push("--socket-timeout".to_string());
        args.push(SOCKET_TIMEOUT_SECS.to_string());
        args.push("--sleep-interval".to_string());
        args.push(MIN_SLEEP_SECS.to_string());
        args.push("--max-sleep-interval".to_string());
        args.push(MAX_SLEEP_SECS.to_string());
        args.push("--force-ipv4".to_string());
        args.push("--geo-bypass-country".to_string());
        args.push(GEO_BYPASS_COUNTRY.to_string());

        // Missing cookie file degrades to unauthenticated access.
        if cookie_path.exists() {
            args.push("--cookies".to_string());
            args.push(cookie_path.display().to_string());
        } else if self.authenticated {
            warn!(
                "authenticated access requested but {} is missing",
                cookie_path.display()
            );
        }

        args
    }
}

fn random_user_agent() -> &'static str {
    user_agent_at(rand::rng().random_range(0..USER_AGENTS.len()))
}

fn user_agent_at(index: usize) -> &'static str {
    USER_AGENTS[index % USER_AGENTS.len()]
}

/// Metadata document emitted by `yt-dlp -J`, reduced to the fields we project.
#[derive(Debug, Default, Deserialize)]
struct VideoInfo {
    title: Option<String>,
    duration_string: Option<String>,
    view_count: Option<u64>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    description: Option<String>,
    upload_date: Option<String>,
    channel_url: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    format_note: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct FormatDescriptor {
    format_id: String,
    ext: String,
    quality: String,
    filesize: u64,
    has_video: bool,
    has_audio: bool,
}

#[derive(Debug, Deserialize)]
struct InfoParams {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    #[serde(default)]
    url: String,
    #[serde(default = "default_quality")]
    quality: String,
}

fn default_quality() -> String {
    DEFAULT_QUALITY.to_string()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ytrelay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> std::io::Result<()> {
    let downloads_dir = PathBuf::from(DOWNLOAD_DIR);
    tokio::fs::create_dir_all(&downloads_dir).await?;

    let state = AppState {
        downloads_dir,
        cookie_path: PathBuf::from(COOKIE_FILE),
    };

    if state.cookie_path.exists() {
        info!("cookie file found, platform requests will be authenticated");
    } else {
        warn!("no cookie file found, platform requests will be unauthenticated");
    }

    let app = Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .route("/cookie-status", get(cookie_status))
        .route("/troubleshoot", get(cookie_status))
        .route("/video/info", get(video_info))
        .route("/video/download", get(video_download))
        .route("/audio/download", get(audio_download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], resolve_port()));
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");

    axum::serve(listener, app).await
}

fn resolve_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT)
}

async fn service_info(State(state): State<AppState>) -> Json<Envelope> {
    let (present, count) = cookie_file_stats(&state.cookie_path).await;

    Json(Envelope::success(
        "YouTube metadata and download relay",
        Some(json!({
            "cookie_status": if present { "Present" } else { "Missing" },
            "cookie_count": count,
            "endpoints": {
                "GET /": "This info page",
                "GET /health": "Liveness probe with extractor version",
                "GET /cookie-status": "Check cookie file",
                "GET /video/info": "Get video information",
                "GET /video/download": "Download video",
                "GET /audio/download": "Download audio only",
            },
            "example": "/video/info?url=https://youtu.be/Yocja_N5s1I",
            "note": if present { "Using cookies.txt" } else { "Using no cookies" },
        })),
    ))
}

async fn health() -> Json<Envelope> {
    let engine_version = match run_yt_dlp(&["--version".to_string()]).await {
        Ok(stdout) => String::from_utf8_lossy(&stdout).trim().to_string(),
        Err(error) => {
            warn!("could not read yt-dlp version: {}", error.message);
            "unknown".to_string()
        }
    };

    Json(Envelope::success(
        "Service is healthy",
        Some(json!({
            "status": "healthy",
            "server_time": Utc::now().to_rfc3339(),
            "engine_version": engine_version,
        })),
    ))
}

async fn cookie_status(State(state): State<AppState>) -> Json<Envelope> {
    match tokio::fs::read_to_string(&state.cookie_path).await {
        Ok(contents) => {
            let count = count_cookie_lines(&contents);
            if count == 0 {
                Json(Envelope::warning(
                    "cookies.txt exists but contains no cookie entries",
                    Some(json!({
                        "cookie_count": 0,
                        "fix": "Regenerate cookies.txt from a logged-in browser session",
                    })),
                ))
            } else {
                Json(Envelope::success(
                    format!("cookies.txt found with {count} entries"),
                    Some(json!({ "cookie_count": count })),
                ))
            }
        }
        Err(_) => Json(Envelope::error(
            "cookies.txt file not found",
            Some(json!({
                "action": "Add a cookies.txt file next to the service binary",
                "how_to": "Export cookies from your browser while logged into YouTube",
            })),
        )),
    }
}

async fn video_info(
    State(state): State<AppState>,
    Query(params): Query<InfoParams>,
) -> Json<Envelope> {
    let url = params.url.trim().to_string();
    if url.is_empty() || !url.contains(PLATFORM_URL_MARKER) {
        return Json(Envelope::error("Please provide a valid YouTube URL", None));
    }

    let cookie_path = state.cookie_path.clone();
    let outcome = resolve_metadata(|options| {
        let url = url.clone();
        let cookie_path = cookie_path.clone();
        async move { fetch_video_metadata(&url, &options, &cookie_path).await }
    })
    .await;

    match outcome {
        Ok(info) => {
            let formats = collect_formats(&info.formats);
            let video_formats = video_format_list(&formats);
            let audio_formats = audio_format_list(&formats);

            let data = json!({
                "title": info.title.unwrap_or_else(|| "Unknown".to_string()),
                "duration": info.duration_string.unwrap_or_else(|| "Unknown".to_string()),
                "view_count": info.view_count.unwrap_or(0),
                "uploader": info.uploader.unwrap_or_else(|| "Unknown".to_string()),
                "thumbnail": info.thumbnail.unwrap_or_default(),
                "description": summarize_description(info.description.as_deref()),
                "upload_date": info.upload_date.unwrap_or_else(|| "Unknown".to_string()),
                "channel_url": info.channel_url.unwrap_or_default(),
                "total_formats": formats.len(),
                "video_formats": video_formats,
                "audio_formats": audio_formats,
                "using_cookies": state.cookie_path.exists(),
            });

            Json(Envelope::success(
                "Video information retrieved successfully",
                Some(data),
            ))
        }
        Err(error) => {
            warn!("metadata lookup failed for {url:?}: {}", error.message);
            Json(metadata_error_envelope(&error, &state.cookie_path).await)
        }
    }
}

async fn metadata_error_envelope(error: &ExtractError, cookie_path: &Path) -> Envelope {
    let (present, count) = cookie_file_stats(cookie_path).await;

    Envelope::error(
        format!(
            "Failed to get video info: {}",
            truncate_chars(&error.message, RESPONSE_ERROR_LIMIT)
        ),
        Some(json!({
            "suggestion": suggestion_for(error.kind),
            "cookie_file": if present { "Present" } else { "Missing" },
            "cookie_count": count,
        })),
    )
}

fn suggestion_for(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::BotChallenge => {
            "YouTube is blocking automated access; refresh cookies.txt from a logged-in browser"
        }
        FailureKind::AgeRestricted => {
            "Video is age-restricted; export cookies from an account allowed to view it"
        }
        FailureKind::Unavailable => "Video may be private, deleted, or region restricted",
        FailureKind::Other => "Try a different video or retry later",
    }
}

async fn video_download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Response {
    let url = params.url.trim().to_string();
    match perform_video_download(&state, &url, &params.quality).await {
        Ok(response) => response,
        Err(error) => {
            warn!("video download failed for {url:?}: {}", error.message);
            Json(Envelope::error(
                format!(
                    "Download failed: {}",
                    truncate_chars(&error.message, RESPONSE_ERROR_LIMIT)
                ),
                Some(json!({
                    "tip": "Try the /video/info endpoint first to check accessibility",
                })),
            ))
            .into_response()
        }
    }
}

async fn audio_download(
    State(state): State<AppState>,
    Query(params): Query<InfoParams>,
) -> Response {
    let url = params.url.trim().to_string();
    match perform_audio_download(&state, &url).await {
        Ok(response) => response,
        Err(error) => {
            warn!("audio download failed for {url:?}: {}", error.message);
            Json(Envelope::error(
                format!(
                    "Audio download failed: {}",
                    truncate_chars(&error.message, RESPONSE_ERROR_LIMIT)
                ),
                None,
            ))
            .into_response()
        }
    }
}

/// Bounded retry around one metadata lookup. Generic over the fetch call so
/// tests can substitute the yt-dlp invocation.
///
/// Bot challenges are retried with exponential backoff and a fresh user agent
/// until the attempt budget runs out. An age-restriction failure on the first
/// attempt forces cookie-authenticated options and retries once; anything else
/// fails immediately.
async fn resolve_metadata<F, Fut>(mut fetch: F) -> Result<VideoInfo, ExtractError>
where
    F: FnMut(ExtractOptions) -> Fut,
    Fut: Future<Output = Result<VideoInfo, ExtractError>>,
{
    let mut authenticated = false;

    for attempt in 0..MAX_METADATA_ATTEMPTS {
        if attempt > 0 {
            sleep(Duration::from_secs(BACKOFF_BASE_SECS.pow(attempt))).await;
        }

        match fetch(ExtractOptions::new(authenticated)).await {
            Ok(info) => return Ok(info),
            Err(error) => match error.kind {
                FailureKind::BotChallenge => {
                    warn!(
                        "bot challenge on attempt {}: {}",
                        attempt + 1,
                        error.message
                    );
                }
                FailureKind::AgeRestricted => {
                    if attempt == 0 {
                        warn!("age restriction hit, retrying with authenticated options");
                        authenticated = true;
                    } else {
                        return Err(ExtractError::new(
                            FailureKind::AgeRestricted,
                            "video is age-restricted, cookies from a logged-in session are required",
                        ));
                    }
                }
                FailureKind::Unavailable | FailureKind::Other => return Err(error),
            },
        }
    }

    Err(ExtractError::new(
        FailureKind::BotChallenge,
        format!("bot challenge persisted after {MAX_METADATA_ATTEMPTS} attempts"),
    ))
}

async fn fetch_video_metadata(
    url: &str,
    options: &ExtractOptions,
    cookie_path: &Path,
) -> Result<VideoInfo, ExtractError> {
    let mut args = options.common_args(cookie_path);
    args.push("-J".to_string());
    args.push(url.to_string());

    let stdout = run_yt_dlp(&args).await?;
    serde_json::from_slice(&stdout)
        .map_err(|error| ExtractError::other(format!("could not parse yt-dlp metadata: {error}")))
}

async fn perform_video_download(
    state: &AppState,
    url: &str,
    quality: &str,
) -> Result<Response, ExtractError> {
    let download_id = Uuid::new_v4();
    let output_base = state.downloads_dir.join(download_id.to_string());

    let options = ExtractOptions::new(false);
    let mut args = options.common_args(&state.cookie_path);
    args.push("-f".to_string());
    args.push(quality.to_string());
    args.push("-o".to_string());
    args.push(format!("{}.%(ext)s", output_base.display()));
    args.push(url.to_string());

    run_yt_dlp(&args).await?;

    let media_path = locate_output_file(&output_base, VIDEO_EXTENSIONS)
        .await
        .ok_or_else(|| ExtractError::other("downloaded file not found in the output directory"))?;

    info!("video download complete: {}", media_path.display());
    stream_media_file(&media_path, "video", download_id).await
}

async fn perform_audio_download(state: &AppState, url: &str) -> Result<Response, ExtractError> {
    let download_id = Uuid::new_v4();
    let output_base = state.downloads_dir.join(download_id.to_string());

    let options = ExtractOptions::new(false);
    let mut args = options.common_args(&state.cookie_path);
    args.push("-f".to_string());
    args.push(AUDIO_FORMAT_SELECTOR.to_string());
    args.push("-x".to_string());
    args.push("--audio-format".to_string());
    args.push("mp3".to_string());
    args.push("--audio-quality".to_string());
    args.push(AUDIO_QUALITY.to_string());
    args.push("-o".to_string());
    args.push(format!("{}.%(ext)s", output_base.display()));
    args.push(url.to_string());

    run_yt_dlp(&args).await?;

    let media_path = locate_output_file(&output_base, AUDIO_EXTENSIONS)
        .await
        .ok_or_else(|| ExtractError::other("transcoded file not found in the output directory"))?;

    info!("audio download complete: {}", media_path.display());
    stream_media_file(&media_path, "audio", download_id).await
}

async fn run_yt_dlp(args: &[String]) -> Result<Vec<u8>, ExtractError> {
    let output = Command::new(YT_DLP_BIN)
        .args(args)
        .output()
        .await
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ExtractError::other(
                    "yt-dlp is not installed on this system; install it and restart the service",
                )
            } else {
                ExtractError::other(format!("failed to launch yt-dlp: {error}"))
            }
        })?;

    if !output.status.success() {
        return Err(ExtractError::from_stderr(&output.stderr));
    }

    Ok(output.stdout)
}

/// yt-dlp picks the container itself, so the produced extension is not known
/// in advance. Probe the expected candidates in order.
async fn locate_output_file(output_base: &Path, extensions: &[&str]) -> Option<PathBuf> {
    for extension in extensions {
        let candidate = output_base.with_extension(extension);
        if tokio::fs::metadata(&candidate)
            .await
            .is_ok_and(|metadata| metadata.is_file())
        {
            return Some(candidate);
        }
    }
    None
}

async fn stream_media_file(
    path: &Path,
    prefix: &str,
    download_id: Uuid,
) -> Result<Response, ExtractError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("bin")
        .to_string();

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|error| ExtractError::other(format!("could not stat downloaded file: {error}")))?;
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|error| ExtractError::other(format!("could not open downloaded file: {error}")))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let client_filename = format!("{prefix}_{download_id}.{extension}");

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(media_type_for_extension(&extension)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ExtractError::other("could not build content length header"))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&client_filename))
            .map_err(|_| ExtractError::other("could not build content disposition header"))?,
    );

    Ok((headers, body).into_response())
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{filename}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn media_type_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn collect_formats(raw: &[RawFormat]) -> Vec<FormatDescriptor> {
    raw.iter()
        .filter_map(|item| {
            // Only formats with a known exact or approximate size are listed.
            let filesize = item.filesize.or(item.filesize_approx)?;
            Some(FormatDescriptor {
                format_id: item.format_id.clone().unwrap_or_default(),
                ext: item.ext.clone().unwrap_or_else(|| "unknown".to_string()),
                quality: item
                    .format_note
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                filesize: filesize as u64,
                has_video: is_present_codec(item.vcodec.as_deref()),
                has_audio: is_present_codec(item.acodec.as_deref()),
            })
        })
        .collect()
}

fn is_present_codec(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if value != "none")
}

fn video_format_list(formats: &[FormatDescriptor]) -> Vec<FormatDescriptor> {
    let mut video: Vec<FormatDescriptor> = formats
        .iter()
        .filter(|format| format.has_video)
        .cloned()
        .collect();
    video.sort_by(|a, b| parse_height(&b.quality).cmp(&parse_height(&a.quality)));
    video.truncate(MAX_VIDEO_FORMATS);
    video
}

fn audio_format_list(formats: &[FormatDescriptor]) -> Vec<FormatDescriptor> {
    let mut audio: Vec<FormatDescriptor> = formats
        .iter()
        .filter(|format| !format.has_video && format.has_audio)
        .cloned()
        .collect();
    audio.truncate(MAX_AUDIO_FORMATS);
    audio
}

/// Leading digits of a quality label like "1080p" or "720p60". Labels without
/// a numeric height sort below every parseable one.
fn parse_height(quality: &str) -> Option<u32> {
    let digits: String = quality.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn summarize_description(description: Option<&str>) -> String {
    match description {
        Some(text) if !text.is_empty() => {
            format!("{}...", truncate_chars(text, DESCRIPTION_LIMIT))
        }
        _ => String::new(),
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

async fn cookie_file_stats(cookie_path: &Path) -> (bool, usize) {
    match tokio::fs::read_to_string(cookie_path).await {
        Ok(contents) => (true, count_cookie_lines(&contents)),
        Err(_) => (false, 0),
    }
}

fn count_cookie_lines(contents: &str) -> usize {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn bot_error() -> ExtractError {
        ExtractError::from_message("ERROR: Sign in to confirm you're not a bot")
    }

    fn descriptor(quality: &str, has_video: bool, has_audio: bool) -> FormatDescriptor {
        FormatDescriptor {
            format_id: format!("f-{quality}"),
            ext: "mp4".to_string(),
            quality: quality.to_string(),
            filesize: 1_000,
            has_video,
            has_audio,
        }
    }

    #[test]
    fn envelope_carries_identity_fields() {
        let value = serde_json::to_value(Envelope::success("ok", None)).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["message"], "ok");
        assert_eq!(value["creator"], CREATOR);
        assert_eq!(value["service"], SERVICE_NAME);
        assert!(value["timestamp"].is_string());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn envelope_includes_data_when_present() {
        let value =
            serde_json::to_value(Envelope::error("bad", Some(json!({ "hint": "x" })))).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["data"]["hint"], "x");
    }

    #[tokio::test]
    async fn info_rejects_url_without_platform_marker() {
        let state = AppState {
            downloads_dir: PathBuf::from(DOWNLOAD_DIR),
            cookie_path: PathBuf::from("missing-cookies.txt"),
        };

        // The validation message proves the handler bailed out before ever
        // reaching the extractor, not that some later step failed.
        let response = video_info(
            State(state.clone()),
            Query(InfoParams {
                url: "https://example.com/watch?v=abc".to_string(),
            }),
        )
        .await;
        assert_eq!(response.0.status, ResponseStatus::Error);
        assert_eq!(response.0.message, "Please provide a valid YouTube URL");

        let response = video_info(State(state), Query(InfoParams { url: "  ".to_string() })).await;
        assert_eq!(response.0.status, ResponseStatus::Error);
        assert_eq!(response.0.message, "Please provide a valid YouTube URL");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_bot_challenges() {
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let result = resolve_metadata(|_options| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(bot_error())
                } else {
                    Ok(VideoInfo::default())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s before the second attempt, 4s before the third.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_bot_attempts() {
        let calls = AtomicUsize::new(0);

        let result = resolve_metadata(|_options| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<VideoInfo, _>(bot_error()) }
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(error.kind, FailureKind::BotChallenge);
        assert!(error.message.contains("3 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_METADATA_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn age_restriction_forces_authenticated_retry() {
        let calls = AtomicUsize::new(0);

        let result = resolve_metadata(|options| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(ExtractError::from_message(
                        "ERROR: Sign in to confirm your age",
                    ))
                } else {
                    assert!(options.authenticated);
                    Ok(VideoInfo::default())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn age_restriction_after_first_attempt_requires_cookies() {
        let calls = AtomicUsize::new(0);

        let result = resolve_metadata(|_options| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err::<VideoInfo, _>(bot_error())
                } else {
                    Err(ExtractError::from_message("This video is age restricted"))
                }
            }
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(error.kind, FailureKind::AgeRestricted);
        assert!(error.message.contains("cookies"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);

        let result = resolve_metadata(|_options| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<VideoInfo, _>(ExtractError::from_message("Video unavailable")) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classifies_failure_messages() {
        assert_eq!(
            classify_failure("Sign in to confirm you're not a bot"),
            FailureKind::BotChallenge
        );
        assert_eq!(
            classify_failure("SIGN IN to continue"),
            FailureKind::BotChallenge
        );
        assert_eq!(
            classify_failure("Sign in to confirm your age"),
            FailureKind::AgeRestricted
        );
        assert_eq!(
            classify_failure("This video is age restricted"),
            FailureKind::AgeRestricted
        );
        assert_eq!(
            classify_failure("Video unavailable"),
            FailureKind::Unavailable
        );
        assert_eq!(classify_failure("something exploded"), FailureKind::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn late_marker_still_drives_classification() {
        let padding = "x".repeat(EXTRACTOR_ERROR_LIMIT + 10);
        let raw = format!("{padding} Sign in to confirm you're not a bot");

        let error = ExtractError::from_message(&raw);
        assert_eq!(error.kind, FailureKind::BotChallenge);
        assert_eq!(error.message.chars().count(), EXTRACTOR_ERROR_LIMIT);

        // The retry controller must treat it as a bot challenge, not give up.
        let calls = AtomicUsize::new(0);
        let result = resolve_metadata(|_options| {
            calls.fetch_add(1, Ordering::SeqCst);
            let raw = raw.clone();
            async move { Err::<VideoInfo, _>(ExtractError::from_message(&raw)) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::BotChallenge);
        assert_eq!(calls.load(Ordering::SeqCst), MAX_METADATA_ATTEMPTS as usize);
    }

    #[test]
    fn video_formats_sort_by_height_and_cap() {
        let formats = vec![
            descriptor("360p", true, true),
            descriptor("Premium", true, true),
            descriptor("1080p", true, false),
            descriptor("720p", true, true),
        ];

        let sorted = video_format_list(&formats);
        assert_eq!(sorted[0].quality, "1080p");
        assert_eq!(sorted[1].quality, "720p");
        assert_eq!(sorted[2].quality, "360p");
        assert_eq!(sorted[3].quality, "Premium");

        let many: Vec<FormatDescriptor> = (1..=7)
            .map(|n| descriptor(&format!("{}p", n * 100), true, true))
            .collect();
        assert_eq!(video_format_list(&many).len(), MAX_VIDEO_FORMATS);

        let audio: Vec<FormatDescriptor> = (0..4)
            .map(|n| descriptor(&format!("tiny-{n}"), false, true))
            .collect();
        assert_eq!(audio_format_list(&audio).len(), MAX_AUDIO_FORMATS);
    }

    #[test]
    fn collect_formats_requires_a_known_size() {
        let raw = vec![
            RawFormat {
                format_id: Some("22".to_string()),
                ext: Some("mp4".to_string()),
                format_note: Some("720p".to_string()),
                filesize: None,
                filesize_approx: Some(1024.0),
                vcodec: Some("avc1".to_string()),
                acodec: Some("mp4a".to_string()),
            },
            RawFormat {
                format_id: Some("sb0".to_string()),
                vcodec: Some("none".to_string()),
                acodec: Some("none".to_string()),
                ..RawFormat::default()
            },
        ];

        let formats = collect_formats(&raw);
        assert_eq!(formats.len(), 1);
        assert_eq!(formats[0].filesize, 1024);
        assert!(formats[0].has_video);
        assert!(formats[0].has_audio);
    }

    #[test]
    fn parses_heights_from_quality_labels() {
        assert_eq!(parse_height("1080p"), Some(1080));
        assert_eq!(parse_height("720p60"), Some(720));
        assert_eq!(parse_height("Unknown"), None);
        assert_eq!(parse_height(""), None);
    }

    #[tokio::test]
    async fn locates_output_file_across_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("abc123");
        std::fs::write(base.with_extension("webm"), b"data").unwrap();

        let found = locate_output_file(&base, VIDEO_EXTENSIONS).await.unwrap();
        assert_eq!(found.extension().unwrap(), "webm");

        let missing = dir.path().join("nothing");
        assert!(
            locate_output_file(&missing, VIDEO_EXTENSIONS)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn streamed_file_gets_prefixed_client_filename() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let path = dir.path().join(format!("{id}.webm"));
        std::fs::write(&path, b"data").unwrap();

        let response = stream_media_file(&path, "video", id).await.unwrap();
        let disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains(&format!("video_{id}.webm")));
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "video/webm");
    }

    #[test]
    fn truncates_long_errors_to_the_bound() {
        let long = "x".repeat(400);
        assert_eq!(
            truncate_chars(&long, RESPONSE_ERROR_LIMIT).chars().count(),
            RESPONSE_ERROR_LIMIT
        );

        let multibyte = "é".repeat(400);
        assert_eq!(
            truncate_chars(&multibyte, EXTRACTOR_ERROR_LIMIT)
                .chars()
                .count(),
            EXTRACTOR_ERROR_LIMIT
        );
    }

    #[test]
    fn stderr_collapses_to_last_nonempty_line() {
        let stderr = b"WARNING: something\n\nERROR: Video unavailable\n\n";
        let error = ExtractError::from_stderr(stderr);
        assert_eq!(error.kind, FailureKind::Unavailable);
        assert_eq!(error.message, "ERROR: Video unavailable");
    }

    #[test]
    fn description_is_truncated_with_ellipsis() {
        let long = "d".repeat(500);
        let summary = summarize_description(Some(&long));
        assert_eq!(summary.chars().count(), DESCRIPTION_LIMIT + 3);
        assert!(summary.ends_with("..."));
        assert_eq!(summarize_description(None), "");
    }

    #[test]
    fn counts_cookie_lines_ignoring_comments() {
        let contents = "# Netscape HTTP Cookie File\n\n.youtube.com\tTRUE\t/\tval\n# note\nsecond\n";
        assert_eq!(count_cookie_lines(contents), 2);
        assert_eq!(count_cookie_lines(""), 0);
    }

    #[test]
    fn user_agent_pool_is_pinnable() {
        assert_eq!(user_agent_at(0), USER_AGENTS[0]);
        assert_eq!(user_agent_at(USER_AGENTS.len()), USER_AGENTS[0]);
        for index in 0..USER_AGENTS.len() {
            assert!(user_agent_at(index).contains("Mozilla"));
        }
    }

    #[test]
    fn cookie_args_follow_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_path = dir.path().join("cookies.txt");

        let options = ExtractOptions {
            user_agent: user_agent_at(0),
            authenticated: false,
        };

        let args = options.common_args(&cookie_path);
        assert!(!args.iter().any(|arg| arg == "--cookies"));
        assert!(args.contains(&"--force-ipv4".to_string()));
        assert!(args.contains(&"--geo-bypass-country".to_string()));

        std::fs::write(&cookie_path, b"cookie\n").unwrap();
        let args = options.common_args(&cookie_path);
        let position = args.iter().position(|arg| arg == "--cookies").unwrap();
        assert_eq!(args[position + 1], cookie_path.display().to_string());
    }

    #[test]
    fn media_types_match_extensions() {
        assert_eq!(media_type_for_extension("webm"), "video/webm");
        assert_eq!(media_type_for_extension("MP4"), "video/mp4");
        assert_eq!(media_type_for_extension("mp3"), "audio/mpeg");
        assert_eq!(media_type_for_extension("xyz"), "application/octet-stream");
    }
}
