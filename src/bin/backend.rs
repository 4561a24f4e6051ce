#![forbid(unsafe_code)]

//! Axum backend that lists the formats of a video and streams one of them.
//!
//! The backend is stateless: every request resolves metadata again, and a
//! download that needs both tracks gets its own ffmpeg process. Nothing is
//! shared between requests except the extractor and encoder handles.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use grabtube::config::{RuntimeOverrides, resolve_runtime_settings};
use grabtube::encoder::{Encoder, Ffmpeg};
use grabtube::extractor::{ByteStream, Extractor, RawFormat};
use grabtube::formats::{
    DownloadPlan, FormatsResponse, PlanError, attachment_filename, plan_download, resolve_formats,
};
use grabtube::telemetry;
use grabtube::ytdlp::YtDlp;
use serde::Deserialize;
use tokio::signal;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const LIVENESS_TEXT: &str = "grabtube backend running";
const MERGED_CONTENT_TYPE: &str = "video/mp4";

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serve video formats and streamed downloads")]
struct BackendArgs {
    /// Address to bind (overrides GRABTUBE_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Port to bind (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
    /// yt-dlp executable (overrides YTDLP_BIN).
    #[arg(long)]
    ytdlp: Option<PathBuf>,
    /// ffmpeg executable (overrides FFMPEG_BIN).
    #[arg(long)]
    ffmpeg: Option<PathBuf>,
    /// dotenv file to read settings from.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            ytdlp_bin: self.ytdlp,
            ffmpeg_bin: self.ffmpeg,
            env_path: self.env_file,
            ..RuntimeOverrides::default()
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/GRABTUBE_HOST")
}

/// Shared state injected into every handler. Both handles are immutable.
#[derive(Clone)]
struct AppState {
    extractor: Arc<dyn Extractor>,
    encoder: Arc<dyn Encoder>,
}

/// Error body returned by every handler as `{"error": .., "details": ..}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches the underlying failure, shown under `details`.
    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = serde_json::Value::String(details);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Logs a download failure and turns it into the generic 500 response.
fn server_error(err: anyhow::Error) -> ApiError {
    tracing::error!("download error: {err:#}");
    ApiError::internal("Server error").with_details(err.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let settings = resolve_runtime_settings(BackendArgs::parse().into_overrides())?;
    let host = parse_host_arg(&settings.host)?;

    let state = AppState {
        extractor: Arc::new(YtDlp::new(settings.ytdlp_bin)),
        encoder: Arc::new(Ffmpeg::new(settings.ffmpeg_bin)),
    };

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!("backend listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running backend")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/formats", get(list_formats))
        .route("/download", get(download))
        .layer(TraceLayer::new_for_http())
        // The popup fetches from an extension origin.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!("failed to install Ctrl+C handler: {err}");
    }
}

async fn liveness() -> &'static str {
    LIVENESS_TEXT
}

#[derive(Debug, Default, Deserialize)]
struct FormatsQuery {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    itag: Option<String>,
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

/// `GET /formats?url=..`: title, best thumbnail and the deduplicated format
/// list of a video.
async fn list_formats(
    State(state): State<AppState>,
    Query(query): Query<FormatsQuery>,
) -> ApiResult<Json<FormatsResponse>> {
    let url = required(query.url).ok_or_else(|| ApiError::bad_request("Missing url param"))?;
    if !state.extractor.validate(&url) {
        return Err(ApiError::bad_request("Invalid YouTube URL"));
    }

    let info = state.extractor.get_info(&url).await.map_err(|err| {
        tracing::error!(url, "formats error: {err:#}");
        ApiError::internal("Failed to fetch formats").with_details(err.to_string())
    })?;
    Ok(Json(resolve_formats(&info)))
}

/// `GET /download?url=..&itag=..`: streams the chosen format as an
/// attachment. Formats missing a track are merged with the best companion
/// track through the encoder.
async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let (Some(url), Some(itag)) = (required(query.url), required(query.itag)) else {
        return Err(ApiError::bad_request("Missing url or itag"));
    };
    if !state.extractor.validate(&url) {
        return Err(ApiError::bad_request("Invalid YouTube URL"));
    }

    let info = state.extractor.get_info(&url).await.map_err(server_error)?;
    let plan = plan_download(&info, &itag).map_err(|err| match err {
        PlanError::FormatNotFound => ApiError::bad_request(err.to_string()),
        PlanError::MissingCompanion(_) => {
            tracing::error!(itag, "download error: {err}");
            ApiError::internal("Server error").with_details(err.to_string())
        }
    })?;
    let filename = attachment_filename(info.details.title.as_deref());

    match plan {
        DownloadPlan::Direct(format) => {
            let stream = state
                .extractor
                .open(&url, &format)
                .await
                .map_err(server_error)?;
            tracing::info!(itag, "streaming combined format");
            Ok(attachment(&filename, &content_type_for(&format), stream_body(stream)))
        }
        DownloadPlan::Merge { video, audio } => {
            let video_stream = state
                .extractor
                .open(&url, &video)
                .await
                .map_err(server_error)?;
            let audio_stream = state
                .extractor
                .open(&url, &audio)
                .await
                .map_err(server_error)?;
            tracing::info!(
                video = video.itag.as_deref(),
                audio = audio.itag.as_deref(),
                "merging tracks"
            );

            let body = match state.encoder.merge(video_stream, audio_stream).await {
                Ok(merged) => stream_body(merged),
                Err(err) => {
                    // Headers are committed to the attachment already; the
                    // client just sees an empty file.
                    tracing::error!("encoder launch failed: {err:#}");
                    Body::empty()
                }
            };
            Ok(attachment(&filename, MERGED_CONTENT_TYPE, body))
        }
    }
}

/// When the client goes away the body is dropped, which drops the stream and
/// everything feeding it.
fn stream_body(stream: ByteStream) -> Body {
    Body::from_stream(ReaderStream::new(stream))
}

/// Declared MIME type of a format, else a guess from its container, else mp4.
fn content_type_for(format: &RawFormat) -> String {
    format
        .mime_type
        .clone()
        .filter(|mime| !mime.trim().is_empty())
        .or_else(|| {
            format
                .container
                .as_deref()
                .and_then(|ext| mime_guess::from_ext(ext).first())
                .map(|mime| mime.to_string())
        })
        .unwrap_or_else(|| MERGED_CONTENT_TYPE.to_string())
}

/// Wraps a body with `Content-Disposition: attachment` and the given content
/// type. An unrepresentable filename drops the disposition header.
fn attachment(filename: &str, content_type: &str, body: Body) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    let disposition = format!("attachment; filename=\"{filename}\"");
    match HeaderValue::from_bytes(disposition.as_bytes()) {
        Ok(value) => {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        Err(err) => tracing::warn!("unusable attachment filename {filename:?}: {err}"),
    }
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    response
}
