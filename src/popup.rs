#![forbid(unsafe_code)]

//! Popup flow: fetch the format list from the backend, rank it, and hand the
//! chosen format to the host download manager.

use std::{cmp::Reverse, fmt, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

use crate::formats::{FormatDescriptor, FormatsResponse, quality_number};
use crate::host::{ConflictAction, DownloadId, DownloadRequest, HostApi};

const COMBINED_BONUS: u64 = 10_000;
const PROGRESS_STEP: u8 = 5;
const PROGRESS_TICK: Duration = Duration::from_millis(300);

/// Status line texts shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PopupStatus {
    #[default]
    Idle,
    DetectingTab,
    NoActiveTab,
    PasteUrl,
    FetchingFormats,
    Error(String),
    NoFormats,
    FetchFailed,
    PreparingDownload,
    DownloadFailed(String),
    Downloading,
}

impl fmt::Display for PopupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopupStatus::Idle => Ok(()),
            PopupStatus::DetectingTab => f.write_str("Detecting current tab URL..."),
            PopupStatus::NoActiveTab => f.write_str("No active tab URL"),
            PopupStatus::PasteUrl => f.write_str("Paste a YouTube URL"),
            PopupStatus::FetchingFormats => f.write_str("Fetching formats..."),
            PopupStatus::Error(message) => write!(f, "Error: {message}"),
            PopupStatus::NoFormats => f.write_str("No formats found"),
            PopupStatus::FetchFailed => f.write_str("Failed to fetch formats"),
            PopupStatus::PreparingDownload => f.write_str("Preparing download..."),
            PopupStatus::DownloadFailed(message) => write!(f, "Download failed: {message}"),
            PopupStatus::Downloading => f.write_str("Downloading..."),
        }
    }
}

#[derive(Debug, Error)]
pub enum PopupError {
    #[error("no video url given")]
    EmptyUrl,
    /// The backend answered with an error status.
    #[error("backend rejected the request: {0}")]
    Rejected(String),
    #[error("request failed: {0}")]
    Transport(String),
}

impl PopupError {
    pub fn status(&self) -> PopupStatus {
        match self {
            PopupError::EmptyUrl => PopupStatus::PasteUrl,
            PopupError::Rejected(message) => PopupStatus::Error(message.clone()),
            PopupError::Transport(_) => PopupStatus::FetchFailed,
        }
    }
}

/// The `url` query parameter the popup was opened with, if any.
pub fn seed_url(popup_url: &Url) -> Option<String> {
    popup_url
        .query_pairs()
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn format_score(format: &FormatDescriptor) -> u64 {
    let combined = if format.has_audio && format.has_video {
        COMBINED_BONUS
    } else {
        0
    };
    combined.saturating_add(quality_number(Some(
        format.quality_label.as_deref().unwrap_or("0"),
    )))
}

/// Highest score first: label digits plus a flat bonus for combined formats,
/// so `1080p60` (108060) still outranks a combined `360p` (10360). Equal
/// scores keep backend order.
pub fn rank_formats(mut formats: Vec<FormatDescriptor>) -> Vec<FormatDescriptor> {
    formats.sort_by_key(|format| Reverse(format_score(format)));
    formats
}

pub fn download_url(backend: &str, video_url: &str, itag: &str) -> String {
    let mut url = format!("{backend}/download?");
    url.push_str(
        &url::form_urlencoded::Serializer::new(String::new())
            .append_pair("url", video_url)
            .append_pair("itag", itag)
            .finish(),
    );
    url
}

pub fn suggested_filename(quality_label: Option<&str>, itag: &str, container: &str) -> String {
    let label = quality_label.filter(|label| !label.is_empty()).unwrap_or(itag);
    let label = label.split_whitespace().collect::<Vec<_>>().join("_");
    let container = if container.is_empty() { "mp4" } else { container };
    format!("video_{label}.{container}")
}

/// Blocking HTTP client for the backend's `/formats` endpoint.
#[derive(Clone)]
pub struct PopupClient {
    backend: String,
    agent: ureq::Agent,
}

impl PopupClient {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into().trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().build(),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub async fn fetch_formats(&self, video_url: &str) -> Result<FormatsResponse, PopupError> {
        let video_url = video_url.trim();
        if video_url.is_empty() {
            return Err(PopupError::EmptyUrl);
        }
        let mut endpoint = Url::parse(&format!("{}/formats", self.backend))
            .map_err(|err| PopupError::Transport(err.to_string()))?;
        endpoint.query_pairs_mut().append_pair("url", video_url);

        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || fetch_blocking(&agent, endpoint.as_str()))
            .await
            .map_err(|err| PopupError::Transport(err.to_string()))?
    }
}

fn fetch_blocking(agent: &ureq::Agent, endpoint: &str) -> Result<FormatsResponse, PopupError> {
    match agent.get(endpoint).call() {
        Ok(response) => response
            .into_json::<FormatsResponse>()
            .map_err(|err| PopupError::Transport(err.to_string())),
        Err(ureq::Error::Status(_, response)) => {
            let status_text = response.status_text().to_string();
            let message = match response.into_json::<Value>() {
                Ok(body) => body
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|error| !error.is_empty())
                    .map(str::to_string)
                    .unwrap_or(status_text),
                Err(_) => "unknown".to_string(),
            };
            Err(PopupError::Rejected(message))
        }
        Err(err) => Err(PopupError::Transport(err.to_string())),
    }
}

/// Submits the download to the host. The save dialog is requested so the
/// user can rename the file.
pub async fn start_download<H: HostApi + ?Sized>(
    host: &H,
    backend: &str,
    video_url: &str,
    format: &FormatDescriptor,
) -> Result<DownloadId, PopupStatus> {
    let request = DownloadRequest {
        url: download_url(backend, video_url, &format.itag),
        filename: Some(suggested_filename(
            format.quality_label.as_deref(),
            &format.itag,
            &format.container,
        )),
        conflict_action: ConflictAction::Uniquify,
        save_as: true,
    };
    host.download(request)
        .await
        .map_err(|err| PopupStatus::DownloadFailed(err.to_string()))
}

/// Cosmetic progress: +5% every 300ms until 100%. Not tied to bytes.
pub async fn simulate_progress(progress: &watch::Sender<u8>) {
    let mut percent = 0u8;
    let mut ticker = tokio::time::interval(PROGRESS_TICK);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        percent = percent.saturating_add(PROGRESS_STEP).min(100);
        progress.send_replace(percent);
        if percent == 100 {
            break;
        }
    }
}

/// Popup state: the URL field, the status line, the ranked list and the
/// progress bar.
pub struct Popup<H> {
    client: PopupClient,
    host: H,
    url: String,
    status: PopupStatus,
    title: Option<String>,
    thumbnail: Option<String>,
    formats: Vec<FormatDescriptor>,
    progress: watch::Sender<u8>,
}

impl<H: HostApi> Popup<H> {
    pub fn new(client: PopupClient, host: H) -> Self {
        Self {
            client,
            host,
            url: String::new(),
            status: PopupStatus::Idle,
            title: None,
            thumbnail: None,
            formats: Vec::new(),
            progress: watch::Sender::new(0),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn status(&self) -> &PopupStatus {
        &self.status
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }

    pub fn formats(&self) -> &[FormatDescriptor] {
        &self.formats
    }

    pub fn progress(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }

    /// Opening the popup with `?url=` fills the field and fetches at once.
    pub async fn open(&mut self, popup_url: &Url) {
        if let Some(url) = seed_url(popup_url) {
            self.url = url;
            self.fetch().await;
        }
    }

    pub fn detect_tab(&mut self, active_tab_url: Option<&str>) {
        self.status = PopupStatus::DetectingTab;
        match active_tab_url.filter(|url| !url.is_empty()) {
            Some(url) => {
                self.url = url.to_string();
                self.status = PopupStatus::Idle;
            }
            None => self.status = PopupStatus::NoActiveTab,
        }
    }

    pub async fn fetch(&mut self) {
        if self.url.trim().is_empty() {
            self.status = PopupStatus::PasteUrl;
            return;
        }
        self.status = PopupStatus::FetchingFormats;
        self.formats.clear();
        self.title = None;
        self.thumbnail = None;
        self.progress.send_replace(0);

        match self.client.fetch_formats(&self.url).await {
            Ok(response) => {
                self.title = response.title;
                self.thumbnail = response.thumbnail;
                self.formats = rank_formats(response.formats);
                self.status = if self.formats.is_empty() {
                    PopupStatus::NoFormats
                } else {
                    PopupStatus::Idle
                };
            }
            Err(err) => {
                tracing::warn!("fetching formats failed: {err}");
                self.status = err.status();
            }
        }
    }

    /// Starts the download of a listed format and runs the progress bar.
    /// The rest of the list is hidden once a choice is made.
    pub async fn download(&mut self, itag: &str) -> Option<DownloadId> {
        let index = self.formats.iter().position(|format| format.itag == itag)?;
        let format = self.formats.swap_remove(index);
        self.formats.clear();

        self.status = PopupStatus::PreparingDownload;
        self.progress.send_replace(0);
        let video_url = self.url.trim().to_string();
        match start_download(&self.host, self.client.backend(), &video_url, &format).await {
            Ok(id) => {
                self.status = PopupStatus::Downloading;
                simulate_progress(&self.progress).await;
                Some(id)
            }
            Err(status) => {
                self.status = status;
                None
            }
        }
    }
}
