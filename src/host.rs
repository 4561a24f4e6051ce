#![forbid(unsafe_code)]

//! Host download manager and window API.
//!
//! The extension side never writes files itself: it hands a job to the host
//! and gets an id back. `LocalDownloads` is the host used by the CLI; it saves
//! into a directory and transfers on blocking workers.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;

pub type DownloadId = u64;

const FALLBACK_FILENAME: &str = "download";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    #[default]
    Uniquify,
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    pub filename: Option<String>,
    #[serde(default)]
    pub conflict_action: ConflictAction,
    #[serde(default)]
    pub save_as: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Normal,
    Popup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: WindowKind,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Asynchronous face of the browser's download and window APIs. Each call
/// resolves once, with either a result or the error the host reported.
#[async_trait]
pub trait HostApi: Send + Sync {
    async fn download(&self, request: DownloadRequest) -> Result<DownloadId, HostError>;
    async fn open_window(&self, spec: WindowSpec) -> Result<(), HostError>;
}

/// Final state of one transfer started by [`LocalDownloads`].
#[derive(Debug)]
pub struct DownloadOutcome {
    pub id: DownloadId,
    pub path: PathBuf,
    /// Bytes written, or the reason the transfer was interrupted.
    pub result: Result<u64, String>,
}

pub struct LocalDownloads {
    dir: PathBuf,
    agent: ureq::Agent,
    next_id: AtomicU64,
    transfers: Mutex<Vec<JoinHandle<DownloadOutcome>>>,
}

impl LocalDownloads {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            agent: ureq::AgentBuilder::new().build(),
            next_id: AtomicU64::new(1),
            transfers: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Waits for every transfer started so far.
    pub async fn wait_all(&self) -> Vec<DownloadOutcome> {
        let handles = std::mem::take(&mut *self.transfers.lock());
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::warn!("download worker failed: {err}"),
            }
        }
        outcomes
    }
}

#[async_trait]
impl HostApi for LocalDownloads {
    async fn download(&self, request: DownloadRequest) -> Result<DownloadId, HostError> {
        let url = Url::parse(&request.url)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .ok_or_else(|| HostError::InvalidUrl(request.url.clone()))?;
        let relative = match request.filename.as_deref().filter(|name| !name.is_empty()) {
            Some(name) => checked_relative(name)?,
            None => PathBuf::from(filename_from_url(&url)),
        };
        if request.save_as {
            tracing::debug!("no save dialog available; saving directly");
        }

        let target = self.dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (path, file) = reserve(&target, request.conflict_action)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::info!(id, path = %path.display(), "download started");

        let agent = self.agent.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let result = transfer(&agent, url.as_str(), file).map_err(|err| err.to_string());
            match &result {
                Ok(bytes) => tracing::info!(id, bytes, "download complete"),
                Err(err) => {
                    tracing::warn!(id, "download interrupted: {err}");
                    if let Err(remove_err) = std::fs::remove_file(&path) {
                        tracing::debug!("could not remove {}: {remove_err}", path.display());
                    }
                }
            }
            DownloadOutcome { id, path, result }
        });
        self.transfers.lock().push(handle);
        Ok(id)
    }

    async fn open_window(&self, spec: WindowSpec) -> Result<(), HostError> {
        tracing::info!(
            width = spec.width,
            height = spec.height,
            "open {:?} window: {}",
            spec.kind,
            spec.url
        );
        Ok(())
    }
}

fn transfer(agent: &ureq::Agent, url: &str, file: File) -> anyhow::Result<u64> {
    let response = agent.get(url).call()?;
    let mut reader = response.into_reader();
    let mut writer = BufWriter::new(file);
    let bytes = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(bytes)
}

/// Download names are relative to the download directory and may not climb
/// out of it.
fn checked_relative(name: &str) -> Result<PathBuf, HostError> {
    let path = Path::new(name);
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));
    if escapes || path.file_name().is_none() {
        return Err(HostError::InvalidFilename(name.to_string()));
    }
    Ok(path.to_path_buf())
}

fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

/// Creates the target file, picking `name (N).ext` while the name is taken
/// when uniquifying.
fn reserve(target: &Path, action: ConflictAction) -> io::Result<(PathBuf, File)> {
    if action == ConflictAction::Overwrite {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(target)?;
        return Ok((target.to_path_buf(), file));
    }

    let mut attempt = 0u32;
    loop {
        let candidate = if attempt == 0 {
            target.to_path_buf()
        } else {
            numbered(target, attempt)
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}

fn numbered(target: &Path, n: u32) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match target.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    target.with_file_name(name)
}
