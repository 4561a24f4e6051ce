#![forbid(unsafe_code)]

//! `Extractor` backed by the yt-dlp CLI.
//!
//! Metadata comes from `--dump-single-json`; bytes come from `-f <id> -o -`,
//! one child per opened stream.

use std::{path::PathBuf, process::Stdio};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::extractor::{ByteStream, Extractor, RawFormat, Thumbnail, VideoDetails, VideoInfo};
use crate::process::{ChildStream, log_stderr};

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

/// Subset of the `--dump-single-json` payload. Everything is optional because
/// older or unusual videos omit fields freely.
#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    fulltitle: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailJson>,
    #[serde(default)]
    formats: Vec<FormatJson>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailJson {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FormatJson {
    format_id: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f64>,
    abr: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

impl InfoJson {
    fn into_video_info(self) -> VideoInfo {
        // yt-dlp already orders thumbnails from least to most preferred.
        let mut thumbnails: Vec<Thumbnail> = self
            .thumbnails
            .into_iter()
            .filter_map(|thumb| {
                let url = thumb.url.filter(|url| !url.trim().is_empty())?;
                Some(Thumbnail {
                    url,
                    width: thumb.width,
                    height: thumb.height,
                })
            })
            .collect();
        if thumbnails.is_empty()
            && let Some(url) = self.thumbnail.filter(|url| !url.trim().is_empty())
        {
            thumbnails.push(Thumbnail {
                url,
                width: None,
                height: None,
            });
        }

        VideoInfo {
            details: VideoDetails {
                title: self.title.or(self.fulltitle),
                thumbnails,
            },
            formats: self.formats.into_iter().map(FormatJson::into_raw).collect(),
        }
    }
}

fn has_codec(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.is_empty() && codec != "none")
}

impl FormatJson {
    fn into_raw(self) -> RawFormat {
        let has_video = has_codec(self.vcodec.as_deref());
        let has_audio = has_codec(self.acodec.as_deref());
        let quality_label = if has_video {
            self.height.map(|height| match self.fps {
                Some(fps) if fps > 30.0 => format!("{height}p{}", fps.round() as u32),
                _ => format!("{height}p"),
            })
        } else {
            None
        };
        let mime_type = self
            .ext
            .as_deref()
            .map(|ext| mime_for(ext, has_video));
        let content_length = self
            .filesize
            .or(self.filesize_approx)
            .filter(|size| *size > 0.0)
            .map(|size| size.round() as u64);

        RawFormat {
            itag: self.format_id.filter(|id| !id.trim().is_empty()),
            container: self.ext,
            mime_type,
            quality_label,
            audio_bitrate: self.abr.map(|abr| abr.round() as u32),
            has_audio,
            has_video,
            content_length,
        }
    }
}

fn mime_for(ext: &str, has_video: bool) -> String {
    if has_video {
        return format!("video/{ext}");
    }
    match ext {
        "m4a" | "mp4" => "audio/mp4".to_string(),
        "mp3" => "audio/mpeg".to_string(),
        other => format!("audio/{other}"),
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn get_info(&self, url: &str) -> Result<VideoInfo> {
        let output = Command::new(&self.binary)
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("launching {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                bail!("yt-dlp exited with {}", output.status);
            }
            bail!("{stderr}");
        }

        let info: InfoJson =
            serde_json::from_slice(&output.stdout).context("parsing yt-dlp metadata")?;
        Ok(info.into_video_info())
    }

    async fn open(&self, url: &str, format: &RawFormat) -> Result<ByteStream> {
        let itag = format
            .itag
            .as_deref()
            .ok_or_else(|| anyhow!("format has no identifier"))?;
        let mut child = Command::new(&self.binary)
            .arg("--quiet")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg("--no-part")
            .arg("-f")
            .arg(itag)
            .arg("-o")
            .arg("-")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("launching {}", self.binary.display()))?;

        let label = format!("yt-dlp {itag}");
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("yt-dlp stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, label.clone()));
        }
        tracing::debug!(itag, "opened upstream stream");
        Ok(Box::pin(ChildStream::new(label, child, stdout)))
    }
}
