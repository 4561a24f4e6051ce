#![forbid(unsafe_code)]

//! Format listing and the fallback policy used when a chosen format lacks
//! one of the two tracks.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extractor::{RawFormat, VideoInfo};

const MAX_TITLE_CHARS: usize = 200;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One entry of the `/formats` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    #[serde(alias = "id")]
    pub itag: String,
    pub container: String,
    pub quality_label: Option<String>,
    pub has_audio: bool,
    pub has_video: bool,
    pub approx_size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatsResponse {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub formats: Vec<FormatDescriptor>,
}

/// Lists downloadable formats in upstream order, one entry per itag.
pub fn resolve_formats(info: &VideoInfo) -> FormatsResponse {
    let mut seen = HashSet::new();
    let formats = info
        .formats
        .iter()
        .filter_map(describe)
        .filter(|format| seen.insert(format.itag.clone()))
        .collect();

    FormatsResponse {
        title: info.details.title.clone(),
        thumbnail: info
            .details
            .thumbnails
            .last()
            .map(|thumb| thumb.url.clone()),
        formats,
    }
}

fn describe(format: &RawFormat) -> Option<FormatDescriptor> {
    if !(format.has_audio || format.has_video) {
        return None;
    }
    let itag = format.itag.as_deref().filter(|itag| !itag.is_empty())?;
    let container = non_empty(format.container.as_deref());
    let mime_type = non_empty(format.mime_type.as_deref());
    if container.is_none() && mime_type.is_none() {
        return None;
    }

    let container = container
        .or_else(|| mime_subtype(mime_type?))
        .unwrap_or("mp4")
        .to_string();
    let quality_label = non_empty(format.quality_label.as_deref())
        .map(str::to_string)
        .or_else(|| {
            format
                .audio_bitrate
                .filter(|bitrate| *bitrate > 0)
                .map(|bitrate| format!("{bitrate}kbps"))
        });
    let approx_size = format
        .content_length
        .filter(|length| *length > 0)
        .map(|length| format!("{} MB", (length as f64 / BYTES_PER_MB).round() as u64))
        .unwrap_or_else(|| "N/A".to_string());

    Some(FormatDescriptor {
        itag: itag.to_string(),
        container,
        quality_label,
        has_audio: format.has_audio,
        has_video: format.has_video,
        approx_size,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

/// `video/webm; codecs="vp9"` -> `webm`.
fn mime_subtype(mime: &str) -> Option<&str> {
    let (_, rest) = mime.split_once('/')?;
    let subtype = rest.split(';').next().unwrap_or(rest).trim();
    (!subtype.is_empty()).then_some(subtype)
}

/// Numeric reading of a quality label: every non-digit is dropped and the
/// rest parsed, so `1080p60` reads as `108060`. Labels without digits read as
/// zero.
pub fn quality_number(label: Option<&str>) -> u64 {
    let digits: String = label
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        return 0;
    }
    digits.parse().unwrap_or(u64::MAX)
}

/// First element with the greatest key; later elements must be strictly
/// greater to replace it.
fn first_max_by_key<'a, I, F>(items: I, key: F) -> Option<&'a RawFormat>
where
    I: IntoIterator<Item = &'a RawFormat>,
    F: Fn(&RawFormat) -> u64,
{
    let mut best: Option<(&RawFormat, u64)> = None;
    for item in items {
        let score = key(item);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((item, score)),
        }
    }
    best.map(|(item, _)| item)
}

/// Highest-bitrate audio-only format.
pub fn best_audio(formats: &[RawFormat]) -> Option<&RawFormat> {
    first_max_by_key(
        formats.iter().filter(|f| f.has_audio && !f.has_video),
        |f| u64::from(f.audio_bitrate.unwrap_or(0)),
    )
}

/// Video-only format with the largest [`quality_number`].
pub fn best_video(formats: &[RawFormat]) -> Option<&RawFormat> {
    first_max_by_key(
        formats.iter().filter(|f| f.has_video && !f.has_audio),
        |f| quality_number(f.quality_label.as_deref()),
    )
}

pub fn find_format<'a>(formats: &'a [RawFormat], itag: &str) -> Option<&'a RawFormat> {
    formats
        .iter()
        .find(|format| format.itag.as_deref() == Some(itag))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Audio,
    Video,
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Track::Audio => f.write_str("audio"),
            Track::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadPlan {
    /// The format already carries audio and video.
    Direct(RawFormat),
    Merge { video: RawFormat, audio: RawFormat },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Format not found")]
    FormatNotFound,
    #[error("No {0} track available to merge with")]
    MissingCompanion(Track),
}

pub fn plan_download(info: &VideoInfo, itag: &str) -> Result<DownloadPlan, PlanError> {
    // Trackless entries (storyboards) are never listed, so they are not found.
    let chosen = find_format(&info.formats, itag)
        .filter(|format| format.has_audio || format.has_video)
        .ok_or(PlanError::FormatNotFound)?;
    if chosen.has_audio && chosen.has_video {
        return Ok(DownloadPlan::Direct(chosen.clone()));
    }

    let video = if chosen.has_video {
        chosen
    } else {
        best_video(&info.formats).ok_or(PlanError::MissingCompanion(Track::Video))?
    };
    let audio = if chosen.has_audio {
        chosen
    } else {
        best_audio(&info.formats).ok_or(PlanError::MissingCompanion(Track::Audio))?
    };

    Ok(DownloadPlan::Merge {
        video: video.clone(),
        audio: audio.clone(),
    })
}

/// `<title>.mp4` with path separators, reserved characters and control
/// characters replaced by `_`.
pub fn attachment_filename(title: Option<&str>) -> String {
    let title = title.filter(|title| !title.is_empty()).unwrap_or("video");
    let safe: String = title
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_TITLE_CHARS)
        .collect();
    format!("{safe}.mp4")
}
