#![forbid(unsafe_code)]

//! The extraction collaborator: URL validation, video metadata, and byte
//! streams for a single format.
//!
//! Everything here is per request. Nothing is cached between calls; the
//! backend re-resolves metadata for every `/formats` and `/download` hit.

use std::{pin::Pin, sync::LazyLock};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use url::Url;

/// Owned, type-erased byte source. Dropping it must release whatever feeds it
/// (child processes, sockets), which is what lets a client disconnect tear
/// down a whole download.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

const QUERY_DOMAINS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "gaming.youtube.com",
];
const PATH_DOMAINS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
];
const PATH_PREFIXES: &[&str] = &["embed", "v", "shorts", "live"];
const SHORT_LINK_DOMAIN: &str = "youtu.be";
const VIDEO_ID_LEN: usize = 11;

static VIDEO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("video id pattern compiles"));

/// Extracts the 11-character video id from any supported URL shape.
pub fn video_id(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();

    let mut candidate = None;
    if QUERY_DOMAINS.contains(&host.as_str()) {
        candidate = parsed
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned());
    }
    if candidate.is_none() {
        let mut segments = parsed.path_segments()?.filter(|segment| !segment.is_empty());
        if host == SHORT_LINK_DOMAIN {
            candidate = segments.next().map(str::to_string);
        } else if PATH_DOMAINS.contains(&host.as_str()) {
            let prefix = segments.next()?;
            if PATH_PREFIXES.contains(&prefix) {
                candidate = segments.next().map(str::to_string);
            }
        }
    }

    // Ids are cut to 11 characters before validation; trailing junk is ignored.
    candidate
        .map(|id| id.chars().take(VIDEO_ID_LEN).collect::<String>())
        .filter(|id| VIDEO_ID.is_match(id))
}

pub fn is_valid_video_url(raw: &str) -> bool {
    video_id(raw).is_some()
}

/// One rendition as reported by the extractor, before any filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFormat {
    pub itag: Option<String>,
    pub container: Option<String>,
    pub mime_type: Option<String>,
    pub quality_label: Option<String>,
    pub audio_bitrate: Option<u32>,
    pub has_audio: bool,
    pub has_video: bool,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoDetails {
    pub title: Option<String>,
    /// Ordered smallest to largest.
    pub thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub details: VideoDetails,
    pub formats: Vec<RawFormat>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Cheap syntactic check; never touches the network.
    fn validate(&self, url: &str) -> bool {
        is_valid_video_url(url)
    }

    async fn get_info(&self, url: &str) -> Result<VideoInfo>;

    /// Opens the bytes of `format`. The stream stops producing (and its
    /// upstream is torn down) as soon as it is dropped.
    async fn open(&self, url: &str, format: &RawFormat) -> Result<ByteStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_watch_urls() {
        assert_eq!(
            video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert!(is_valid_video_url(
            "https://m.youtube.com/watch?feature=share&v=dQw4w9WgXcQ"
        ));
        assert!(is_valid_video_url(
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ&list=RD"
        ));
    }

    #[test]
    fn accepts_path_shapes() {
        for url in [
            "https://youtu.be/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ?start=3",
            "https://youtube.com/live/dQw4w9WgXcQ",
            "http://www.youtube-nocookie.com/embed/dQw4w9WgXcQ",
        ] {
            assert_eq!(video_id(url).as_deref(), Some("dQw4w9WgXcQ"), "{url}");
        }
    }

    #[test]
    fn long_ids_are_cut_to_eleven_characters() {
        assert_eq!(
            video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQXYZ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            video_id("https://youtu.be/dQw4w9WgXcQ-extra").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert!(!is_valid_video_url("https://www.youtube.com/watch?v=dQw4w9W$cQXYZ"));
    }

    #[test]
    fn rejects_other_hosts_and_bad_ids() {
        for url in [
            "",
            "not a url",
            "ftp://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://vimeo.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/watch?v=abc123",
            "https://www.youtube.com/channel/UCabcdefghij",
            "https://youtu.be/",
            "https://gaming.youtube.com/embed/dQw4w9WgXcQ",
        ] {
            assert!(!is_valid_video_url(url), "{url}");
        }
    }
}
