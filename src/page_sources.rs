#![forbid(unsafe_code)]

//! Media source detection on a loaded page.
//!
//! Reads the document only. Element URLs are resolved the way the DOM
//! resolves `src`; meta content is taken verbatim.

use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::relay::ExtensionMessage;

pub const GET_VIDEO_SOURCES: &str = "GET_VIDEO_SOURCES";

static VIDEO: LazyLock<Selector> = LazyLock::new(|| selector("video"));
static SOURCE: LazyLock<Selector> = LazyLock::new(|| selector("source"));
static BASE: LazyLock<Selector> = LazyLock::new(|| selector("base[href]"));
static OG_VIDEO_PROPERTY: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"meta[property="og:video"]"#));
static OG_VIDEO_NAME: LazyLock<Selector> = LazyLock::new(|| selector(r#"meta[name="og:video"]"#));
static TWITTER_STREAM: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"meta[name="twitter:player:stream"]"#));
static CONTENT_URL: LazyLock<Selector> = LazyLock::new(|| selector(r#"[itemprop="contentUrl"]"#));
static BUTTON_ANCHOR: LazyLock<Selector> = LazyLock::new(|| selector("#above-the-fold #title"));
static BUTTON: LazyLock<Selector> = LazyLock::new(|| selector(&format!("#{DOWNLOAD_BUTTON_ID}")));

static HTTP_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^https?://").expect("http url pattern compiles"));

pub const DOWNLOAD_BUTTON_ID: &str = "yt-download-btn";

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector parses")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSource {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
}

impl VideoSource {
    fn new(url: String, kind: &str, label: &str) -> Self {
        Self {
            url,
            kind: kind.to_string(),
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcesResponse {
    pub ok: bool,
    pub sources: Vec<VideoSource>,
}

/// Lists candidate media URLs in document order: each `<video>`'s current
/// source and its `<source>` children, then the first `og:video`,
/// `twitter:player:stream` and `itemprop=contentUrl` entries. Only http(s)
/// URLs survive, first occurrence wins.
pub fn find_video_sources(html: &str, page_url: Option<&Url>) -> Vec<VideoSource> {
    let document = Html::parse_document(html);
    let base = document_base(&document, page_url);
    let mut found = Vec::new();

    for video in document.select(&VIDEO) {
        if let Some(url) = current_src(video, base.as_ref()) {
            found.push(VideoSource::new(url, "video", "video.currentSrc"));
        }
        for source in video.select(&SOURCE) {
            if let Some(url) = element_url(source, "src", base.as_ref()) {
                let kind = non_empty_attr(source, "type").unwrap_or("video");
                found.push(VideoSource::new(url, kind, "source tag"));
            }
        }
    }

    let og_video = document
        .select(&OG_VIDEO_PROPERTY)
        .next()
        .or_else(|| document.select(&OG_VIDEO_NAME).next());
    if let Some(content) = og_video.and_then(meta_content) {
        found.push(VideoSource::new(content, "og:video", "meta og:video"));
    }
    if let Some(content) = document.select(&TWITTER_STREAM).next().and_then(meta_content) {
        found.push(VideoSource::new(content, "twitter", "twitter:stream"));
    }
    if let Some(content) = document.select(&CONTENT_URL).next().and_then(meta_content) {
        found.push(VideoSource::new(content, "itemprop", "itemprop contentUrl"));
    }

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|source| HTTP_URL.is_match(&source.url))
        .filter(|source| seen.insert(source.url.clone()))
        .collect()
}

/// A `<base href>` rebases relative element URLs.
fn document_base(document: &Html, page_url: Option<&Url>) -> Option<Url> {
    let href = document
        .select(&BASE)
        .next()
        .and_then(|base| non_empty_attr(base, "href"));
    match (href, page_url) {
        (Some(href), Some(page)) => page.join(href).ok().or_else(|| Some(page.clone())),
        (Some(href), None) => Url::parse(href).ok(),
        (None, page) => page.cloned(),
    }
}

fn non_empty_attr<'a>(element: ElementRef<'a>, name: &str) -> Option<&'a str> {
    element
        .value()
        .attr(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn element_url(element: ElementRef<'_>, name: &str, base: Option<&Url>) -> Option<String> {
    let raw = non_empty_attr(element, name)?;
    let resolved = match base {
        Some(base) => base.join(raw),
        None => Url::parse(raw),
    };
    resolved.ok().map(String::from)
}

/// Static stand-in for `currentSrc`: the `src` attribute, else the first
/// `<source>` child with a `src`.
fn current_src(video: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
    element_url(video, "src", base).or_else(|| {
        video
            .select(&SOURCE)
            .find_map(|source| element_url(source, "src", base))
    })
}

/// Only `<meta>` carries a `content` property; other elements are skipped.
fn meta_content(element: ElementRef<'_>) -> Option<String> {
    if element.value().name() != "meta" {
        return None;
    }
    element
        .value()
        .attr("content")
        .filter(|content| !content.is_empty())
        .map(str::to_string)
}

/// Page-side message handler for one loaded document.
pub struct ContentScript {
    html: String,
    page_url: Option<Url>,
}

impl ContentScript {
    pub fn new(html: impl Into<String>, page_url: Option<Url>) -> Self {
        Self {
            html: html.into(),
            page_url,
        }
    }

    /// Answers source queries; every other message is left for other
    /// listeners.
    pub fn handle(&self, message: &ExtensionMessage) -> Option<SourcesResponse> {
        match message {
            ExtensionMessage::GetVideoSources => Some(SourcesResponse {
                ok: true,
                sources: find_video_sources(&self.html, self.page_url.as_ref()),
            }),
            _ => None,
        }
    }

    /// Whether the page has the title anchor for the download button and no
    /// button yet.
    pub fn wants_download_button(&self) -> bool {
        let document = Html::parse_document(&self.html);
        document.select(&BUTTON_ANCHOR).next().is_some() && document.select(&BUTTON).next().is_none()
    }

    /// Message sent when the injected button is clicked.
    pub fn download_button_message(&self) -> Option<ExtensionMessage> {
        self.page_url
            .as_ref()
            .map(|page| open_formats_request(page.as_str()))
    }
}

pub fn open_formats_request(page_url: &str) -> ExtensionMessage {
    ExtensionMessage::OpenFormatsWindow {
        url: page_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("https://media.example.com/watch/42").unwrap()
    }

    #[test]
    fn finds_video_and_source_tags() {
        let html = r#"
            <html><body>
              <video src="/media/clip.mp4">
                <source src="https://cdn.example.com/clip.webm" type="video/webm">
                <source src="clip-low.mp4">
              </video>
            </body></html>
        "#;
        let sources = find_video_sources(html, Some(&page()));
        assert_eq!(
            sources,
            vec![
                VideoSource::new(
                    "https://media.example.com/media/clip.mp4".into(),
                    "video",
                    "video.currentSrc"
                ),
                VideoSource::new(
                    "https://cdn.example.com/clip.webm".into(),
                    "video/webm",
                    "source tag"
                ),
                VideoSource::new(
                    "https://media.example.com/watch/clip-low.mp4".into(),
                    "video",
                    "source tag"
                ),
            ]
        );
    }

    #[test]
    fn first_source_child_stands_in_for_current_src() {
        let html = r#"
            <video>
              <source src="/hd.webm" type="video/webm">
              <source src="/sd.mp4" type="video/mp4">
            </video>
        "#;
        let sources = find_video_sources(html, Some(&page()));
        assert_eq!(
            sources,
            vec![
                VideoSource::new(
                    "https://media.example.com/hd.webm".into(),
                    "video",
                    "video.currentSrc"
                ),
                VideoSource::new(
                    "https://media.example.com/sd.mp4".into(),
                    "video/mp4",
                    "source tag"
                ),
            ]
        );
    }

    #[test]
    fn duplicate_video_sources_collapse() {
        let html = r#"
            <video src="https://cdn.example.com/a.mp4"></video>
            <video src="//cdn.example.com/a.mp4"></video>
        "#;
        let sources = find_video_sources(html, Some(&page()));
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].url, "https://cdn.example.com/a.mp4");
    }

    #[test]
    fn reads_first_meta_of_each_kind() {
        let html = r#"
            <head>
              <meta name="og:video" content="https://cdn.example.com/by-name.mp4">
              <meta property="og:video" content="https://cdn.example.com/og.mp4">
              <meta property="og:video" content="https://cdn.example.com/og-second.mp4">
              <meta name="twitter:player:stream" content="https://cdn.example.com/tw.mp4">
              <meta itemprop="contentUrl" content="https://cdn.example.com/schema.mp4">
            </head>
        "#;
        let sources = find_video_sources(html, None);
        let summary: Vec<_> = sources
            .iter()
            .map(|s| (s.url.as_str(), s.kind.as_str(), s.label.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("https://cdn.example.com/og.mp4", "og:video", "meta og:video"),
                ("https://cdn.example.com/tw.mp4", "twitter", "twitter:stream"),
                (
                    "https://cdn.example.com/schema.mp4",
                    "itemprop",
                    "itemprop contentUrl"
                ),
            ]
        );
    }

    #[test]
    fn og_video_name_is_a_fallback() {
        let html = r#"<meta name="og:video" content="https://cdn.example.com/by-name.mp4">"#;
        let sources = find_video_sources(html, None);
        assert_eq!(sources[0].url, "https://cdn.example.com/by-name.mp4");
    }

    #[test]
    fn drops_non_http_sources() {
        let html = r#"
            <video src="blob:https://media.example.com/1234"></video>
            <video><source src="data:video/mp4;base64,AAAA"></video>
            <meta property="og:video" content="/relative/og.mp4">
            <link itemprop="contentUrl" href="https://cdn.example.com/ignored.mp4">
        "#;
        assert!(find_video_sources(html, Some(&page())).is_empty());
    }

    #[test]
    fn base_element_rebases_relative_urls() {
        let html = r#"
            <head><base href="https://static.example.org/v/"></head>
            <video src="movie.mp4"></video>
        "#;
        let sources = find_video_sources(html, Some(&page()));
        assert_eq!(sources[0].url, "https://static.example.org/v/movie.mp4");
    }

    #[test]
    fn content_script_answers_source_queries_only() {
        let script = ContentScript::new(
            r#"<video src="https://cdn.example.com/a.mp4"></video>"#,
            Some(page()),
        );
        let response = script.handle(&ExtensionMessage::GetVideoSources).unwrap();
        assert!(response.ok);
        assert_eq!(response.sources.len(), 1);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({
                "ok": true,
                "sources": [{"url": "https://cdn.example.com/a.mp4", "type": "video", "label": "video.currentSrc"}]
            })
        );

        assert!(
            script
                .handle(&open_formats_request("https://www.youtube.com/watch?v=dQw4w9WgXcQ"))
                .is_none()
        );
    }

    #[test]
    fn download_button_targets_title_once() {
        let page_url = Url::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        let bare = ContentScript::new(
            r#"<div id="above-the-fold"><h1 id="title">Clip</h1></div>"#,
            Some(page_url.clone()),
        );
        assert!(bare.wants_download_button());
        assert_eq!(
            bare.download_button_message(),
            Some(ExtensionMessage::OpenFormatsWindow {
                url: page_url.to_string()
            })
        );

        let injected = ContentScript::new(
            r#"<div id="above-the-fold"><h1 id="title">Clip<button id="yt-download-btn"></button></h1></div>"#,
            None,
        );
        assert!(!injected.wants_download_button());
        assert!(!ContentScript::new("<p>no title</p>", None).wants_download_button());
    }
}
