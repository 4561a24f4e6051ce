#![forbid(unsafe_code)]

//! Background relay between extension messages and the host APIs.
//!
//! Keeps no state between messages. A handler either answers through its
//! [`Responder`] exactly once or drops it, which the sender observes as a
//! closed channel.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use url::Url;

use crate::host::{ConflictAction, DownloadId, DownloadRequest, HostApi, WindowKind, WindowSpec};
use crate::page_sources::GET_VIDEO_SOURCES;

pub const POPUP_PAGE: &str = "popup.html";
pub const POPUP_WIDTH: u32 = 500;
pub const POPUP_HEIGHT: u32 = 700;
/// Base used for extension-internal pages when no real extension origin exists.
pub const DEFAULT_EXTENSION_BASE: &str = "chrome-extension://grabtube/";

const DOWNLOAD_VIA_BACKEND: &str = "DOWNLOAD_VIA_BACKEND";
const OPEN_FORMATS_WINDOW: &str = "openFormatsWindow";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionMessage {
    GetVideoSources,
    DownloadViaBackend {
        source: String,
        filename: Option<String>,
    },
    OpenFormatsWindow {
        url: String,
    },
}

impl ExtensionMessage {
    /// Recognises the three message shapes. Anything else, including an
    /// `openFormatsWindow` without a url, is not for us.
    pub fn parse(value: &Value) -> Option<Self> {
        if value.as_str() == Some(GET_VIDEO_SOURCES) {
            return Some(Self::GetVideoSources);
        }
        let object = value.as_object()?;
        let field = |name: &str| object.get(name).and_then(Value::as_str);

        if field("type") == Some(DOWNLOAD_VIA_BACKEND) {
            return Some(Self::DownloadViaBackend {
                source: field("source")?.to_string(),
                filename: field("filename")
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
            });
        }
        if field("action") == Some(OPEN_FORMATS_WINDOW) {
            let url = field("url").filter(|url| !url.is_empty())?;
            return Some(Self::OpenFormatsWindow {
                url: url.to_string(),
            });
        }
        None
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::GetVideoSources => Value::String(GET_VIDEO_SOURCES.to_string()),
            Self::DownloadViaBackend { source, filename } => {
                let mut value = serde_json::json!({
                    "type": DOWNLOAD_VIA_BACKEND,
                    "source": source,
                });
                if let Some(filename) = filename {
                    value["filename"] = Value::String(filename.clone());
                }
                value
            }
            Self::OpenFormatsWindow { url } => serde_json::json!({
                "action": OPEN_FORMATS_WINDOW,
                "url": url,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_id: Option<DownloadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayResponse {
    pub fn started(id: DownloadId) -> Self {
        Self {
            ok: true,
            download_id: Some(id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            download_id: None,
            error: Some(error.into()),
        }
    }
}

/// Reply half of a message channel. `respond` consumes it.
#[derive(Debug)]
pub struct Responder<T> {
    sender: oneshot::Sender<T>,
}

impl<T> Responder<T> {
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    pub fn respond(self, value: T) {
        if self.sender.send(value).is_err() {
            tracing::debug!("message sender stopped listening before the reply");
        }
    }
}

pub struct Relay<H> {
    host: H,
    backend: Url,
    popup_page: Url,
}

impl<H: HostApi> Relay<H> {
    pub fn new(host: H, backend: &str, extension_base: &str) -> Result<Self> {
        let backend =
            Url::parse(backend).with_context(|| format!("parsing backend url {backend}"))?;
        let popup_page = Url::parse(extension_base)
            .and_then(|base| base.join(POPUP_PAGE))
            .with_context(|| format!("parsing extension base {extension_base}"))?;
        Ok(Self {
            host,
            backend,
            popup_page,
        })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// `<backend>/download?source=<source>`.
    pub fn backend_download_url(&self, source: &str) -> Url {
        let mut url = self.backend.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("download");
        }
        url.query_pairs_mut().clear().append_pair("source", source);
        url
    }

    /// `popup.html?url=<page>` inside the extension.
    pub fn popup_url(&self, page_url: &str) -> Url {
        let mut url = self.popup_page.clone();
        url.query_pairs_mut().clear().append_pair("url", page_url);
        url
    }

    pub async fn handle(&self, message: ExtensionMessage, responder: Responder<RelayResponse>) {
        match message {
            ExtensionMessage::DownloadViaBackend { source, filename } => {
                let request = DownloadRequest {
                    url: self.backend_download_url(&source).into(),
                    filename,
                    conflict_action: ConflictAction::Uniquify,
                    save_as: false,
                };
                let response = match self.host.download(request).await {
                    Ok(id) => RelayResponse::started(id),
                    Err(err) => {
                        tracing::warn!("relay download failed: {err}");
                        RelayResponse::failed(err.to_string())
                    }
                };
                responder.respond(response);
            }
            ExtensionMessage::OpenFormatsWindow { url } => {
                let spec = WindowSpec {
                    url: self.popup_url(&url).into(),
                    kind: WindowKind::Popup,
                    width: POPUP_WIDTH,
                    height: POPUP_HEIGHT,
                };
                if let Err(err) = self.host.open_window(spec).await {
                    tracing::warn!("could not open formats window: {err}");
                }
            }
            // Answered by the content script of the page.
            ExtensionMessage::GetVideoSources => {}
        }
    }

    /// Parses a raw message, handles it and waits for the reply, if any.
    pub async fn dispatch(&self, raw: &Value) -> Option<RelayResponse> {
        let Some(message) = ExtensionMessage::parse(raw) else {
            tracing::debug!("ignoring unrecognised message {raw}");
            return None;
        };
        let (responder, reply) = Responder::channel();
        self.handle(message, responder).await;
        reply.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct FakeHost {
        refuse: Option<String>,
        downloads: Mutex<Vec<DownloadRequest>>,
        windows: Mutex<Vec<WindowSpec>>,
    }

    #[async_trait]
    impl HostApi for FakeHost {
        async fn download(&self, request: DownloadRequest) -> Result<DownloadId, HostError> {
            if let Some(reason) = &self.refuse {
                return Err(HostError::InvalidFilename(reason.clone()));
            }
            let mut downloads = self.downloads.lock();
            downloads.push(request);
            Ok(downloads.len() as DownloadId + 40)
        }

        async fn open_window(&self, spec: WindowSpec) -> Result<(), HostError> {
            self.windows.lock().push(spec);
            Ok(())
        }
    }

    fn relay(host: FakeHost) -> Relay<FakeHost> {
        Relay::new(host, "http://localhost:3000", DEFAULT_EXTENSION_BASE).unwrap()
    }

    #[test]
    fn parses_known_shapes() {
        assert_eq!(
            ExtensionMessage::parse(&json!("GET_VIDEO_SOURCES")),
            Some(ExtensionMessage::GetVideoSources)
        );
        assert_eq!(
            ExtensionMessage::parse(&json!({
                "type": "DOWNLOAD_VIA_BACKEND",
                "source": "https://cdn.example.com/a.mp4",
                "filename": "a.mp4"
            })),
            Some(ExtensionMessage::DownloadViaBackend {
                source: "https://cdn.example.com/a.mp4".into(),
                filename: Some("a.mp4".into()),
            })
        );
        assert_eq!(
            ExtensionMessage::parse(&json!({"action": "openFormatsWindow", "url": "https://x.test/"})),
            Some(ExtensionMessage::OpenFormatsWindow {
                url: "https://x.test/".into()
            })
        );
    }

    #[test]
    fn ignores_unknown_shapes() {
        for raw in [
            json!(null),
            json!("PING"),
            json!({"type": "SOMETHING_ELSE"}),
            json!({"action": "openFormatsWindow"}),
            json!({"action": "openFormatsWindow", "url": ""}),
        ] {
            assert_eq!(ExtensionMessage::parse(&raw), None, "{raw}");
        }
    }

    #[test]
    fn messages_round_trip_through_json() {
        let message = ExtensionMessage::DownloadViaBackend {
            source: "https://cdn.example.com/a.mp4".into(),
            filename: None,
        };
        assert_eq!(
            message.to_value(),
            json!({"type": "DOWNLOAD_VIA_BACKEND", "source": "https://cdn.example.com/a.mp4"})
        );
        assert_eq!(ExtensionMessage::parse(&message.to_value()), Some(message));
    }

    #[tokio::test]
    async fn download_goes_through_backend_proxy() {
        let relay = relay(FakeHost::default());
        let reply = relay
            .dispatch(&json!({
                "type": "DOWNLOAD_VIA_BACKEND",
                "source": "https://cdn.example.com/a b.mp4?x=1&y=2",
                "filename": "clip.mp4"
            }))
            .await;
        assert_eq!(reply, Some(RelayResponse::started(41)));

        let downloads = relay.host().downloads.lock();
        let request = &downloads[0];
        let url = Url::parse(&request.url).unwrap();
        assert_eq!(url.path(), "/download");
        assert_eq!(
            url.query_pairs().collect::<Vec<_>>(),
            vec![("source".into(), "https://cdn.example.com/a b.mp4?x=1&y=2".into())]
        );
        assert_eq!(request.filename.as_deref(), Some("clip.mp4"));
        assert_eq!(request.conflict_action, ConflictAction::Uniquify);
        assert!(!request.save_as);
    }

    #[tokio::test]
    async fn host_failure_is_reported_once() {
        let relay = relay(FakeHost {
            refuse: Some("bad name".into()),
            ..FakeHost::default()
        });
        let reply = relay
            .dispatch(&json!({"type": "DOWNLOAD_VIA_BACKEND", "source": "https://a.test/v.mp4"}))
            .await
            .unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.error.as_deref(), Some("Invalid filename: bad name"));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"ok": false, "error": "Invalid filename: bad name"})
        );
    }

    #[tokio::test]
    async fn formats_window_opens_without_reply() {
        let relay = relay(FakeHost::default());
        let reply = relay
            .dispatch(&json!({
                "action": "openFormatsWindow",
                "url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
            }))
            .await;
        assert_eq!(reply, None);

        let windows = relay.host().windows.lock();
        assert_eq!(windows.len(), 1);
        let spec = &windows[0];
        assert_eq!(spec.kind, WindowKind::Popup);
        assert_eq!((spec.width, spec.height), (500, 700));
        let url = Url::parse(&spec.url).unwrap();
        assert!(url.path().ends_with("/popup.html"));
        assert_eq!(
            url.query_pairs().next().map(|(k, v)| (k.into_owned(), v.into_owned())),
            Some((
                "url".to_string(),
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn source_queries_are_left_to_the_page() {
        let relay = relay(FakeHost::default());
        assert_eq!(relay.dispatch(&json!("GET_VIDEO_SOURCES")).await, None);
        assert!(relay.host().downloads.lock().is_empty());
        assert!(relay.host().windows.lock().is_empty());
    }

    #[test]
    fn responder_replies_once() {
        let (responder, mut reply) = Responder::channel();
        responder.respond(RelayResponse::started(7));
        assert_eq!(reply.try_recv().unwrap(), RelayResponse::started(7));

        let (responder, mut reply) = Responder::<RelayResponse>::channel();
        drop(responder);
        assert!(reply.try_recv().is_err());
    }
}
