#![forbid(unsafe_code)]

//! Child-process plumbing shared by the extractor and the encoder.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf},
    process::{Child, ChildStderr, ChildStdout},
};

/// Reads a child's stdout and owns the child itself. The child is killed when
/// the stream is dropped, whether or not it finished.
pub(crate) struct ChildStream {
    label: String,
    child: Child,
    stdout: ChildStdout,
}

impl ChildStream {
    pub(crate) fn new(label: impl Into<String>, child: Child, stdout: ChildStdout) -> Self {
        Self {
            label: label.into(),
            child,
            stdout,
        }
    }
}

impl AsyncRead for ChildStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(source = %self.label, "child already gone: {err}");
        } else {
            tracing::debug!(source = %self.label, "stopped child process");
        }
    }
}

/// Forwards every stderr line of a child to the log until the pipe closes.
pub(crate) async fn log_stderr(stderr: ChildStderr, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            tracing::warn!(source = %label, "{line}");
        }
    }
}
