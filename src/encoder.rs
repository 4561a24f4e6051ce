#![forbid(unsafe_code)]

//! Audio/video muxing through an external ffmpeg process.
//!
//! Each upstream track is written into its own FIFO inside a private temp
//! directory, ffmpeg reads both FIFOs and writes fragmented MP4 to stdout.
//! A [`MergedStream`] owns every resource of one merge: the encoder, both
//! feeder tasks (and with them both upstream streams), the stderr logger, and
//! the FIFO directory. Dropping the stream releases all of it.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use nix::{errno::Errno, sys::stat::Mode, unistd::mkfifo};
use tempfile::TempDir;
use tokio::{
    io::{AsyncRead, AsyncWriteExt, ReadBuf},
    net::unix::pipe,
    process::{Child, ChildStdout, Command},
};
use tokio_util::task::AbortOnDropHandle;

use crate::extractor::ByteStream;
use crate::formats::Track;
use crate::process::log_stderr;

/// Bitrate of the re-encoded AAC track.
pub const AUDIO_BITRATE: &str = "192k";

// How often a feeder retries opening its FIFO before ffmpeg attaches.
const READER_POLL: Duration = Duration::from_millis(10);

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Muxes one video and one audio stream into a single MP4 stream.
    async fn merge(&self, video: ByteStream, audio: ByteStream) -> Result<ByteStream>;
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: PathBuf,
}

impl Ffmpeg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Starts the encoder and both feeders. On error everything acquired so
    /// far, including the two sources, is released before returning.
    pub async fn spawn_merge(&self, video: ByteStream, audio: ByteStream) -> Result<MergedStream> {
        let workdir = tempfile::Builder::new()
            .prefix("grabtube-merge-")
            .tempdir()
            .context("creating merge directory")?;
        let video_pipe = workdir.path().join("video.pipe");
        let audio_pipe = workdir.path().join("audio.pipe");
        for path in [&video_pipe, &audio_pipe] {
            mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
                .with_context(|| format!("creating {}", path.display()))?;
        }

        let mut child = Command::new(&self.binary)
            .args(encoder_args(&video_pipe, &audio_pipe))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("launching {}", self.binary.display()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("encoder stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .map(|stderr| AbortOnDropHandle::new(tokio::spawn(log_stderr(stderr, "ffmpeg".into()))));

        let feeders = [
            AbortOnDropHandle::new(tokio::spawn(feed_pipe(video_pipe, video, Track::Video))),
            AbortOnDropHandle::new(tokio::spawn(feed_pipe(audio_pipe, audio, Track::Audio))),
        ];
        tracing::info!(pid = child.id(), "encoder started");

        Ok(MergedStream {
            stdout,
            session: MergeSession {
                child,
                _feeders: feeders,
                _stderr: stderr,
                _workdir: workdir,
            },
        })
    }
}

#[async_trait]
impl Encoder for Ffmpeg {
    async fn merge(&self, video: ByteStream, audio: ByteStream) -> Result<ByteStream> {
        let merged = self.spawn_merge(video, audio).await?;
        Ok(Box::pin(merged))
    }
}

/// Video is copied, audio re-encoded to AAC, output stops at the shorter
/// input and is fragmented so it can be written before the end is known.
fn encoder_args(video: &Path, audio: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-loglevel".into(), "error".into()];
    args.push("-i".into());
    args.push(video.into());
    args.push("-i".into());
    args.push(audio.into());
    args.extend(
        [
            "-map",
            "0:v:0",
            "-map",
            "1:a:0",
            "-c:v",
            "copy",
            "-c:a",
            "aac",
            "-b:a",
            AUDIO_BITRATE,
            "-shortest",
            "-movflags",
            "frag_keyframe+empty_moov",
            "-f",
            "mp4",
            "pipe:1",
        ]
        .into_iter()
        .map(OsString::from),
    );
    args
}

/// Opens the write end once the encoder holds the read end. Opening earlier
/// would let a short input be written and closed before anyone reads it.
async fn open_pipe_writer(path: &Path) -> io::Result<pipe::Sender> {
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(err) if err.raw_os_error() == Some(Errno::ENXIO as i32) => {
                tokio::time::sleep(READER_POLL).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn feed_pipe(path: PathBuf, mut source: ByteStream, track: Track) {
    let result = async {
        let mut sink = open_pipe_writer(&path).await?;
        let copied = tokio::io::copy(&mut source, &mut sink).await?;
        sink.shutdown().await?;
        Ok::<u64, io::Error>(copied)
    }
    .await;

    match result {
        Ok(bytes) => tracing::debug!(%track, bytes, "input finished"),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!(%track, "encoder stopped reading input")
        }
        // The encoder sees EOF on this input and emits whatever it has.
        Err(err) => tracing::warn!(%track, "input failed: {err}"),
    }
}

struct MergeSession {
    child: Child,
    _feeders: [AbortOnDropHandle<()>; 2],
    _stderr: Option<AbortOnDropHandle<()>>,
    _workdir: TempDir,
}

impl Drop for MergeSession {
    fn drop(&mut self) {
        let pid = self.child.id();
        match self.child.try_wait() {
            Ok(Some(status)) => tracing::debug!(pid, "encoder exited with {status}"),
            _ => match self.child.start_kill() {
                Ok(()) => tracing::info!(pid, "encoder killed"),
                Err(err) => tracing::warn!(pid, "failed to kill encoder: {err}"),
            },
        }
    }
}

/// Encoder output. See the module docs for what dropping it releases.
pub struct MergedStream {
    stdout: ChildStdout,
    session: MergeSession,
}

impl MergedStream {
    pub fn encoder_pid(&self) -> Option<u32> {
        self.session.child.id()
    }
}

impl AsyncRead for MergedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}
