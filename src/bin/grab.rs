#![forbid(unsafe_code)]

//! Command-line front-end for the client side: list formats, download one,
//! scan a page for media, or push a raw extension message through the relay.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use grabtube::config::{RuntimeOverrides, resolve_runtime_settings};
use grabtube::formats::FormatDescriptor;
use grabtube::host::{DownloadOutcome, LocalDownloads};
use grabtube::page_sources::ContentScript;
use grabtube::popup::{Popup, PopupClient, PopupStatus, rank_formats};
use grabtube::relay::{DEFAULT_EXTENSION_BASE, ExtensionMessage, Relay};
use grabtube::telemetry;
use indicatif::ProgressBar;
use tokio::sync::watch;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "grab", about = "Fetch video formats and downloads through a grabtube backend")]
struct GrabArgs {
    /// Backend base URL (overrides GRABTUBE_BACKEND).
    #[arg(long, global = true)]
    backend: Option<String>,
    /// dotenv file to read settings from.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the formats of a video, best first.
    Formats { url: String },
    /// Download one format of a video.
    Download {
        url: String,
        #[arg(long)]
        itag: String,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// List media sources found on a web page.
    Sources { page_url: String },
    /// Dispatch a JSON extension message through the background relay.
    Relay {
        message: String,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let args = GrabArgs::parse();
    let settings = resolve_runtime_settings(RuntimeOverrides {
        backend_url: args.backend,
        env_path: args.env_file,
        ..RuntimeOverrides::default()
    })?;

    match args.command {
        Command::Formats { url } => list_formats(&settings.backend_url, &url).await,
        Command::Download { url, itag, dir } => {
            download(&settings.backend_url, &url, &itag, dir).await
        }
        Command::Sources { page_url } => list_sources(&page_url).await,
        Command::Relay { message, dir } => relay(&settings.backend_url, &message, dir).await,
    }
}

async fn list_formats(backend: &str, url: &str) -> Result<()> {
    let client = PopupClient::new(backend);
    let response = client
        .fetch_formats(url)
        .await
        .map_err(|err| anyhow::anyhow!("{}", err.status()))?;
    let formats = rank_formats(response.formats);
    if formats.is_empty() {
        bail!("{}", PopupStatus::NoFormats);
    }

    if let Some(title) = response.title.as_deref() {
        println!("{title}");
    }
    if let Some(thumbnail) = response.thumbnail.as_deref() {
        println!("{thumbnail}");
    }
    for format in &formats {
        println!("{}", describe(format));
    }
    Ok(())
}

fn describe(format: &FormatDescriptor) -> String {
    let mut tracks = String::new();
    if format.has_video {
        tracks.push_str(" · video");
    }
    if format.has_audio {
        tracks.push_str(" · audio");
    }
    format!(
        "{:>6}  {:<10} {} · {}{}",
        format.itag,
        format.quality_label.as_deref().unwrap_or("Audio"),
        format.container,
        format.approx_size,
        tracks
    )
}

async fn download(backend: &str, url: &str, itag: &str, dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut popup = Popup::new(PopupClient::new(backend), LocalDownloads::new(dir));
    popup.set_url(url);
    popup.fetch().await;
    if popup.status() != &PopupStatus::Idle {
        bail!("{}", popup.status());
    }
    if !popup.formats().iter().any(|format| format.itag == itag) {
        bail!("format {itag} is not offered for this video");
    }

    let bar = ProgressBar::new(100);
    let follower = tokio::spawn(follow_progress(bar.clone(), popup.progress()));

    let started = popup.download(itag).await;
    if started.is_none() {
        follower.abort();
        bar.abandon();
        bail!("{}", popup.status());
    }
    if let Err(err) = follower.await {
        tracing::debug!("progress bar stopped: {err}");
    }
    println!("{}", popup.status());
    report(popup.host().wait_all().await)
}

/// Mirrors the popup's progress channel onto a terminal bar until it reaches
/// 100% or the popup goes away.
async fn follow_progress(bar: ProgressBar, mut progress: watch::Receiver<u8>) {
    while progress.changed().await.is_ok() {
        let percent = *progress.borrow_and_update();
        bar.set_position(percent.into());
        if percent == 100 {
            break;
        }
    }
    bar.finish();
}

async fn list_sources(page_url: &str) -> Result<()> {
    let url = Url::parse(page_url).with_context(|| format!("parsing {page_url}"))?;
    let fetch_url = url.clone();
    let html = tokio::task::spawn_blocking(move || -> Result<String> {
        let response = ureq::get(fetch_url.as_str())
            .call()
            .with_context(|| format!("fetching {fetch_url}"))?;
        response.into_string().context("reading page body")
    })
    .await
    .context("page fetch worker failed")??;

    let script = ContentScript::new(html, Some(url));
    if let Some(response) = script.handle(&ExtensionMessage::GetVideoSources) {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }
    Ok(())
}

async fn relay(backend: &str, message: &str, dir: PathBuf) -> Result<()> {
    let raw: serde_json::Value = serde_json::from_str(message).context("parsing message JSON")?;
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let relay = Relay::new(LocalDownloads::new(dir), backend, DEFAULT_EXTENSION_BASE)?;

    match relay.dispatch(&raw).await {
        Some(reply) => println!("{}", serde_json::to_string(&reply)?),
        None => println!("(no reply)"),
    }
    report(relay.host().wait_all().await)
}

fn report(outcomes: Vec<DownloadOutcome>) -> Result<()> {
    let mut failed = 0usize;
    for outcome in outcomes {
        match outcome.result {
            Ok(bytes) => println!(
                "download {}: {} ({bytes} bytes)",
                outcome.id,
                outcome.path.display()
            ),
            Err(err) => {
                failed += 1;
                println!("download {} interrupted: {err}", outcome.id);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} download(s) did not complete");
    }
    Ok(())
}
