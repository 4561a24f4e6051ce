#![forbid(unsafe_code)]

//! Shared pieces of grabtube: the format/stream backend and the client side
//! that detects media on pages and drives downloads through it.

pub mod config;
pub mod encoder;
pub mod extractor;
pub mod formats;
pub mod host;
pub mod page_sources;
pub mod popup;
mod process;
pub mod relay;
pub mod telemetry;
pub mod ytdlp;
