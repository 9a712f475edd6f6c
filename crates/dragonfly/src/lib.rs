//! Client side of the Dragonfly P2P file distribution protocol.
//!
//! A download registers its url with one of the configured supernodes, then
//! pulls pieces of the file from other peers, or from the supernode itself,
//! as the supernode schedules them. Every downloaded piece is kept in a
//! service file that a long lived peer server uploads to the next peers.
//! When the P2P network cannot serve the file, the client falls back to the
//! source url.
//!
//! # Example
//!
//! ```no_run
//! use dragonfly::{config::Config, hub::Hub, uploader::ServerLauncher};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = Config::new(
//!     "http://example.com/big.iso",
//!     "/tmp/big.iso",
//!     "/tmp/.small-dragonfly",
//! );
//! config.nodes = vec!["127.0.0.1:8002".into()];
//!
//! // the peer server is a `dfget server` process started next to this one
//! let hub = Hub::new(config, ServerLauncher::current_exe()?)?;
//! hub.get_file().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod args;
pub mod codec;
pub mod config;
pub mod constants;
pub mod counter;
pub mod downloader;
pub mod error;
pub mod hub;
pub mod limit_reader;
pub mod locator;
pub mod meta;
pub mod piece;
pub mod rate_limiter;
pub mod registrar;
pub mod uploader;
pub mod utils;
