//! Downloaders of a registered task: from peers through the supernode, or
//! straight from the source.
use std::{
    future::Future,
    path::Path,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{io::AsyncRead, time::timeout};
use tracing::{info, warn};

use crate::{
    config::BackSourceReason,
    constants::DEFAULT_DOWNLOAD_TIMEOUT,
    error::Error,
    utils::{md5_file, move_file},
};

pub mod back_source;
pub mod p2p;

pub use back_source::BackSourceDownloader;
pub use p2p::P2pDownloader;

/// Bytes of the file, in order. The read that reaches the end fails when
/// the md5 of the file does not match the declared one.
pub type DownloadReader = Pin<Box<dyn AsyncRead + Send>>;

pub trait Downloader: Sized + Send {
    /// Download the whole file into the target path.
    fn run(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Download in the background and return the bytes as they arrive.
    fn run_stream(
        self,
    ) -> impl Future<Output = Result<DownloadReader, Error>> + Send;

    /// Stop whatever is still running and remove temporary files.
    fn cleanup(&mut self) -> impl Future<Output = ()> + Send;
}

/// Run `downloader` within `deadline`, or within the default timeout when
/// there is none. On timeout the downloader is cleaned up.
pub async fn download_with_timeout<D: Downloader>(
    downloader: &mut D,
    deadline: Option<Duration>,
) -> Result<(), Error> {
    let deadline = deadline
        .filter(|d| !d.is_zero())
        .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

    match timeout(deadline, downloader.run()).await {
        Ok(res) => res,
        Err(_) => {
            warn!("download timeout({}s)", deadline.as_secs());
            downloader.cleanup().await;
            Err(Error::DownloadTimeout(deadline))
        }
    }
}

/// Move `src` to `dst`, after checking its md5 when one is expected.
pub async fn move_file_checked(
    src: &Path,
    dst: &Path,
    md5: Option<&str>,
) -> Result<(), Error> {
    if let Some(expected) = md5.filter(|m| !m.is_empty()) {
        let real = md5_file(src).await?;
        if real != expected.to_lowercase() {
            return Err(Error::Md5NotMatch {
                real,
                expected: expected.to_owned(),
            });
        }
    }
    move_file(src, dst).await?;
    info!("moved {src:?} to {dst:?}");
    Ok(())
}

/// The back source reason of one download, shared with its writers.
#[derive(Debug, Clone, Default)]
pub struct SharedReason(Arc<Mutex<BackSourceReason>>);

impl SharedReason {
    pub fn new(reason: BackSourceReason) -> Self {
        Self(Arc::new(Mutex::new(reason)))
    }

    pub fn get(&self) -> BackSourceReason {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, reason: BackSourceReason) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = reason;
    }

    pub fn is_set(&self) -> bool {
        self.get().is_set()
    }
}
