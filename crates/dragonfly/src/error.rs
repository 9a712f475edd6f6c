use std::{io, num::ParseIntError, time::Duration};

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinError};

use crate::{config::BackSourceReason, piece::WriterMsg};

impl From<mpsc::error::SendError<WriterMsg>> for Error {
    fn from(_value: mpsc::error::SendError<WriterMsg>) -> Self {
        Self::WriterClosed
    }
}

impl From<toml::ser::Error> for Error {
    fn from(value: toml::ser::Error) -> Self {
        Self::ConfigError(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to encode or decode json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error while trying to load configuration: `{0}`")]
    FromConfigError(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid value `{0}`: {1}")]
    InvalidValue(String, String),

    #[error("Failed to parse integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("A spawned task panicked or was cancelled: {0}")]
    Join(#[from] JoinError),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderOpenError(String),

    #[error("{}", crate::constants::RANGE_NOT_SATISFIABLE_DESC)]
    RangeNotSatisfiable,

    #[error("The piece frame is corrupt: {0}")]
    PieceCorrupt(String),

    #[error("piece md5 not match, real:{real} expected:{expected}")]
    PieceMd5NotMatch { real: String, expected: String },

    #[error("Md5NotMatch, real:{real} expect:{expected}")]
    Md5NotMatch { real: String, expected: String },

    #[error("Peer {0} is not reachable: {1}")]
    PeerUnreachable(String, io::Error),

    #[error("Peer responded with status {0}")]
    PeerStatus(u16),

    #[error("Supernode {node} responded with code {code}: {msg}")]
    SupernodeCode { node: String, code: i32, msg: String },

    #[error("Supernode responded with HTTP status {0}: {1}")]
    SupernodeStatus(u16, String),

    #[error("The supernode requires authentication for this url")]
    NeedAuth,

    #[error("Failed to register to any supernode: {0}")]
    RegisterFail(String),

    #[error("No supernode is configured")]
    NodeEmpty,

    #[error("Download timeout({:.3}s)", .0.as_secs_f64())]
    DownloadTimeout(Duration),

    #[error("Download from source is not allowed, back source reason: {0}")]
    BackSourceDisabled(BackSourceReason),

    #[error("Failed to download from source: {0}")]
    BackSource(String),

    #[error("P2P download failed, back source reason: {0}")]
    P2pFailed(BackSourceReason),

    #[error("stream writer not support reset")]
    StreamReset,

    #[error("Piece {missing} never arrived, {cached} later pieces were dropped")]
    StreamGap { missing: i32, cached: usize },

    #[error("Piece number {0} arrived after the write cursor {1}")]
    PieceOutOfOrder(i32, i32),

    #[error("The writer channel is closed")]
    WriterClosed,

    #[error("invalid params")]
    InvalidParams,

    #[error("Task `{0}` was not found")]
    TaskNotFound(String),

    #[error("Failed to launch the peer server: {0}")]
    PeerServerLaunch(String),

    #[error("The download was cancelled")]
    Cancelled,
}

impl Error {
    /// Errors that are worth retrying in place, without blaming the peer.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::IO(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            ),
            Error::PeerUnreachable(..) => true,
            _ => false,
        }
    }
}

/// Error returned by the top level entry points, carrying the process exit
/// code.
#[derive(Error, Debug)]
#[error("[{code}] {msg}")]
pub struct DfgetError {
    pub code: i32,
    pub msg: String,
}

impl DfgetError {
    pub const LAUNCH_SERVER: i32 = 1100;
    pub const PREPARE: i32 = 1101;
    pub const GET_USER: i32 = 1102;
    pub const REGISTER: i32 = 1103;
    pub const DOWNLOAD: i32 = 1104;

    pub fn new(code: i32, err: impl ToString) -> Self {
        Self { code, msg: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let e = Error::RangeNotSatisfiable;
        assert_eq!(e.to_string(), "range not satisfiable");

        let e = Error::DownloadTimeout(Duration::from_millis(1500));
        assert_eq!(e.to_string(), "Download timeout(1.500s)");

        let e = DfgetError::new(DfgetError::REGISTER, Error::NeedAuth);
        assert_eq!(
            e.to_string(),
            "[1103] The supernode requires authentication for this url"
        );
    }

    #[test]
    fn transient() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(Error::IO(refused).is_transient());
        assert!(!Error::PeerStatus(404).is_transient());
        assert!(!Error::RangeNotSatisfiable.is_transient());
    }
}
