//! Codes and defaults shared by the downloader, the peer server and the
//! supernode.
use std::time::Duration;

/// Response codes sent by the supernode.
pub mod code {
    pub const HTTP_ERROR: i32 = -100;
    pub const SUCCESS: i32 = 200;

    pub const SYSTEM_ERROR: i32 = 500;
    pub const PARAM_ERROR: i32 = 501;
    pub const TARGET_NOT_FOUND: i32 = 502;

    pub const PEER_FINISH: i32 = 600;
    pub const PEER_CONTINUE: i32 = 601;
    pub const PEER_WAIT: i32 = 602;
    pub const PEER_LIMITED: i32 = 603;
    pub const SUPER_FAIL: i32 = 604;
    pub const UNKNOWN_ERROR: i32 = 605;
    pub const TASK_CONFLICT: i32 = 606;
    pub const URL_NOT_REACHABLE: i32 = 607;
    pub const NEED_AUTH: i32 = 608;
    pub const WAIT_AUTH: i32 = 609;
    pub const SOURCE_ERROR: i32 = 610;
    pub const GET_PIECE_REPORT: i32 = 611;
    pub const GET_PEER_DOWN: i32 = 612;
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVER_NAME: &str = "dfget";

pub const DEFAULT_SUPERNODE: &str = "127.0.0.1";
pub const DEFAULT_SUPERNODE_PORT: u16 = 8002;
pub const DEFAULT_SUPERNODE_WEIGHT: u32 = 1;
pub const SUPERNODE_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_LOCAL_LIMIT: u64 = 20 * 1024 * 1024;
pub const DEFAULT_MIN_RATE: u64 = 64 * 1024;
pub const DEFAULT_CLIENT_QUEUE_SIZE: usize = 6;
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const RESERVED_DOWNLOAD_TIME: Duration = Duration::from_secs(10);

/// Window used by every rate limiter, in milliseconds.
pub const RATE_LIMITER_WINDOW: i64 = 2;

pub const DATA_EXPIRE_TIME: Duration = Duration::from_secs(3 * 60);
pub const SERVER_ALIVE_TIME: Duration = Duration::from_secs(5 * 60);
pub const GC_INTERVAL: Duration = Duration::from_secs(15);

pub const SERVER_PORT_LOWER_LIMIT: u16 = 15000;
pub const SERVER_PORT_UPPER_LIMIT: u16 = 65000;
pub const LAUNCH_SERVER_RETRIES: u16 = 10;

/// Max concurrent piece workers of one download.
pub const STREAM_WRITER_ROUTINE_LIMIT: usize = 4;

pub const PEER_HTTP_PATH_PREFIX: &str = "/peer/file/";
pub const CDN_PATH_PREFIX: &str = "/qtdown/";
pub const LOCAL_HTTP_PATH_CHECK: &str = "/check/";
pub const LOCAL_HTTP_PATH_CLIENT: &str = "/client/";
pub const LOCAL_HTTP_PATH_RATE: &str = "/rate/";
pub const LOCAL_HTTP_PING: &str = "/server/ping";

pub const RANGE_NOT_SATISFIABLE_DESC: &str = "range not satisfiable";
pub const SERVER_PORT_LINE: &str = "dfget uploader server port is";

pub const CLIENT_ERROR_FILE_NOT_EXIST: &str = "FILE_NOT_EXIST";
pub const CLIENT_ERROR_FILE_MD5_NOT_MATCH: &str = "FILE_MD5_NOT_MATCH";

/// Value of `cdnSource` when pieces travel without the frame.
pub const CDN_SOURCE_SOURCE: &str = "source";
pub const CDN_SOURCE_SUPERNODE: &str = "supernode";

pub mod header {
    pub const PIECE_NUM: &str = "pieceNum";
    pub const PIECE_SIZE: &str = "pieceSize";
    pub const CDN_SOURCE: &str = "cdnSource";
    pub const RATE_LIMIT: &str = "rateLimit";
    pub const DATA_DIR: &str = "dataDir";
    pub const TOTAL_LIMIT: &str = "totalLimit";
}

pub fn user_agent() -> String {
    format!("{SERVER_NAME}/{VERSION}")
}
