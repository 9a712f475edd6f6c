//! Configuration file, CLI flags and the runtime variables of one download.
//!
//! Settings are resolved in order of priority:
//!
//! CLI Flags --overrides--> Env (`DFGET_*`) --overrides--> File --> Defaults
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::{
    args::{DownloadArgs, ServerArgs},
    constants::{
        DATA_EXPIRE_TIME, DEFAULT_CLIENT_QUEUE_SIZE, DEFAULT_LOCAL_LIMIT,
        DEFAULT_MIN_RATE, SERVER_ALIVE_TIME,
    },
    error::Error,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    /// Download from peers and upload to them.
    #[default]
    P2p,
    /// Download from the supernode only, without uploading.
    Cdn,
    /// Download from the source directly.
    Source,
}

/// Why a download fell back, or must fall back, to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackSourceReason {
    #[default]
    None,
    RegisterFail,
    Md5NotMatch,
    DownloadError,
    NoSpace,
    InitError,
    WriteError,
    HostSysError,
    NodeEmpty,
    SourceError,
    UserSpecified,
}

impl BackSourceReason {
    /// Added to the code when the user disabled the fallback.
    pub const FORCE_NOT_BACK_SOURCE_ADDITION: i32 = 1000;

    pub fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::RegisterFail => 1,
            Self::Md5NotMatch => 2,
            Self::DownloadError => 3,
            Self::NoSpace => 4,
            Self::InitError => 5,
            Self::WriteError => 6,
            Self::HostSysError => 7,
            Self::NodeEmpty => 8,
            Self::SourceError => 10,
            Self::UserSpecified => 100,
        }
    }

    pub fn is_set(self) -> bool {
        self != Self::None
    }

    /// Reasons for which downloading from the source would not help.
    pub fn forbids_fallback(self) -> bool {
        matches!(self, Self::NoSpace | Self::HostSysError)
    }

    /// Code sent in the metrics report.
    pub fn report_code(self, notbs: bool) -> i32 {
        if notbs && self.is_set() {
            return self.code() + Self::FORCE_NOT_BACK_SOURCE_ADDITION;
        }
        self.code()
    }
}

impl Display for BackSourceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?})", self.code(), self)
    }
}

/// Settings that can be persisted in `dfget.toml` or passed via env.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub nodes: Vec<String>,
    pub local_limit: Option<String>,
    pub min_rate: Option<String>,
    pub total_limit: Option<String>,
    pub client_queue_size: Option<usize>,
    pub work_home: Option<PathBuf>,
    pub data_expire_time_secs: Option<u64>,
    pub server_alive_time_secs: Option<u64>,
    pub peer_port: Option<u16>,
}

impl FileConfig {
    pub fn config_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "dfget").ok_or(Error::HomeInvalid)?;
        Ok(dotfile.config_dir().join("dfget.toml"))
    }

    /// Load the configuration file and the `DFGET_*` env. If the file does
    /// not exist, it tries to create it with the default configuration.
    pub fn load() -> Result<Self, Error> {
        let path = Self::config_path()?;
        if !path.exists() {
            if let Err(e) = Self::write_default(&path) {
                tracing::debug!("could not write default config {path:?}: {e}");
            }
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("DFGET")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("nodes"),
            )
            .build()?;

        Ok(settings.try_deserialize::<FileConfig>()?)
    }

    fn write_default(path: &Path) -> Result<(), Error> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|_| Error::FolderOpenError(dir.display().to_string()))?;
        }
        let default = FileConfig {
            nodes: vec![format!(
                "{}:{}",
                crate::constants::DEFAULT_SUPERNODE,
                crate::constants::DEFAULT_SUPERNODE_PORT
            )],
            ..Default::default()
        };
        std::fs::write(path, toml::to_string(&default)?)?;
        Ok(())
    }
}

/// Variables computed while preparing a download.
#[derive(Debug, Clone, Default)]
pub struct RuntimeVariables {
    pub meta_path: PathBuf,
    pub system_data_dir: PathBuf,
    pub data_dir: PathBuf,
    pub real_target: PathBuf,
    pub target_dir: PathBuf,
    pub temp_target: PathBuf,
    pub local_ip: String,
    pub peer_port: u16,
    pub cid: String,
    pub task_url: String,
    pub task_file_name: String,
    pub file_length: i64,
    pub stream_mode: bool,
}

/// Resolved configuration of one dfget invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub url: String,
    pub output: PathBuf,
    /// Bytes per second, 0 means unlimited.
    pub local_limit: i64,
    pub min_rate: i64,
    pub total_limit: i64,
    pub timeout: Option<Duration>,
    pub md5: Option<String>,
    pub identifier: Option<String>,
    pub call_system: String,
    pub pattern: Pattern,
    pub filter: Vec<String>,
    pub headers: Vec<String>,
    pub nodes: Vec<String>,
    pub notbs: bool,
    pub dfdaemon: bool,
    pub insecure: bool,
    pub show_bar: bool,
    pub console: bool,
    pub verbose: bool,
    pub client_queue_size: usize,
    pub work_home: PathBuf,
    /// Port for the peer server, generated when 0.
    pub peer_port: u16,
    pub data_expire_time: Duration,
    pub server_alive_time: Duration,
    pub sign: String,
    pub start_time: SystemTime,
    pub rv: RuntimeVariables,
}

impl Config {
    /// A configuration with every default, rooted at `work_home`.
    pub fn new(
        url: impl Into<String>,
        output: impl Into<PathBuf>,
        work_home: impl Into<PathBuf>,
    ) -> Self {
        let work_home = work_home.into();
        let start_time = SystemTime::now();
        let rv = RuntimeVariables {
            meta_path: meta_path(&work_home),
            system_data_dir: work_home.join("data"),
            data_dir: work_home.join("data"),
            ..Default::default()
        };

        Self {
            url: url.into(),
            output: output.into(),
            local_limit: DEFAULT_LOCAL_LIMIT as i64,
            min_rate: DEFAULT_MIN_RATE as i64,
            total_limit: 0,
            timeout: None,
            md5: None,
            identifier: None,
            call_system: String::new(),
            pattern: Pattern::P2p,
            filter: Vec::new(),
            headers: Vec::new(),
            nodes: Vec::new(),
            notbs: false,
            dfdaemon: false,
            insecure: false,
            show_bar: false,
            console: false,
            verbose: false,
            client_queue_size: DEFAULT_CLIENT_QUEUE_SIZE,
            work_home,
            peer_port: 0,
            data_expire_time: DATA_EXPIRE_TIME,
            server_alive_time: SERVER_ALIVE_TIME,
            sign: sign(start_time),
            start_time,
            rv,
        }
    }

    /// Merge the CLI flags over the file configuration.
    pub fn from_args(args: DownloadArgs, file: FileConfig) -> Result<Self, Error> {
        let url = args
            .url
            .ok_or_else(|| Error::InvalidValue("url".into(), "missing".into()))?;

        let output = match args.output {
            Some(output) => output,
            None => default_output(&url)?,
        };

        let work_home = match args.home.or(file.work_home) {
            Some(home) => home,
            None => default_work_home()?,
        };

        let mut config = Self::new(url, output, work_home);

        if let Some(limit) = args.local_limit.or(file.local_limit) {
            config.local_limit = parse_rate(&limit)?;
        }
        if let Some(rate) = args.min_rate.or(file.min_rate) {
            config.min_rate = parse_rate(&rate)?;
        }
        if let Some(limit) = args.total_limit.or(file.total_limit) {
            config.total_limit = parse_rate(&limit)?;
        }
        if let Some(size) = file.client_queue_size {
            if size == 0 {
                return Err(Error::InvalidValue(
                    "client_queue_size".into(),
                    "must be positive".into(),
                ));
            }
            config.client_queue_size = size;
        }
        if let Some(secs) = file.data_expire_time_secs {
            config.data_expire_time = Duration::from_secs(secs);
        }
        if let Some(secs) = file.server_alive_time_secs {
            config.server_alive_time = Duration::from_secs(secs);
        }

        config.timeout = args.timeout.map(Duration::from_secs);
        config.md5 = args.md5.map(|m| m.to_lowercase());
        config.identifier = args.identifier;
        config.call_system = args.call_system.unwrap_or_default();
        config.pattern = args.pattern.unwrap_or_default();
        config.filter = args.filter;
        config.headers = args.header;
        config.nodes = if args.node.is_empty() { file.nodes } else { args.node };
        config.notbs = args.notbs;
        config.dfdaemon = args.dfdaemon;
        config.insecure = args.insecure;
        config.show_bar = args.show_bar;
        config.console = args.console;
        config.verbose = args.verbose;
        config.peer_port = file.peer_port.unwrap_or(0);

        Ok(config)
    }

    /// Whether pieces travel inside the 5 byte frame.
    pub fn is_p2p(&self) -> bool {
        self.pattern == Pattern::P2p
    }
}

/// Resolved configuration of the peer server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    pub meta_path: PathBuf,
    pub data_dir: PathBuf,
    pub work_home: PathBuf,
    pub data_expire_time: Duration,
    pub server_alive_time: Duration,
}

impl ServerConfig {
    pub fn new(work_home: impl Into<PathBuf>) -> Self {
        let work_home = work_home.into();
        Self {
            ip: "0.0.0.0".into(),
            port: 0,
            meta_path: meta_path(&work_home),
            data_dir: work_home.join("data"),
            work_home,
            data_expire_time: DATA_EXPIRE_TIME,
            server_alive_time: SERVER_ALIVE_TIME,
        }
    }

    pub fn from_args(args: ServerArgs, file: FileConfig) -> Result<Self, Error> {
        let work_home = match args.home.or(file.work_home) {
            Some(home) => home,
            None => default_work_home()?,
        };
        let mut config = Self::new(work_home);

        if let Some(ip) = args.ip {
            config.ip = ip;
        }
        config.port = if args.port > 0 {
            args.port
        } else {
            file.peer_port.unwrap_or(0)
        };
        if let Some(meta) = args.meta {
            config.meta_path = meta;
        }
        if let Some(data) = args.data {
            config.data_dir = data;
        }
        if let Some(secs) = args.expire_time.or(file.data_expire_time_secs) {
            config.data_expire_time = Duration::from_secs(secs);
        }
        if let Some(secs) = args.alive_time.or(file.server_alive_time_secs) {
            config.server_alive_time = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

pub fn default_work_home() -> Result<PathBuf, Error> {
    let dirs = BaseDirs::new().ok_or(Error::HomeInvalid)?;
    Ok(dirs.home_dir().join(".small-dragonfly"))
}

pub fn meta_path(work_home: &Path) -> PathBuf {
    work_home.join("meta").join("host.meta")
}

fn default_output(url: &str) -> Result<PathBuf, Error> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || path.ends_with("//") || !path.contains("://") {
        return Err(Error::InvalidValue(
            "output".into(),
            format!("cannot infer a file name from {url}"),
        ));
    }
    Ok(std::env::current_dir()?.join(name))
}

/// `{pid}-{unix seconds with milliseconds}`, unique per process.
pub fn sign(start: SystemTime) -> String {
    let secs = start
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    format!("{}-{:.3}", std::process::id(), secs)
}

/// Parse rates like `20M`, `512K`, `1G` or a plain number of bytes.
pub fn parse_rate(s: &str) -> Result<i64, Error> {
    let s = s.trim();
    let invalid = || Error::InvalidValue(s.to_owned(), "not a valid rate".into());

    let Some(last) = s.chars().last() else {
        return Err(invalid());
    };

    let (number, unit) = if last.is_ascii_digit() {
        (s, 1)
    } else {
        let unit = match last.to_ascii_uppercase() {
            'B' => 1,
            'K' => 1024,
            'M' => 1024 * 1024,
            'G' => 1024 * 1024 * 1024,
            _ => return Err(invalid()),
        };
        (&s[..s.len() - 1], unit)
    };

    let n: i64 = number.trim().parse().map_err(|_| invalid())?;
    if n < 0 {
        return Err(invalid());
    }
    Ok(n * unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates() {
        assert_eq!(parse_rate("20M").unwrap(), 20 * 1024 * 1024);
        assert_eq!(parse_rate("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_rate("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_rate("300").unwrap(), 300);
        assert_eq!(parse_rate("7B").unwrap(), 7);
        assert!(parse_rate("").is_err());
        assert!(parse_rate("10X").is_err());
        assert!(parse_rate("-1M").is_err());
    }

    #[test]
    fn back_source_reason_codes() {
        assert_eq!(BackSourceReason::None.code(), 0);
        assert_eq!(BackSourceReason::NodeEmpty.code(), 8);
        assert_eq!(BackSourceReason::UserSpecified.code(), 100);
        assert!(BackSourceReason::NoSpace.forbids_fallback());
        assert!(!BackSourceReason::DownloadError.forbids_fallback());
        assert_eq!(BackSourceReason::DownloadError.report_code(true), 1003);
        assert_eq!(BackSourceReason::None.report_code(true), 0);
    }

    #[test]
    fn flags_override_file() {
        let args = DownloadArgs {
            url: Some("http://src/hello.txt".into()),
            output: Some("/tmp/out".into()),
            home: Some("/tmp/home".into()),
            local_limit: Some("1M".into()),
            md5: Some("ABC".into()),
            ..Default::default()
        };
        let file = FileConfig {
            nodes: vec!["10.0.0.1".into()],
            local_limit: Some("5M".into()),
            client_queue_size: Some(3),
            ..Default::default()
        };

        let config = Config::from_args(args, file).unwrap();
        assert_eq!(config.local_limit, 1024 * 1024);
        assert_eq!(config.client_queue_size, 3);
        assert_eq!(config.nodes, vec!["10.0.0.1"]);
        assert_eq!(config.md5.as_deref(), Some("abc"));
        assert_eq!(config.rv.meta_path, PathBuf::from("/tmp/home/meta/host.meta"));
        assert_eq!(config.rv.system_data_dir, PathBuf::from("/tmp/home/data"));
    }

    #[test]
    fn output_defaults_to_url_file_name() {
        let out = default_output("http://src/dir/hello.txt?a=1").unwrap();
        assert!(out.ends_with("hello.txt"));
        assert!(default_output("http://src/dir/").is_err());
    }

    #[test]
    fn load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dfget.toml");
        std::fs::write(
            &path,
            "nodes = [\"10.0.0.1:8002=2\"]\nlocal_limit = \"10M\"\npeer_port = 15100\n",
        )
        .unwrap();

        let file = FileConfig::load_from(&path).unwrap();
        assert_eq!(file.nodes, vec!["10.0.0.1:8002=2"]);
        assert_eq!(file.local_limit.as_deref(), Some("10M"));
        assert_eq!(file.peer_port, Some(15100));
    }

    #[test]
    fn sign_format() {
        let s = sign(UNIX_EPOCH + Duration::from_millis(1_500_123));
        assert_eq!(s, format!("{}-1500.123", std::process::id()));
    }
}
