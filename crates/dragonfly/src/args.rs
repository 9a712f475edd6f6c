use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Pattern;

#[derive(Parser, Debug, Default)]
#[clap(name = "dfget")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub download: DownloadArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the peer server that uploads downloaded pieces to other peers.
    Server(ServerArgs),
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct DownloadArgs {
    /// URL of the file to download.
    #[clap(short, long)]
    pub url: Option<String>,

    /// Destination path of the downloaded file.
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Download rate limit of this task, like 20M or 512K.
    #[clap(short = 's', long = "locallimit")]
    pub local_limit: Option<String>,

    /// Minimal expected rate, used to compute the download timeout.
    #[clap(long = "minrate")]
    pub min_rate: Option<String>,

    /// Upload rate limit shared by every task of this host.
    #[clap(long = "totallimit")]
    pub total_limit: Option<String>,

    /// Download timeout in seconds.
    #[clap(short = 'e', long)]
    pub timeout: Option<u64>,

    /// Expected md5 of the whole file.
    #[clap(short, long)]
    pub md5: Option<String>,

    /// Identifier of the task, used instead of the md5 to deduplicate it.
    #[clap(short, long)]
    pub identifier: Option<String>,

    /// Name of the system that invoked dfget.
    #[clap(long = "callsystem")]
    pub call_system: Option<String>,

    /// Download pattern.
    #[clap(short, long, value_enum)]
    pub pattern: Option<Pattern>,

    /// Query parameters removed from the url to compute the task url.
    #[clap(short, long, value_delimiter = ',')]
    pub filter: Vec<String>,

    /// Header sent to the source, as `key:value`. Repeatable.
    #[clap(long = "header")]
    pub header: Vec<String>,

    /// Supernodes as `host[:port][=weight]`. Repeatable.
    #[clap(short, long, value_delimiter = ',')]
    pub node: Vec<String>,

    /// Never download from the source directly.
    #[clap(long)]
    pub notbs: bool,

    /// The request comes from dfdaemon.
    #[clap(long)]
    pub dfdaemon: bool,

    /// Skip certificate verification of the source.
    #[clap(long)]
    pub insecure: bool,

    /// Print a progress line while downloading.
    #[clap(short = 'b', long = "showbar")]
    pub show_bar: bool,

    /// Print logs to the console instead of the log file.
    #[clap(long)]
    pub console: bool,

    /// Enable debug logs.
    #[clap(long)]
    pub verbose: bool,

    /// Working directory, defaults to `$HOME/.small-dragonfly`.
    #[clap(long)]
    pub home: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct ServerArgs {
    /// IP the server binds to.
    #[clap(long)]
    pub ip: Option<String>,

    /// Port the server binds to, generated when 0.
    #[clap(long, default_value_t = 0)]
    pub port: u16,

    /// Path of the meta file that records the server port.
    #[clap(long)]
    pub meta: Option<PathBuf>,

    /// Directory holding the service files.
    #[clap(long)]
    pub data: Option<PathBuf>,

    /// Seconds after which a finished task file is removed.
    #[clap(long = "expiretime")]
    pub expire_time: Option<u64>,

    /// Seconds without uploads after which the server exits.
    #[clap(long = "alivetime")]
    pub alive_time: Option<u64>,

    /// Working directory, defaults to `$HOME/.small-dragonfly`.
    #[clap(long)]
    pub home: Option<PathBuf>,

    /// Print logs to the console instead of the log file.
    #[clap(long)]
    pub console: bool,

    /// Enable debug logs.
    #[clap(long)]
    pub verbose: bool,
}
