use std::{path::Path, process::exit};

use clap::Parser;
use dragonfly::{
    args::{Args, Command, ServerArgs},
    config::{Config, FileConfig, ServerConfig},
    constants::SERVER_PORT_LINE,
    error::{DfgetError, Error},
    hub::Hub,
    uploader::{Launch, PeerServer, ServerLauncher},
};
use tracing::{error, info, Level};
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let res = match args.command {
        Some(Command::Server(server)) => run_server(server).await,
        None => download(args).await,
    };

    if let Err(e) = res {
        eprintln!("{e}");
        exit(e.code);
    }
}

async fn download(args: Args) -> Result<(), DfgetError> {
    let config = FileConfig::load()
        .and_then(|file| Config::from_args(args.download, file))
        .map_err(|e| DfgetError::new(DfgetError::PREPARE, e))?;

    let _guard = init_logger(
        &config.work_home,
        "dfget.log",
        config.console,
        config.verbose,
    );
    info!("dfget args: {:?}", std::env::args().collect::<Vec<_>>());

    let launcher = ServerLauncher::current_exe()
        .map_err(|e| DfgetError::new(DfgetError::PREPARE, e))?;
    let hub =
        Hub::new(config, launcher).map_err(|e| DfgetError::new(DfgetError::PREPARE, e))?;

    hub.get_file().await.inspect_err(|e| error!("download failed: {e}"))
}

async fn run_server(args: ServerArgs) -> Result<(), DfgetError> {
    let (console, verbose) = (args.console, args.verbose);
    let config = FileConfig::load()
        .and_then(|file| ServerConfig::from_args(args, file))
        .map_err(|e| DfgetError::new(DfgetError::LAUNCH_SERVER, e))?;

    let _guard = init_logger(&config.work_home, "dfserver.log", console, verbose);

    let launch = PeerServer::bind(config)
        .await
        .map_err(|e| DfgetError::new(DfgetError::LAUNCH_SERVER, e))?;

    match launch {
        // the downloader reads this line to learn the port
        Launch::Existing(port) => {
            println!("{SERVER_PORT_LINE} {port}");
            Ok(())
        }
        Launch::New(server) => {
            println!("{SERVER_PORT_LINE} {}", server.port());
            server
                .run()
                .await
                .map_err(|e| DfgetError::new(DfgetError::LAUNCH_SERVER, e))
        }
    }
}

/// Log into `{work_home}/logs/{file}`, or to the console.
fn init_logger(
    work_home: &Path,
    file: &str,
    console: bool,
    verbose: bool,
) -> Option<WorkerGuard> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    if console {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
        return None;
    }

    let dir = work_home.join("logs");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("{}", Error::FolderOpenError(format!("{dir:?}: {e}")));
        return None;
    }

    let appender = tracing_appender::rolling::never(dir, file);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .compact()
        .init();

    Some(guard)
}
