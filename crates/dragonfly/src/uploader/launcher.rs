//! Find the peer server of this host, or start one.
use std::{path::PathBuf, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    spawn,
    time::timeout,
};
use tracing::{error, info, warn};

use super::{Launch, PeerServer};
use crate::{
    api::UploaderClient,
    config::{Config, ServerConfig},
    constants::{SERVER_PORT_LINE, VERSION},
    error::Error,
    meta::MetaStore,
};

const READ_PORT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum ServerLauncher {
    /// Run `{exe} server` as a detached process that outlives this one.
    Process(PathBuf),
    /// Run the server on the current runtime.
    Embedded,
}

impl ServerLauncher {
    pub fn current_exe() -> Result<Self, Error> {
        Ok(Self::Process(std::env::current_exe()?))
    }

    /// Port of a peer server that serves this task, reusing the one
    /// recorded in the meta file when it answers.
    pub async fn launch(&self, config: &Config) -> Result<u16, Error> {
        if let Some(port) = check_peer_server_exist(config, 0).await {
            return Ok(port);
        }

        let port = match self {
            Self::Process(exe) => start_process(exe, config).await?,
            Self::Embedded => start_embedded(config).await?,
        };

        check_peer_server_exist(config, port)
            .await
            .ok_or_else(|| Error::PeerServerLaunch(format!("invalid server on port:{port}")))
    }
}

/// The configuration a downloader hands to the server it starts.
pub fn server_config(config: &Config) -> ServerConfig {
    let mut server = ServerConfig::new(&config.work_home);
    if !config.rv.local_ip.is_empty() {
        server.ip.clone_from(&config.rv.local_ip);
    }
    server.port = config.peer_port;
    server.meta_path.clone_from(&config.rv.meta_path);
    server.data_dir.clone_from(&config.rv.system_data_dir);
    server.data_expire_time = config.data_expire_time;
    server.server_alive_time = config.server_alive_time;
    server
}

fn local_ip(config: &Config) -> &str {
    if config.rv.local_ip.is_empty() {
        "127.0.0.1"
    } else {
        &config.rv.local_ip
    }
}

/// Register the task on the server at `port`, or at the port of the meta
/// file when `port` is 0. The server is usable when it echoes the task
/// file name.
pub async fn check_peer_server_exist(config: &Config, port: u16) -> Option<u16> {
    let port = match port {
        0 => MetaStore::new(&config.rv.meta_path).service_port().await,
        port => port,
    };
    if port == 0 {
        return None;
    }

    let uploader = UploaderClient::new().ok()?;
    let task_file_name = &config.rv.task_file_name;
    let res = uploader
        .check_server(
            local_ip(config),
            port,
            task_file_name,
            &config.rv.data_dir.to_string_lossy(),
            config.total_limit,
        )
        .await;

    match res {
        Ok(name) if &name == task_file_name => {
            info!("use peer server on port:{port}");
            Some(port)
        }
        Ok(_) => {
            warn!("not found process on port:{port}, version:{VERSION}");
            None
        }
        Err(e) => {
            info!("local http err:{e}, port:{port}");
            None
        }
    }
}

async fn start_process(exe: &std::path::Path, config: &Config) -> Result<u16, Error> {
    let server = server_config(config);

    let mut cmd = Command::new(exe);
    cmd.arg("server")
        .arg("--ip")
        .arg(&server.ip)
        .arg("--meta")
        .arg(&server.meta_path)
        .arg("--data")
        .arg(&server.data_dir)
        .arg("--expiretime")
        .arg(server.data_expire_time.as_secs().to_string())
        .arg("--alivetime")
        .arg(server.server_alive_time.as_secs().to_string())
        .arg("--home")
        .arg(&server.work_home)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if server.port > 0 {
        cmd.arg("--port").arg(server.port.to_string());
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::PeerServerLaunch(format!("{exe:?}: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::PeerServerLaunch("no stdout".into()))?;

    read_port(stdout).await
}

async fn start_embedded(config: &Config) -> Result<u16, Error> {
    match PeerServer::bind(server_config(config)).await? {
        Launch::Existing(port) => Ok(port),
        Launch::New(server) => {
            let port = server.port();
            spawn(async move {
                if let Err(e) = server.run().await {
                    error!("peer server stopped: {e}");
                }
            });
            Ok(port)
        }
    }
}

/// Read the `dfget uploader server port is {port}` line the server prints
/// once it listens.
pub async fn read_port<R: AsyncRead + Unpin>(r: R) -> Result<u16, Error> {
    let mut lines = BufReader::new(r).lines();
    let line = timeout(READ_PORT_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| Error::PeerServerLaunch("get peer server's port timeout".into()))??
        .unwrap_or_default();

    let line = line.trim();
    line.strip_prefix(SERVER_PORT_LINE)
        .and_then(|port| port.trim().parse().ok())
        .ok_or_else(|| Error::PeerServerLaunch(line.to_owned()))
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;

    #[tokio::test]
    async fn read_port_line() -> Result<(), Error> {
        let port = read_port(&b"dfget uploader server port is 15123\n"[..]).await?;
        assert_eq!(port, 15123);

        let err = read_port(&b"address already in use\n"[..]).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to launch the peer server: address already in use"
        );

        // nothing is printed
        let (_tx, rx) = tokio::io::duplex(64);
        assert!(read_port(rx).await.is_err());

        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"dfget uploader server port is 1").await?;
        drop(tx);
        assert_eq!(read_port(rx).await?, 1);
        Ok(())
    }

    fn download_config(home: &std::path::Path) -> Config {
        let mut config = Config::new("http://src/a.bin", home.join("a.bin"), home);
        config.rv.local_ip = "127.0.0.1".into();
        config.rv.task_file_name = "a.bin-1-1.000".into();
        config
    }

    #[tokio::test]
    async fn embedded_server_is_reused() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let mut config = download_config(dir.path());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        config.peer_port = listener.local_addr()?.port();
        drop(listener);

        let port = ServerLauncher::Embedded.launch(&config).await?;
        assert_eq!(port, config.peer_port);

        // the meta file now points at the server
        let mut start = std::time::Instant::now();
        while MetaStore::new(&config.rv.meta_path).service_port().await != port {
            assert!(start.elapsed() < Duration::from_secs(2));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        config.rv.task_file_name = "b.bin-1-1.000".into();
        start = std::time::Instant::now();
        let exe = dir.path().join("missing-exe");
        assert_eq!(ServerLauncher::Process(exe).launch(&config).await?, port);
        assert!(start.elapsed() < Duration::from_secs(2));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_prints_its_port() -> Result<(), Error> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let config = download_config(dir.path());

        // a running server, announced by a fake executable
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server =
            PeerServer::with_listener(ServerConfig::new(dir.path()), listener)?;
        let port = server.port();
        let ctx = server.ctx();
        spawn(server.run());

        let exe = dir.path().join("fake-dfget");
        std::fs::write(
            &exe,
            format!("#!/bin/sh\necho \"{SERVER_PORT_LINE} {port}\"\n"),
        )?;
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755))?;

        assert_eq!(ServerLauncher::Process(exe).launch(&config).await?, port);

        let silent = dir.path().join("silent-dfget");
        std::fs::write(&silent, "#!/bin/sh\nexit 1\n")?;
        std::fs::set_permissions(&silent, std::fs::Permissions::from_mode(0o755))?;
        let mut config = config;
        config.rv.meta_path = dir.path().join("nowhere").join("host.meta");
        assert!(ServerLauncher::Process(silent).launch(&config).await.is_err());

        ctx.shutdown.cancel();
        Ok(())
    }
}
