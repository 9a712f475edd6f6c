//! Entry points of a download: prepare the runtime variables, register the
//! task, download it with the right downloader, then tell the peer server
//! and the supernode how it went.
use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use rand::Rng;
use time::{macros::format_description, OffsetDateTime, UtcOffset};
use tokio::{
    fs,
    task::JoinHandle,
    time::{interval, sleep, Instant},
};
use tracing::{error, info, warn};

use crate::{
    api::{
        types::TaskMetricsRequest, uploader::FinishTaskRequest, SupernodeClient,
        UploaderClient,
    },
    config::{BackSourceReason, Config, Pattern},
    constants::{code, DEFAULT_MIN_RATE, RESERVED_DOWNLOAD_TIME, VERSION},
    counter::Counter,
    downloader::{
        download_with_timeout, BackSourceDownloader, DownloadReader, Downloader,
        P2pDownloader,
    },
    error::{DfgetError, Error},
    locator::{weighted_nodes, Locator},
    registrar::{RegisterResult, Registrar},
    uploader::ServerLauncher,
    utils::{calculate_timeout, check_connect, cid, task_file_name, task_url},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

pub struct Hub {
    config: Config,
    api: SupernodeClient,
    launcher: ServerLauncher,
    counter: Arc<Counter>,
    reason: BackSourceReason,
    /// Supernode and task id in charge once the download ends.
    node: String,
    task_id: String,
}

impl Hub {
    pub fn new(config: Config, launcher: ServerLauncher) -> Result<Self, Error> {
        Ok(Self {
            config,
            api: SupernodeClient::new()?,
            launcher,
            counter: Arc::new(Counter::new(0)),
            reason: BackSourceReason::None,
            node: String::new(),
            task_id: String::new(),
        })
    }

    /// Download the file into the output path.
    pub async fn get_file(mut self) -> Result<(), DfgetError> {
        self.print_banner();

        self.prepare()
            .await
            .map_err(|e| DfgetError::new(DfgetError::PREPARE, e))?;

        let start = Instant::now();
        let registered = match self.register().await {
            Ok(registered) => registered,
            Err(e) => {
                self.cleanup().await;
                return Err(DfgetError::new(DfgetError::REGISTER, e));
            }
        };

        let progress = self.show_progress();
        let res = self.download(registered).await;
        if let Some(progress) = progress {
            progress.abort();
            println!();
        }

        self.report_metrics(res.is_ok(), start.elapsed()).await;
        self.cleanup().await;

        match res {
            Ok(()) => {
                println!(
                    "download SUCCESS cost:{:.3}s length:{} reason:{}",
                    start.elapsed().as_secs_f64(),
                    self.counter.total_downloaded.load(Ordering::Relaxed),
                    self.reason.code()
                );
                Ok(())
            }
            Err(e) => {
                error!("download FAIL: {e}");
                Err(DfgetError::new(DfgetError::DOWNLOAD, e))
            }
        }
    }

    /// Download in the background and return the bytes of the file in
    /// order. Nothing is written to the output path and nothing is
    /// uploaded to other peers.
    pub async fn get_reader(mut self) -> Result<DownloadReader, DfgetError> {
        self.config.rv.stream_mode = true;
        self.print_banner();

        self.prepare()
            .await
            .map_err(|e| DfgetError::new(DfgetError::PREPARE, e))?;
        let registered = self
            .register()
            .await
            .map_err(|e| DfgetError::new(DfgetError::REGISTER, e))?;

        let deadline = self.deadline();
        let res = match registered {
            None => {
                BackSourceDownloader::new(&self.config, self.reason)
                    .run_stream()
                    .await
            }
            Some((registrar, result)) => {
                let downloader = P2pDownloader::new(
                    self.config.clone(),
                    self.api.clone(),
                    registrar,
                    &result,
                    self.counter.clone(),
                )
                .map_err(|e| DfgetError::new(DfgetError::DOWNLOAD, e))?;

                if let Some(deadline) = deadline {
                    let cancel = downloader.cancel_token();
                    tokio::spawn(async move {
                        sleep(deadline).await;
                        cancel.cancel();
                    });
                }
                downloader.run_stream().await
            }
        };
        res.map_err(|e| DfgetError::new(DfgetError::DOWNLOAD, e))
    }

    fn print_banner(&self) {
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        let start = OffsetDateTime::from(self.config.start_time).to_offset(offset);
        let start = start.format(&format).unwrap_or_default();
        println!("--{start}--  {}", self.config.url);
    }

    /// Create the directories and compute the runtime variables.
    #[tracing::instrument(skip_all, name = "prepare")]
    async fn prepare(&mut self) -> Result<(), Error> {
        info!("dfget version:{VERSION}");
        info!("workspace:{:?} sign:{}", self.config.work_home, self.config.sign);

        let config = &mut self.config;
        let rv = &mut config.rv;

        if !rv.stream_mode {
            info!("target file path:{:?}", config.output);
            rv.real_target.clone_from(&config.output);
            rv.target_dir = config
                .output
                .parent()
                .map(Path::to_path_buf)
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from("."));
            fs::create_dir_all(&rv.target_dir).await?;
            rv.temp_target = create_temp_target(&rv.target_dir, &config.sign).await?;
        } else {
            rv.real_target.clone_from(&config.output);
        }

        if let Some(dir) = rv.meta_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::create_dir_all(&config.work_home).await?;
        fs::create_dir_all(&rv.system_data_dir).await?;
        rv.data_dir.clone_from(&rv.system_data_dir);

        rv.local_ip = check_connect_supernode(&config.nodes).await;
        rv.cid = cid(&rv.local_ip, &config.sign);
        rv.task_file_name = task_file_name(&rv.real_target, &config.sign);
        rv.task_url = task_url(&config.url, &config.filter);
        info!("runtime variables: {rv:?}");
        Ok(())
    }

    /// Register the task. `None` means the file must come from the source,
    /// for the reason recorded in `self.reason`.
    #[tracing::instrument(skip_all, name = "register")]
    async fn register(
        &mut self,
    ) -> Result<Option<(Registrar, RegisterResult)>, Error> {
        if self.config.pattern == Pattern::Source {
            self.reason = BackSourceReason::UserSpecified;
            warn!("register fail but try to download from source, reason:{}", self.reason);
            return Ok(None);
        }

        let locator = Locator::from_config(&self.config.nodes)?;
        if locator.is_empty() {
            self.reason = BackSourceReason::NodeEmpty;
            warn!("register fail but try to download from source, reason:{}", self.reason);
            return Ok(None);
        }

        if self.config.is_p2p() && !self.config.rv.stream_mode {
            match self.launcher.launch(&self.config).await {
                Ok(port) => self.config.rv.peer_port = port,
                Err(e) => {
                    warn!("start peer server error:{e}, change to CDN pattern");
                    self.config.rv.peer_port = 0;
                    self.config.pattern = Pattern::Cdn;
                }
            }
        }

        let mut registrar = Registrar::new(self.api.clone(), locator, &self.config);
        match registrar.register().await {
            Ok(result) => {
                self.config.rv.file_length = result.file_length;
                self.counter.file_length.store(result.file_length, Ordering::Relaxed);
                self.node.clone_from(&result.node);
                self.task_id.clone_from(&result.task_id);
                println!(
                    "client:{} connected to node:{}",
                    self.config.rv.local_ip, result.node
                );
                Ok(Some((registrar, result)))
            }
            Err(Error::NeedAuth) => Err(Error::NeedAuth),
            Err(e) if self.config.notbs => Err(e),
            Err(e) => {
                self.reason = BackSourceReason::RegisterFail;
                warn!("register fail but try to download from source, reason:{}({e})", self.reason);
                Ok(None)
            }
        }
    }

    /// The user timeout, or the time needed at the minimal rate.
    fn deadline(&self) -> Option<Duration> {
        self.config.timeout.or_else(|| {
            calculate_timeout(
                self.config.rv.file_length,
                self.config.min_rate,
                DEFAULT_MIN_RATE as i64,
                RESERVED_DOWNLOAD_TIME,
            )
        })
    }

    async fn download(
        &mut self,
        registered: Option<(Registrar, RegisterResult)>,
    ) -> Result<(), Error> {
        let deadline = self.deadline();

        let Some((registrar, result)) = registered else {
            let mut downloader = BackSourceDownloader::new(&self.config, self.reason);
            return download_with_timeout(&mut downloader, deadline).await;
        };

        println!("start download by dragonfly...");
        let mut downloader = P2pDownloader::new(
            self.config.clone(),
            self.api.clone(),
            registrar,
            &result,
            self.counter.clone(),
        )?;
        let res = download_with_timeout(&mut downloader, deadline).await;

        self.reason = downloader.reason();
        self.node = downloader.node().to_owned();
        self.task_id = downloader.task_id().to_owned();

        if res.is_ok() && !self.reason.is_set() {
            self.report_finished_task().await;
        }
        res
    }

    /// Let the peer server upload the file to other peers.
    async fn report_finished_task(&self) {
        let rv = &self.config.rv;
        if !self.config.is_p2p() || rv.peer_port == 0 {
            return;
        }

        let req = FinishTaskRequest {
            task_file_name: rv.task_file_name.clone(),
            task_id: self.task_id.clone(),
            cid: rv.cid.clone(),
            super_node: self.node.clone(),
        };
        let ip = if rv.local_ip.is_empty() { "127.0.0.1" } else { &rv.local_ip };

        let res = match UploaderClient::new() {
            Ok(uploader) => uploader.finish_task(ip, rv.peer_port, &req).await,
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => info!("report finished task success"),
            Err(e) => warn!("report finished task {} to {ip}:{}: {e}", req.task_id, rv.peer_port),
        }
    }

    /// Sent to the supernode in charge, or to the first configured one
    /// that accepts it.
    async fn report_metrics(&self, success: bool, duration: Duration) {
        let mut nodes = Vec::new();
        if !self.node.is_empty() {
            nodes.push(self.node.clone());
        }
        if let Ok(entries) = weighted_nodes(&self.config.nodes) {
            for addr in entries.iter().map(|e| e.addr()) {
                if !nodes.contains(&addr) {
                    nodes.push(addr);
                }
            }
        }

        let rv = &self.config.rv;
        let req = TaskMetricsRequest {
            backsource_reason: self.reason.report_code(self.config.notbs).to_string(),
            call_system: self.config.call_system.clone(),
            cid: rv.cid.clone(),
            duration: duration.as_secs_f64(),
            file_length: rv.file_length,
            ip: rv.local_ip.clone(),
            port: rv.peer_port,
            success,
            task_id: self.task_id.clone(),
        };

        for node in nodes {
            match self.api.report_metrics(&node, &req).await {
                Ok(res) if res.code == code::SUCCESS => return,
                Ok(res) => warn!("report metrics to {node}: code {}", res.code),
                Err(e) => warn!("report metrics to {node}: {e}"),
            }
        }
    }

    fn show_progress(&self) -> Option<JoinHandle<()>> {
        if !self.config.show_bar {
            return None;
        }
        let counter = self.counter.clone();
        Some(tokio::spawn(async move {
            let mut interval = interval(PROGRESS_INTERVAL);
            loop {
                interval.tick().await;
                counter.update_rates().await;
                print!("\r{}", counter.progress_line());
                let _ = std::io::stdout().flush();
            }
        }))
    }

    async fn cleanup(&self) {
        let temp = &self.config.rv.temp_target;
        if !temp.as_os_str().is_empty() && fs::remove_file(temp).await.is_ok() {
            info!("removed temp target {temp:?}");
        }
    }
}

/// Reserve `dfget-{sign}.tmp-{random}` in the target dir.
async fn create_temp_target(dir: &Path, sign: &str) -> Result<PathBuf, Error> {
    let mut last_err = None;
    for _ in 0..3 {
        let suffix: u64 = rand::thread_rng().gen();
        let path = dir.join(format!("dfget-{sign}.tmp-{suffix}"));
        match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => return Ok(path),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .map(Error::IO)
        .unwrap_or_else(|| Error::FolderOpenError(dir.display().to_string())))
}

/// Local ip of the first supernode that accepts a connection, empty when
/// none does.
async fn check_connect_supernode(nodes: &[String]) -> String {
    let Ok(entries) = weighted_nodes(nodes) else {
        return String::new();
    };
    for entry in entries {
        match check_connect(&entry.host, entry.port, CONNECT_TIMEOUT).await {
            Ok(ip) => return ip,
            Err(e) => error!("connect to node:{entry} error: {e}"),
        }
    }
    String::new()
}
