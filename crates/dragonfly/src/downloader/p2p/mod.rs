//! Download of a registered task from peers.
//!
//! The scheduler is a single loop that owns the piece set. It pulls piece
//! assignments from the supernode, spawns one [`PieceWorker`] per new
//! range, and acknowledges what the workers send back on the next pull.
//! Workers hand the pieces they fetched to a writer running in its own
//! task; the writer wakes the scheduler up every time a piece lands.
//!
//! ```text
//!  supernode <--pull/ack-- scheduler --spawn--> workers --pieces--> writer
//!                              ^                   |                  |
//!                              +------queue--------+                  |
//!                              +------notify--------------------------+
//! ```
use std::{
    io,
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use bytes::Bytes;
use hashbrown::HashMap;
use rand::Rng;
use tokio::{
    select,
    sync::{mpsc, Notify, Semaphore},
    time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::{
    client_writer::{FileWriter, FileWriterCtx},
    stream_writer::StreamWriter,
    worker::{PieceWorker, WorkerCtx},
    writer::{PieceWriter, WriterHandle},
};
use super::{
    move_file_checked, BackSourceDownloader, DownloadReader, Downloader,
    SharedReason,
};
use crate::{
    api::{
        types::{
            CdnSource, FinishData, PieceTask, PullPieceTaskRequest,
            PullPieceTaskResponse,
        },
        PeerClient, SupernodeClient, UploaderClient,
    },
    config::{BackSourceReason, Config},
    constants::{
        code, DEFAULT_MIN_RATE, RATE_LIMITER_WINDOW, RESERVED_DOWNLOAD_TIME,
    },
    counter::Counter,
    error::Error,
    piece::{Piece, PieceResult, PieceStatus, WriterMsg},
    rate_limiter::{trans_rate, RateLimiter},
    registrar::{RegisterResult, Registrar},
    utils::{
        calculate_routine_count, calculate_timeout, link, parse_headers,
        service_file, task_file,
    },
};

pub mod client_writer;
pub mod stream_writer;
pub mod target_writer;
pub mod worker;
pub mod writer;

/// How long the scheduler waits for a piece update before pulling anyway.
const POLL_TIMEOUT: Duration = Duration::from_secs(2);
const PULL_RATE_INTERVAL: Duration = Duration::from_secs(3);
/// Pulls retried in place before migrating to another supernode.
const PULL_RETRIES: usize = 2;
/// More in-flight pieces than this and acks are batched.
const MERGE_RUNNING_LIMIT: usize = 2;

const MIN_WAIT: Duration = Duration::from_millis(50);
const MAX_WAIT: Duration = Duration::from_millis(100);
const MIN_WAIT_CAP: Duration = Duration::from_millis(800);

/// Used when no timeout can be derived from the piece size.
const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// How the pull loop ended.
#[derive(Debug)]
enum Outcome {
    Finished(Option<FinishData>),
    /// A back source reason was set.
    BackSource,
}

pub struct P2pDownloader {
    config: Config,
    api: SupernodeClient,
    uploader: UploaderClient,
    registrar: Registrar,

    /// `host:port` of the supernode in charge of the task.
    node: String,
    task_id: String,
    cdn_source: CdnSource,

    /// Piece size before and after the last migration.
    piece_size_history: [i32; 2],
    /// `true` once a range was downloaded, `false` while it is in flight.
    piece_set: HashMap<String, bool>,
    total: i64,

    queue_tx: mpsc::UnboundedSender<Piece>,
    queue: mpsc::UnboundedReceiver<Piece>,
    notify: Arc<Notify>,

    limiter: Arc<RateLimiter>,
    pull_rate_time: Option<Instant>,
    min_wait: Duration,
    max_wait: Duration,

    reason: SharedReason,
    cancel: CancellationToken,
    counter: Arc<Counter>,
    peer: PeerClient,

    writer: Option<WriterHandle>,
    workers: Option<Arc<WorkerCtx>>,
    across_write: bool,
    client_file: PathBuf,
    service_file: PathBuf,
}

impl P2pDownloader {
    pub fn new(
        config: Config,
        api: SupernodeClient,
        registrar: Registrar,
        result: &RegisterResult,
        counter: Arc<Counter>,
    ) -> Result<Self, Error> {
        let (queue_tx, queue) = mpsc::unbounded_channel();
        queue_tx
            .send(Piece::simple(&result.task_id, &result.node, PieceStatus::Start))
            .map_err(|_| Error::WriterClosed)?;

        let peer_timeout = calculate_timeout(
            result.piece_size as i64,
            config.min_rate,
            DEFAULT_MIN_RATE as i64,
            RESERVED_DOWNLOAD_TIME,
        )
        .unwrap_or(PEER_TIMEOUT);
        let peer = PeerClient::new(peer_timeout, parse_headers(&config.headers))?;

        let client_file = task_file(&config.rv.task_file_name, &config.rv.data_dir);
        let service_file =
            service_file(&config.rv.task_file_name, &config.rv.data_dir);

        Ok(Self {
            limiter: Arc::new(RateLimiter::new(
                config.local_limit,
                RATE_LIMITER_WINDOW,
            )),
            uploader: UploaderClient::new()?,
            api,
            registrar,
            node: result.node.clone(),
            task_id: result.task_id.clone(),
            cdn_source: result.cdn_source,
            piece_size_history: [result.piece_size; 2],
            piece_set: HashMap::new(),
            total: 0,
            queue_tx,
            queue,
            notify: Arc::new(Notify::new()),
            pull_rate_time: None,
            min_wait: MIN_WAIT,
            max_wait: MAX_WAIT,
            reason: SharedReason::default(),
            cancel: CancellationToken::new(),
            counter,
            peer,
            writer: None,
            workers: None,
            across_write: false,
            client_file,
            service_file,
            config,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn reason(&self) -> BackSourceReason {
        self.reason.get()
    }

    /// Cancelling the token stops the loop and every worker.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn framed(&self) -> bool {
        self.cdn_source.is_framed()
    }

    /// Spawn `writer` and the context shared by the workers that feed it.
    fn start<W: PieceWriter>(&mut self, writer: W) {
        let handle = WriterHandle::spawn(
            writer,
            self.config.client_queue_size,
            self.notify.clone(),
            self.reason.clone(),
        );

        let slots = self.slots();
        debug!("at most {slots} pieces in flight");

        self.workers = Some(Arc::new(WorkerCtx {
            cid: self.config.rv.cid.clone(),
            cdn_source: self.cdn_source,
            peer: self.peer.clone(),
            api: self.api.clone(),
            limiter: self.limiter.clone(),
            queue: self.queue_tx.clone(),
            client_queue: handle.tx.clone(),
            slots: Arc::new(Semaphore::new(slots)),
            cancel: self.cancel.child_token(),
        }));
        self.writer = Some(handle);
    }

    /// Most ranges allowed in flight at once.
    fn slots(&self) -> usize {
        let file_length = self.counter.file_length.load(Ordering::Relaxed);
        calculate_routine_count(file_length, self.piece_size_history[1])
    }

    /// Stop the workers and the writer, without waiting for them.
    fn stop(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.cancel.cancel();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }

    #[tracing::instrument(skip_all, name = "scheduler", fields(task = %self.task_id))]
    async fn schedule(&mut self) -> Result<Outcome, Error> {
        let mut last_item: Option<Piece> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let (go_next, latest) = self.get_item(last_item.take()).await;
            last_item = latest;
            if !go_next {
                continue;
            }
            let Some(mut item) = last_item.take() else {
                continue;
            };
            item.content = Bytes::new();
            info!("downloading piece:{item}");

            match self.pull_piece_task(&mut item).await {
                Ok(res) if res.code == code::PEER_CONTINUE => {
                    self.process_piece(&res, &item).await;
                }
                Ok(res) if res.code == code::PEER_FINISH => {
                    return Ok(Outcome::Finished(res.finish_data()));
                }
                Ok(res) => {
                    warn!("request piece result code:{} msg:{:?}", res.code, res.msg);
                    if res.code == code::SOURCE_ERROR {
                        self.reason.set(BackSourceReason::SourceError);
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!("download piece fail: {e}");
                    if !self.reason.is_set() {
                        self.reason.set(BackSourceReason::DownloadError);
                    }
                }
            }

            if self.reason.is_set() {
                return Ok(Outcome::BackSource);
            }
        }
    }

    /// Wait for the next piece update and apply it to the piece set. Returns
    /// whether it is time to pull, along with the item to acknowledge.
    async fn get_item(&mut self, mut latest: Option<Piece>) -> (bool, Option<Piece>) {
        let mut need_merge = true;

        match timeout(POLL_TIMEOUT, self.queue.recv()).await {
            Ok(Some(mut item)) => {
                if item.piece_size != 0 && item.piece_size != self.piece_size_history[1] {
                    return (false, latest);
                }
                if item.super_node != self.node {
                    item.dst_cid.clear();
                    item.super_node.clone_from(&self.node);
                    item.task_id.clone_from(&self.task_id);
                }
                if !item.range.is_empty() {
                    match self.piece_set.get(&item.range).copied() {
                        None => {
                            warn!(
                                "pieceRange:{} is neither running nor success",
                                item.range
                            );
                            return (false, latest);
                        }
                        Some(false)
                            if matches!(
                                item.result,
                                PieceResult::SemiSuc | PieceResult::Suc
                            ) =>
                        {
                            self.total += item.raw_content(self.framed()).len() as i64;
                            self.piece_set.insert(item.range.clone(), true);
                        }
                        Some(false) => {
                            self.piece_set.remove(&item.range);
                        }
                        Some(true) => {}
                    }
                }
                latest = Some(item);
            }
            _ => {
                warn!("get item timeout({}s) from queue.", POLL_TIMEOUT.as_secs());
                need_merge = false;
            }
        }

        let Some(item) = &latest else {
            return (false, latest);
        };
        if item.result.is_terminal() {
            need_merge = false;
        }

        let running = self.piece_set.values().filter(|done| !**done).count();
        if need_merge && (!self.queue.is_empty() || running > MERGE_RUNNING_LIMIT) {
            return (false, latest);
        }
        (true, latest)
    }

    /// Acknowledge `item` and ask for more pieces. Waits through
    /// `PeerWait`, retries transport errors, and migrates to the next
    /// supernode on any other failure.
    async fn pull_piece_task(
        &mut self,
        item: &mut Piece,
    ) -> Result<PullPieceTaskResponse, Error> {
        loop {
            let req = PullPieceTaskRequest::ack(&self.config.rv.cid, item);
            let mut attempt = 0;

            let res = loop {
                let res = select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    res = self.api.pull_piece_task(&item.super_node, &req) => res,
                };

                match res {
                    Ok(res) if res.code == code::PEER_WAIT => {
                        self.sleep_interval().await?;
                    }
                    Ok(res) => break Some(res),
                    Err(e) if attempt < PULL_RETRIES => {
                        attempt += 1;
                        warn!("pull piece task error: {e}, retry {attempt}/{PULL_RETRIES}");
                    }
                    Err(e) => {
                        error!("pull piece task error: {e}");
                        break None;
                    }
                }
            };

            match res {
                Some(res)
                    if matches!(
                        res.code,
                        code::PEER_CONTINUE
                            | code::PEER_FINISH
                            | code::SOURCE_ERROR
                            | code::SUCCESS
                    ) =>
                {
                    return Ok(res)
                }
                res => {
                    error!(
                        "pull piece task fail:{:?} and will migrate",
                        res.map(|r| r.code)
                    );
                    let result = self.registrar.register().await?;
                    self.piece_size_history[1] = result.piece_size;
                    item.status = PieceStatus::Start;
                    item.super_node = result.node;
                    item.task_id = result.task_id;
                    info!("migrated to node:{}", item.super_node);
                }
            }
        }
    }

    /// Sleep `U[min, max]` or until a piece was written, then back off.
    async fn sleep_interval(&mut self) -> Result<(), Error> {
        let ms = rand::thread_rng()
            .gen_range(self.min_wait.as_millis()..=self.max_wait.as_millis());
        let wait = Duration::from_millis(ms as u64);
        debug!("peer wait, sleep {:.3}s", wait.as_secs_f64());

        select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.notify.notified() => {}
            _ = sleep(wait) => {}
        }

        if self.min_wait < MIN_WAIT_CAP {
            self.min_wait *= 2;
            self.max_wait *= 2;
        }
        Ok(())
    }

    async fn process_piece(&mut self, res: &PullPieceTaskResponse, item: &Piece) {
        self.refresh(item).await;

        let tasks = res.continue_data().unwrap_or_default();
        debug!("pieces to be processed: {}", tasks.len());

        let slots = self.slots();
        let mut running = self.piece_set.values().filter(|done| !**done).count();
        let mut has_task = false;
        let mut already_downloaded = Vec::new();
        let mut deferred = 0;

        for task in tasks {
            match self.piece_set.get(&task.range).copied() {
                Some(true) => {
                    let piece = Piece::new(
                        &self.task_id,
                        &self.node,
                        &task.cid,
                        &task.range,
                        PieceResult::SemiSuc,
                        PieceStatus::Running,
                    );
                    already_downloaded.push(task.range);
                    let _ = self.queue_tx.send(piece);
                }
                Some(false) => {}
                // handed out again by a later pull
                None if running >= slots => deferred += 1,
                None => {
                    running += 1;
                    self.piece_set.insert(task.range.clone(), false);
                    self.get_pull_rate(&task).await;
                    self.start_task(task);
                    has_task = true;
                }
            }
        }

        if !has_task {
            warn!("has not available pieceTask, maybe resource lack");
        }
        if !already_downloaded.is_empty() {
            warn!("already downloaded pieces:{already_downloaded:?}");
        }
        if deferred > 0 {
            debug!("{deferred} pieces deferred, {running}/{slots} running");
        }
    }

    fn start_task(&self, task: PieceTask) {
        let Some(ctx) = &self.workers else {
            return;
        };
        let worker = PieceWorker::new(ctx.clone(), &self.task_id, &self.node, task);
        tokio::spawn(worker.run());
    }

    /// After a migration that changed the piece size, everything written
    /// so far is void.
    async fn refresh(&mut self, item: &Piece) {
        if self.piece_size_history[0] != self.piece_size_history[1] {
            info!(
                "piece size changed from {} to {}, reset",
                self.piece_size_history[0], self.piece_size_history[1]
            );
            self.piece_size_history[0] = self.piece_size_history[1];

            if let Some(writer) = &self.writer {
                if writer.tx.send(WriterMsg::Reset).await.is_err() {
                    warn!("writer is gone, cannot reset it");
                }
            }
            self.piece_set.clear();
            self.total = 0;
        }

        if self.node != item.super_node {
            self.node.clone_from(&item.super_node);
            self.task_id.clone_from(&item.task_id);
        }
    }

    /// Ask the local peer server for this task's share of the host
    /// bandwidth, at most once every few seconds.
    async fn get_pull_rate(&mut self, task: &PieceTask) {
        if self.pull_rate_time.is_some_and(|t| t.elapsed() < PULL_RATE_INTERVAL) {
            return;
        }
        self.pull_rate_time = Some(Instant::now());

        let local_rate = [self.config.local_limit, task.down_link * 1024]
            .into_iter()
            .filter(|rate| *rate > 0)
            .min()
            .unwrap_or_default();

        let rv = &self.config.rv;
        if rv.peer_port == 0 {
            self.limiter.set_rate(trans_rate(local_rate));
            return;
        }

        let start = Instant::now();
        match self
            .uploader
            .parse_rate(&rv.local_ip, rv.peer_port, &rv.task_file_name, local_rate)
            .await
        {
            Ok(rate) => {
                info!(
                    "pull rate result:{rate} cost:{:.3}s",
                    start.elapsed().as_secs_f64()
                );
                self.limiter.set_rate(trans_rate(rate));
            }
            Err(e) => {
                error!("failed to pull rate: {e}");
                self.limiter.set_rate(trans_rate(local_rate));
            }
        }
    }

    /// Wait for the writer, then move the file into the target.
    async fn finish_task(&mut self, data: Option<FinishData>) -> Result<(), Error> {
        let start = Instant::now();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finish().await {
                warn!("client writer failed: {e}");
            }
        }
        info!(
            "wait client writer finish cost:{:.3}s, downloaded:{}",
            start.elapsed().as_secs_f64(),
            self.total
        );

        if self.reason.is_set() {
            return Ok(());
        }

        if let Some(data) = data.filter(|d| !d.md5.is_empty()) {
            if self.config.md5.as_deref().map_or(true, str::is_empty) {
                self.config.md5 = Some(data.md5.to_lowercase());
            }
        }

        let src = if self.across_write || !self.config.is_p2p() {
            self.config.rv.temp_target.clone()
        } else {
            if tokio::fs::metadata(&self.client_file).await.is_err() {
                warn!("client file {:?} not found", self.client_file);
                if let Err(e) = link(&self.service_file, &self.client_file).await {
                    warn!("hard link failed: {e}, copy instead");
                    tokio::fs::copy(&self.service_file, &self.client_file).await?;
                }
            }
            self.client_file.clone()
        };

        let res = move_file_checked(
            &src,
            &self.config.rv.real_target,
            self.config.md5.as_deref(),
        )
        .await;
        match res {
            Ok(()) => {
                info!("download successfully from dragonfly");
                Ok(())
            }
            Err(e @ Error::Md5NotMatch { .. }) => {
                error!("{e}");
                self.reason.set(BackSourceReason::Md5NotMatch);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn back_source(&mut self) -> Result<(), Error> {
        self.stop();
        let reason = self.reason.get();
        warn!("download from source, reason:{reason}");
        BackSourceDownloader::new(&self.config, reason).run().await
    }

    async fn file_writer(&self) -> Result<FileWriter, Error> {
        let rv = &self.config.rv;
        FileWriter::new(FileWriterCtx {
            cid: rv.cid.clone(),
            client_file: self.client_file.clone(),
            service_file: self.service_file.clone(),
            temp_target: rv.temp_target.clone(),
            p2p: self.config.is_p2p(),
            framed: self.framed(),
            queue_size: self.config.client_queue_size,
            api: self.api.clone(),
            counter: self.counter.clone(),
            reason: self.reason.clone(),
        })
        .await
    }

    /// The stream side of [`Downloader::run_stream`], running in its own
    /// task.
    async fn stream(&mut self) -> Result<(), Error> {
        let res = self.schedule().await;
        let res = match res {
            Ok(Outcome::Finished(_)) => match self.writer.take() {
                Some(writer) => writer.finish().await,
                None => Ok(()),
            },
            Ok(Outcome::BackSource) => Ok(()),
            Err(e) => Err(e),
        };
        self.stop();

        // the bytes already read cannot be taken back
        if self.reason.is_set() {
            return Err(Error::P2pFailed(self.reason.get()));
        }
        res
    }
}

impl Downloader for P2pDownloader {
    async fn run(&mut self) -> Result<(), Error> {
        match self.file_writer().await {
            Ok(writer) => {
                self.across_write = writer.across_write();
                self.start(writer);
            }
            Err(e) => {
                error!("init client writer: {e}");
                self.reason.set(BackSourceReason::InitError);
                return self.back_source().await;
            }
        }

        match self.schedule().await? {
            Outcome::Finished(data) => self.finish_task(data).await?,
            Outcome::BackSource => {}
        }

        if self.reason.is_set() {
            return self.back_source().await;
        }
        Ok(())
    }

    async fn run_stream(mut self) -> Result<DownloadReader, Error> {
        let (pipe, reader) = stream_writer::pipe(
            self.config.client_queue_size,
            self.config.md5.clone(),
        );
        let writer = StreamWriter::new(
            pipe.clone(),
            self.framed(),
            &self.config.rv.cid,
            self.api.clone(),
            self.counter.clone(),
        );
        self.start(writer);

        tokio::spawn(async move {
            if let Err(e) = self.stream().await {
                error!("stream download failed: {e}");
                let _ = pipe.send(Err(io::Error::other(e.to_string()))).await;
            }
        });
        Ok(reader)
    }

    async fn cleanup(&mut self) {
        self.cancel.cancel();
        self.stop();
        if let Err(e) = tokio::fs::remove_file(&self.config.rv.temp_target).await {
            debug!("remove temp target: {e}");
        }
    }
}
