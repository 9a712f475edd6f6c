//! The peer server: uploads pieces of the files this host downloaded to the
//! other peers, and shares the upload bandwidth of the host between the
//! downloads running on it.
//!
//! One server runs per host. Downloaders find it through the port recorded
//! in the meta file and talk to it with [`crate::api::UploaderClient`].
use std::{
    future::IntoFuture,
    io::{self, ErrorKind, SeekFrom},
    path::Path,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, UNIX_EPOCH},
};

use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::{stream, StreamExt};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
    net::TcpListener,
    select, signal, spawn,
    sync::mpsc,
    time::{interval_at, sleep, timeout, Instant},
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, error, info, warn};

use crate::{
    api::{uploader::FinishTaskRequest, SupernodeClient, UploaderClient},
    codec::{header as piece_header, PIECE_TAIL},
    config::ServerConfig,
    constants::{
        header, CDN_SOURCE_SOURCE, GC_INTERVAL, LAUNCH_SERVER_RETRIES,
        LOCAL_HTTP_PATH_CHECK, LOCAL_HTTP_PATH_CLIENT, LOCAL_HTTP_PATH_RATE,
        LOCAL_HTTP_PING, PEER_HTTP_PATH_PREFIX, RATE_LIMITER_WINDOW, VERSION,
    },
    error::Error,
    limit_reader::LimitReader,
    meta::MetaStore,
    rate_limiter::{trans_rate, RateLimiter},
    utils::{generate_port, service_file},
};

pub mod launcher;
pub mod params;
pub mod registry;

pub use launcher::ServerLauncher;
pub use registry::{TaskConfig, TaskRegistry};

use params::{amend_range, parse_params};

const OCTET_STREAM: &str = "application/octet-stream";
/// Connections still open this long after the shutdown are dropped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// State shared by the handlers and the background loops of the server.
pub struct ServerCtx {
    pub config: ServerConfig,
    pub registry: TaskRegistry,
    pub api: SupernodeClient,
    /// Upload limit of the whole host, disabled until a downloader sets
    /// one.
    pub limiter: Arc<RateLimiter>,
    pub total_limit: AtomicI64,
    pub meta: MetaStore,
    /// Cancelled when the server must stop.
    pub shutdown: CancellationToken,
    alive: mpsc::UnboundedSender<()>,
}

impl ServerCtx {
    fn new(
        config: ServerConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<()>), Error> {
        let (alive, alive_rx) = mpsc::unbounded_channel();
        let ctx = Self {
            meta: MetaStore::new(&config.meta_path),
            config,
            registry: TaskRegistry::default(),
            api: SupernodeClient::new()?,
            limiter: Arc::new(RateLimiter::new(0, RATE_LIMITER_WINDOW)),
            total_limit: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
            alive,
        };
        Ok((Arc::new(ctx), alive_rx))
    }

    fn keep_alive(&self) {
        let _ = self.alive.send(());
    }

    /// Share the total limit between the running tasks, in proportion to
    /// the rate each one asked for.
    async fn calculate_rate_limit(&self, client_rate: i64) -> i64 {
        let total_limit = self.total_limit.load(Ordering::Relaxed);
        let total = self.registry.running_rate().await;

        if total > total_limit {
            return (client_rate * total_limit + total - 1) / total;
        }
        client_rate
    }

    async fn service_down(&self, task: &TaskConfig) {
        if task.super_node.is_empty() {
            return;
        }
        if let Err(e) = self
            .api
            .service_down(&task.super_node, &task.task_id, &task.cid)
            .await
        {
            warn!("service down of task {} to {}: {e}", task.task_id, task.super_node);
        }
    }

    /// Remove the sub directories of the data dir, the files of expired
    /// tasks and the files of no task at all.
    pub async fn gc(&self) -> Result<(), Error> {
        let mut entries = match fs::read_dir(&self.config.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                let _ = fs::remove_dir_all(&path).await;
                continue;
            }
            if self.delete_expired_file(&path, &meta).await {
                info!("server gc, delete file: {path:?}");
            }
        }
        Ok(())
    }

    async fn delete_expired_file(&self, path: &Path, meta: &std::fs::Metadata) -> bool {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = file_name.strip_suffix(".service").unwrap_or(&file_name);

        let Some(task) = self.registry.get(name).await else {
            let _ = fs::remove_file(path).await;
            return true;
        };
        if !task.finished {
            return false;
        }

        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        let last_access = task.access_time.max(modified);
        let idle = last_access.elapsed().unwrap_or_default();
        if idle <= self.config.data_expire_time {
            return false;
        }

        self.service_down(&task).await;
        let _ = fs::remove_file(path).await;
        self.registry.remove(name).await;
        true
    }

    /// Tell the supernodes this host stops serving, and forget the port.
    async fn close(&self) {
        for (name, task) in self.registry.snapshot().await {
            self.service_down(&task).await;
            let file = service_file(&name, &task.data_dir);
            let _ = fs::remove_file(&file).await;
            info!("shutdown, remove task id:{} file:{file:?}", task.task_id);
        }
        if let Err(e) = self.meta.update_service_port(0).await {
            warn!("failed to reset the port in {:?}: {e}", self.meta.path());
        }
    }
}

/// Result of trying to start a server.
pub enum Launch {
    New(PeerServer),
    /// Another server of this host already listens on the port.
    Existing(u16),
}

pub struct PeerServer {
    ctx: Arc<ServerCtx>,
    listener: TcpListener,
    alive: mpsc::UnboundedReceiver<()>,
    port: u16,
}

impl PeerServer {
    /// Bind the configured port, or up to 10 generated ones. A port taken
    /// by a server that answers the ping is reused instead.
    pub async fn bind(config: ServerConfig) -> Result<Launch, Error> {
        let (attempts, fixed) = if config.port > 0 {
            (1, true)
        } else {
            (LAUNCH_SERVER_RETRIES, false)
        };
        let uploader = UploaderClient::new()?;
        let ping_ip = local_ip(&config.ip);
        let mut last_err = None;

        for i in 0..attempts {
            let port = if fixed { config.port } else { generate_port(i) };

            match TcpListener::bind((config.ip.as_str(), port)).await {
                Ok(listener) => {
                    return Ok(Launch::New(Self::with_listener(config, listener)?));
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    if uploader.ping_server(ping_ip, port).await {
                        info!("reuse exist service with port:{port}");
                        return Ok(Launch::Existing(port));
                    }
                    warn!("start error:{e}, remain retry times:{}", attempts - i - 1);
                    last_err = Some(e);
                }
                Err(e) => return Err(Error::PeerServerLaunch(e.to_string())),
            }
        }

        Err(Error::PeerServerLaunch(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    pub fn with_listener(
        config: ServerConfig,
        listener: TcpListener,
    ) -> Result<Self, Error> {
        let port = listener.local_addr()?.port();
        let (ctx, alive) = ServerCtx::new(config)?;
        Ok(Self { ctx, listener, alive, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ctx(&self) -> Arc<ServerCtx> {
        self.ctx.clone()
    }

    /// Serve until a signal arrives, the shutdown token is cancelled, or
    /// no upload happened for the alive time.
    #[tracing::instrument(skip_all, name = "peer_server", fields(port = self.port))]
    pub async fn run(self) -> Result<(), Error> {
        let Self { ctx, listener, alive, port } = self;

        ctx.meta.update_service_port(port).await?;
        info!(
            "start peer server success, host:{} port:{port} expire:{}s alive:{}s",
            ctx.config.ip,
            ctx.config.data_expire_time.as_secs(),
            ctx.config.server_alive_time.as_secs()
        );

        let gc = spawn(gc_loop(ctx.clone()));
        let monitor = spawn(monitor_alive(ctx.clone(), alive));
        let signals = spawn(wait_signal(ctx.shutdown.clone()));

        let shutdown = ctx.shutdown.clone();
        let serve = axum::serve(listener, router(ctx.clone()))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .into_future();

        let res = select! {
            res = serve => res,
            _ = async {
                ctx.shutdown.cancelled().await;
                sleep(SHUTDOWN_GRACE).await;
            } => {
                warn!("connections still open, closing them");
                Ok(())
            }
        };

        gc.abort();
        monitor.abort();
        signals.abort();

        ctx.close().await;
        info!("peer server is shutdown.");
        Ok(res?)
    }
}

/// The server listens on every interface when bound to `0.0.0.0`, the
/// loopback reaches it.
fn local_ip(ip: &str) -> &str {
    if ip.is_empty() || ip == "0.0.0.0" {
        "127.0.0.1"
    } else {
        ip
    }
}

pub fn router(ctx: Arc<ServerCtx>) -> Router {
    Router::new()
        .route(&format!("{PEER_HTTP_PATH_PREFIX}*name"), get(upload))
        .route(&format!("{LOCAL_HTTP_PATH_RATE}*name"), get(parse_rate))
        .route(&format!("{LOCAL_HTTP_PATH_CHECK}*name"), get(check))
        .route(&format!("{LOCAL_HTTP_PATH_CLIENT}finish"), get(finish))
        .route(LOCAL_HTTP_PING, get(ping))
        .with_state(ctx)
}

fn header_str<'a>(headers: &'a HeaderMap, key: &str) -> &'a str {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

#[tracing::instrument(skip_all, name = "upload", fields(name = %name))]
async fn upload(
    State(ctx): State<Arc<ServerCtx>>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    ctx.keep_alive();

    let range = header_str(&headers, RANGE.as_str());
    debug!("upload range {range}");

    let mut up = parse_params(
        range,
        header_str(&headers, header::PIECE_NUM),
        header_str(&headers, header::PIECE_SIZE),
    )
    .inspect_err(|e| warn!("invalid param range:{range}: {e}"))?;

    let task = ctx
        .registry
        .touch(&name)
        .await
        .ok_or_else(|| Error::TaskNotFound(name.clone()))?;

    let path = service_file(&name, &task.data_dir);
    let size = fs::metadata(&path)
        .await
        .inspect_err(|e| error!("failed to open file:{path:?}: {e}"))?
        .len() as i64;

    let need_pad = header_str(&headers, header::CDN_SOURCE) != CDN_SOURCE_SOURCE;
    amend_range(size, need_pad, &mut up)?;

    let mut file = fs::File::open(&path).await?;
    file.seek(SeekFrom::Start(up.start as u64)).await?;

    let read_len =
        u32::try_from(up.read_len()).map_err(|_| Error::RangeNotSatisfiable)?;
    let body = LimitReader::new(
        file.take(u64::from(read_len)),
        Some(ctx.limiter.clone()),
        false,
    );

    let (head, tail) = if up.pad_size > 0 {
        let head = piece_header(read_len, up.piece_size as u32);
        (
            Some(Bytes::copy_from_slice(&head.to_be_bytes())),
            Some(Bytes::from_static(&[PIECE_TAIL])),
        )
    } else {
        (None, None)
    };

    let body = stream::iter(head.map(Ok::<_, io::Error>))
        .chain(ReaderStream::new(body))
        .chain(stream::iter(tail.map(Ok)));

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [
            (CONTENT_TYPE, OCTET_STREAM.to_owned()),
            (CONTENT_LENGTH, up.length.to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

async fn parse_rate(
    State(ctx): State<Arc<ServerCtx>>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> Result<String, Error> {
    ctx.keep_alive();

    let rate = header_str(&headers, header::RATE_LIMIT);
    let client_rate: i64 = rate
        .trim()
        .parse()
        .inspect_err(|e| error!("failed to convert rateLimit {rate}: {e}"))?;

    ctx.registry.set_rate(&name, client_rate).await;

    if ctx.total_limit.load(Ordering::Relaxed) <= 0 {
        return Ok(client_rate.to_string());
    }
    Ok(ctx.calculate_rate_limit(client_rate).await.to_string())
}

async fn check(
    State(ctx): State<Arc<ServerCtx>>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> String {
    ctx.keep_alive();

    let total_limit: i64 = header_str(&headers, header::TOTAL_LIMIT)
        .trim()
        .parse()
        .unwrap_or_default();
    if total_limit > 0 {
        ctx.limiter.set_rate(trans_rate(total_limit));
        ctx.total_limit.store(total_limit, Ordering::Relaxed);
        info!("update total limit to {total_limit}");
    }

    let data_dir = match header_str(&headers, header::DATA_DIR) {
        "" => ctx.config.data_dir.clone(),
        dir => dir.into(),
    };
    ctx.registry.put(name.clone(), TaskConfig::new(data_dir)).await;

    format!("{name}@{VERSION}")
}

async fn finish(
    State(ctx): State<Arc<ServerCtx>>,
    Query(req): Query<FinishTaskRequest>,
) -> Result<&'static str, Error> {
    if req.task_file_name.is_empty()
        || req.task_id.is_empty()
        || req.cid.is_empty()
        || req.super_node.is_empty()
    {
        return Err(Error::InvalidParams);
    }

    ctx.registry.finish(&req, &ctx.config.data_dir).await;
    info!("task {} of {} is finished", req.task_id, req.task_file_name);
    Ok("success")
}

async fn ping() -> &'static str {
    "success"
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            Error::InvalidParams | Error::InvalidValue(..) | Error::ParseInt(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Error::IO(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

async fn gc_loop(ctx: Arc<ServerCtx>) {
    info!("start server gc, expireTime:{}s", ctx.config.data_expire_time.as_secs());
    let mut interval = interval_at(Instant::now() + GC_INTERVAL, GC_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = ctx.gc().await {
            warn!("server gc error:{e}");
        }
    }
}

/// Stop the server once nothing was uploaded for the alive time.
async fn monitor_alive(ctx: Arc<ServerCtx>, mut alive: mpsc::UnboundedReceiver<()>) {
    let alive_time = ctx.config.server_alive_time;
    loop {
        select! {
            biased;
            _ = ctx.shutdown.cancelled() => return,
            token = timeout(alive_time, alive.recv()) => match token {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => {
                    info!("no more task, peer server will stop...");
                    ctx.shutdown.cancel();
                    return;
                }
            },
        }
    }
}

async fn wait_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("cannot listen to SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        _ = shutdown.cancelled() => return,
        _ = signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("received a signal, peer server will stop...");
    shutdown.cancel();
}
