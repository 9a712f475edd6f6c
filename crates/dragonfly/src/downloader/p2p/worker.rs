use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    select,
    sync::{mpsc, Semaphore},
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    api::{
        types::{CdnSource, ClientErrorRequest, PieceTask},
        PeerClient, SupernodeClient,
    },
    constants::{CLIENT_ERROR_FILE_MD5_NOT_MATCH, CLIENT_ERROR_FILE_NOT_EXIST},
    error::Error,
    piece::{Piece, PieceResult, PieceStatus, WriterMsg},
    rate_limiter::RateLimiter,
    utils::check_connect,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Delay before a failed piece goes back to the scheduler.
const FAIL_DELAY: Duration = Duration::from_millis(20);

/// What every worker of one download shares.
#[derive(Debug, Clone)]
pub struct WorkerCtx {
    pub cid: String,
    pub cdn_source: CdnSource,
    pub peer: PeerClient,
    pub api: SupernodeClient,
    pub limiter: Arc<RateLimiter>,
    /// Results for the scheduler.
    pub queue: mpsc::UnboundedSender<Piece>,
    /// Pieces for the writer.
    pub client_queue: mpsc::Sender<WriterMsg>,
    /// Caps the number of pieces in flight.
    pub slots: Arc<Semaphore>,
    pub cancel: CancellationToken,
}

/// Fetches one assigned piece.
#[derive(Debug)]
pub struct PieceWorker {
    ctx: Arc<WorkerCtx>,
    task_id: String,
    /// Supernode that assigned the piece, as `host:port`.
    node: String,
    task: PieceTask,
}

impl PieceWorker {
    pub fn new(
        ctx: Arc<WorkerCtx>,
        task_id: impl Into<String>,
        node: impl Into<String>,
        task: PieceTask,
    ) -> Self {
        Self { ctx, task_id: task_id.into(), node: node.into(), task }
    }

    #[tracing::instrument(skip_all, name = "worker", fields(range = %self.task.range))]
    pub async fn run(self) {
        let cancel = self.ctx.cancel.clone();
        let slots = self.ctx.slots.clone();

        let _permit = select! {
            biased;
            _ = cancel.cancelled() => return,
            permit = slots.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let start = Instant::now();
        let res = select! {
            biased;
            _ = cancel.cancelled() => return,
            res = self.download() => res,
        };

        match res {
            Ok(content) => {
                debug!(
                    "got {} bytes from {}:{} in {:.3}s",
                    content.len(),
                    self.task.peer_ip,
                    self.task.peer_port,
                    start.elapsed().as_secs_f64()
                );
                let piece = self.success_piece(content);

                // blocks while the writer is behind
                let sent = select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = self.ctx.client_queue.send(WriterMsg::Piece(piece.clone())) => sent,
                };
                if sent.is_err() {
                    warn!("writer is gone, dropping the piece");
                    return;
                }
                let _ = self.ctx.queue.send(piece);
            }
            Err(e) => {
                error!(
                    "read piece error: {e} from {}:{}, wait {}ms",
                    self.task.peer_ip,
                    self.task.peer_port,
                    FAIL_DELAY.as_millis()
                );
                if let Some(req) = self.client_error(&e) {
                    let api = self.ctx.api.clone();
                    let node = self.node.clone();
                    tokio::spawn(async move {
                        if let Err(e) = api.report_client_error(&node, &req).await {
                            warn!("report client error to {node}: {e}");
                        }
                    });
                }
                sleep(FAIL_DELAY).await;
                let _ = self.ctx.queue.send(self.fail_piece());
            }
        }
    }

    async fn download(&self) -> Result<Bytes, Error> {
        let host = self.node.split(':').next().unwrap_or_default();

        // the supernode is known to be up
        if self.task.peer_ip != host {
            check_connect(&self.task.peer_ip, self.task.peer_port, CONNECT_TIMEOUT)
                .await?;
        }

        self.ctx
            .peer
            .download(&self.task, self.ctx.cdn_source, Some(self.ctx.limiter.clone()))
            .await
    }

    fn success_piece(&self, content: Bytes) -> Piece {
        let mut piece = Piece::new(
            &self.task_id,
            &self.node,
            &self.task.cid,
            &self.task.range,
            PieceResult::SemiSuc,
            PieceStatus::Running,
        );
        piece.piece_size = self.task.piece_size;
        piece.piece_num = self.task.piece_num;
        piece.content = content;
        piece
    }

    fn fail_piece(&self) -> Piece {
        let mut piece = Piece::new(
            &self.task_id,
            &self.node,
            &self.task.cid,
            &self.task.range,
            PieceResult::Fail,
            PieceStatus::Running,
        );
        piece.piece_size = self.task.piece_size;
        piece.piece_num = self.task.piece_num;
        piece
    }

    /// Failures the supernode must hear about, so it stops sending this
    /// peer. Any 4xx means the peer cannot serve the piece at all.
    fn client_error(&self, e: &Error) -> Option<ClientErrorRequest> {
        let base = ClientErrorRequest {
            src_cid: self.ctx.cid.clone(),
            dst_cid: self.task.cid.clone(),
            task_id: self.task_id.clone(),
            ..Default::default()
        };

        match e {
            Error::PeerStatus(400..=499) | Error::RangeNotSatisfiable => {
                Some(ClientErrorRequest {
                    error_type: CLIENT_ERROR_FILE_NOT_EXIST.to_owned(),
                    dst_ip: self.task.peer_ip.clone(),
                    range: self.task.range.clone(),
                    ..base
                })
            }
            Error::PieceMd5NotMatch { real, expected } => Some(ClientErrorRequest {
                error_type: CLIENT_ERROR_FILE_MD5_NOT_MATCH.to_owned(),
                dst_ip: self.task.peer_ip.clone(),
                range: self.task.range.clone(),
                real_md5: real.clone(),
                expected_md5: expected.clone(),
                ..base
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        extract::{Query, State},
        http::StatusCode,
        routing::get,
        Json, Router,
    };
    use std::collections::HashMap;

    use serde_json::json;
    use tokio::{net::TcpListener, sync::Mutex};

    use super::*;
    use crate::{
        codec::{encode, md5_hex},
        constants::RATE_LIMITER_WINDOW,
    };

    type Errors = HashMap<String, String>;

    async fn serve(app: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });
        port
    }

    /// A peer serving `hello` and a supernode recording client errors.
    async fn fixtures() -> (u16, u16, Arc<Mutex<Vec<Errors>>>) {
        let peer = Router::new()
            .route(
                "/ok",
                get(|| async { (StatusCode::PARTIAL_CONTENT, encode(b"hello", 10)) }),
            )
            .route("/gone", get(|| async { StatusCode::NOT_FOUND }))
            .route("/range", get(|| async { StatusCode::RANGE_NOT_SATISFIABLE }))
            .route("/forbidden", get(|| async { StatusCode::FORBIDDEN }))
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));

        let errors = Arc::new(Mutex::new(Vec::new()));
        let supernode = Router::new()
            .route(
                "/peer/piece/error",
                get(
                    |State(errors): State<Arc<Mutex<Vec<Errors>>>>,
                     Query(q): Query<Errors>| async move {
                        errors.lock().await.push(q);
                        Json(json!({"code": 200}))
                    },
                ),
            )
            .with_state(errors.clone());

        (serve(peer).await, serve(supernode).await, errors)
    }

    fn ctx(
        cancel: CancellationToken,
    ) -> (Arc<WorkerCtx>, mpsc::UnboundedReceiver<Piece>, mpsc::Receiver<WriterMsg>) {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (client_queue, client_rx) = mpsc::channel(4);
        let ctx = WorkerCtx {
            cid: "src".into(),
            cdn_source: CdnSource::Supernode,
            peer: PeerClient::new(Duration::from_secs(5), vec![]).unwrap(),
            api: SupernodeClient::new().unwrap(),
            limiter: Arc::new(RateLimiter::new(0, RATE_LIMITER_WINDOW)),
            queue,
            client_queue,
            slots: Arc::new(Semaphore::new(2)),
            cancel,
        };
        (Arc::new(ctx), queue_rx, client_rx)
    }

    fn task(port: u16, path: &str, md5: &str) -> PieceTask {
        PieceTask {
            range: "0-9".into(),
            piece_num: 0,
            piece_size: 10,
            piece_md5: md5.into(),
            cid: "dst".into(),
            peer_ip: "127.0.0.1".into(),
            peer_port: port,
            path: path.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn success_goes_to_both_queues() -> Result<(), Error> {
        let (peer, supernode, _) = fixtures().await;
        let (ctx, mut queue, mut client) = ctx(CancellationToken::new());
        let node = format!("127.0.0.1:{supernode}");

        PieceWorker::new(ctx, "t1", &node, task(peer, "/ok", &md5_hex(b"hello")))
            .run()
            .await;

        let Some(WriterMsg::Piece(written)) = client.recv().await else {
            panic!("nothing was written");
        };
        let acked = queue.recv().await.unwrap();
        assert_eq!(written, acked);
        assert_eq!(acked.result, PieceResult::SemiSuc);
        assert_eq!(acked.status, PieceStatus::Running);
        assert_eq!(acked.dst_cid, "dst");
        assert_eq!(acked.piece_size, 10);
        assert_eq!(&acked.raw_content(true)[..], b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_reported() -> Result<(), Error> {
        let (peer, supernode, errors) = fixtures().await;
        let (ctx, mut queue, mut client) = ctx(CancellationToken::new());
        let node = format!("127.0.0.1:{supernode}");

        PieceWorker::new(ctx.clone(), "t1", &node, task(peer, "/gone", "")).run().await;
        PieceWorker::new(ctx, "t1", &node, task(peer, "/ok", "ffff")).run().await;

        for _ in 0..2 {
            let piece = queue.recv().await.unwrap();
            assert_eq!(piece.result, PieceResult::Fail);
            assert!(piece.content.is_empty());
        }
        assert!(client.try_recv().is_err());

        // reports are sent in the background
        let start = Instant::now();
        while errors.lock().await.len() < 2 && start.elapsed() < Duration::from_secs(3) {
            sleep(Duration::from_millis(20)).await;
        }
        let errors = errors.lock().await;
        let mut types: Vec<_> =
            errors.iter().map(|e| e["errorType"].clone()).collect();
        types.sort();
        assert_eq!(types, ["FILE_MD5_NOT_MATCH", "FILE_NOT_EXIST"]);
        Ok(())
    }

    #[tokio::test]
    async fn client_statuses_are_reported() -> Result<(), Error> {
        let (peer, supernode, errors) = fixtures().await;
        let (ctx, mut queue, _client) = ctx(CancellationToken::new());
        let node = format!("127.0.0.1:{supernode}");

        for path in ["/range", "/forbidden", "/broken"] {
            PieceWorker::new(ctx.clone(), "t1", &node, task(peer, path, "")).run().await;
            assert_eq!(queue.recv().await.unwrap().result, PieceResult::Fail);
        }

        let start = Instant::now();
        while errors.lock().await.len() < 2 && start.elapsed() < Duration::from_secs(3) {
            sleep(Duration::from_millis(20)).await;
        }
        // a server error is not the peer's fault
        sleep(Duration::from_millis(100)).await;

        let errors = errors.lock().await;
        assert_eq!(errors.len(), 2);
        for e in errors.iter() {
            assert_eq!(e["errorType"], "FILE_NOT_EXIST");
            assert_eq!(e["srcCid"], "src");
            assert_eq!(e["dstCid"], "dst");
            assert_eq!(e["dstIp"], "127.0.0.1");
            assert_eq!(e["range"], "0-9");
        }
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_peer_fails_without_request() -> Result<(), Error> {
        // a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let (ctx, mut queue, _client) = ctx(CancellationToken::new());
        let mut t = task(port, "/ok", "");
        t.peer_ip = "127.0.0.1".into();

        // the supernode is elsewhere, so the peer connection is checked first
        PieceWorker::new(ctx, "t1", "10.255.255.1:8002", t).run().await;
        assert_eq!(queue.recv().await.unwrap().result, PieceResult::Fail);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_worker_sends_nothing() {
        let cancel = CancellationToken::new();
        let (ctx, mut queue, _client) = ctx(cancel.clone());
        cancel.cancel();

        PieceWorker::new(ctx, "t1", "127.0.0.1:1", task(1, "/ok", "")).run().await;
        assert!(queue.try_recv().is_err());
    }
}
