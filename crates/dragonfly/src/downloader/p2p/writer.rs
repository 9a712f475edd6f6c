//! Contract shared by the writers that consume the client queue.
use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    api::{types::ReportPieceRequest, SupernodeClient},
    config::BackSourceReason,
    constants::code,
    downloader::SharedReason,
    error::Error,
    piece::{Piece, WriterMsg},
};

const REPORT_RETRIES: usize = 3;

pub trait PieceWriter: Send + 'static {
    fn write(&mut self, piece: Piece)
        -> impl Future<Output = Result<(), Error>> + Send;

    /// The piece size changed, forget what was written.
    fn reset(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Every piece was written.
    fn finish(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// A writer running in its own task.
#[derive(Debug)]
pub struct WriterHandle {
    pub tx: mpsc::Sender<WriterMsg>,
    handle: JoinHandle<Result<(), Error>>,
}

impl WriterHandle {
    pub fn spawn<W: PieceWriter>(
        writer: W,
        capacity: usize,
        notify: Arc<Notify>,
        reason: SharedReason,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run(writer, rx, notify, reason));
        Self { tx, handle }
    }

    /// Send the `Last` sentinel and wait until everything is written.
    pub async fn finish(self) -> Result<(), Error> {
        let _ = self.tx.send(WriterMsg::Last).await;
        drop(self.tx);
        self.handle.await?
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Consume `rx` until `Last`. After a failed write the remaining pieces are
/// drained without being written, so the workers never block on a full
/// queue, and the error is returned at the end.
#[tracing::instrument(skip_all, name = "writer")]
pub async fn run<W: PieceWriter>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriterMsg>,
    notify: Arc<Notify>,
    reason: SharedReason,
) -> Result<(), Error> {
    let mut failed: Option<Error> = None;

    while let Some(msg) = rx.recv().await {
        let res = match msg {
            WriterMsg::Last => break,
            _ if failed.is_some() => continue,
            WriterMsg::Piece(piece) => {
                debug!("write piece {piece}");
                let res = writer.write(piece).await;
                notify.notify_one();
                res
            }
            WriterMsg::Reset => {
                debug!("reset");
                writer.reset().await
            }
        };

        if let Err(e) = res {
            error!("write error: {e}");
            reason.set(BackSourceReason::WriteError);
            failed = Some(e);
        }
    }

    if let Some(e) = failed {
        return Err(e);
    }
    writer.finish().await
}

/// Tell the supernode of `piece` that it can be uploaded from this peer.
/// The report runs in the background.
pub fn report_success(
    api: &SupernodeClient,
    cid: &str,
    piece: &Piece,
    start: Instant,
) {
    let api = api.clone();
    let node = piece.super_node.clone();
    let req = ReportPieceRequest {
        task_id: piece.task_id.clone(),
        cid: cid.to_owned(),
        dst_cid: piece.dst_cid.clone(),
        piece_range: piece.range.clone(),
    };

    tokio::spawn(async move {
        for attempt in 1..=REPORT_RETRIES {
            match api.report_piece(&node, &req).await {
                Ok(res) if res.code == code::GET_PIECE_REPORT => break,
                Ok(res) => {
                    debug!("report piece {} got code {}", req.piece_range, res.code)
                }
                Err(e) => warn!(
                    "report piece {} ({attempt}/{REPORT_RETRIES}): {e}",
                    req.piece_range
                ),
            }
            sleep(Duration::from_millis(100)).await;
        }

        let cost = start.elapsed();
        if cost > Duration::from_secs(2) {
            info!(
                "write and report piece {} cost {:.3}s",
                req.piece_range,
                cost.as_secs_f64()
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default, Clone)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<i32>,
    }

    impl PieceWriter for Recorder {
        async fn write(&mut self, piece: Piece) -> Result<(), Error> {
            if self.fail_on == Some(piece.piece_num) {
                return Err(Error::WriterClosed);
            }
            self.log.lock().unwrap().push(format!("piece {}", piece.piece_num));
            Ok(())
        }

        async fn reset(&mut self) -> Result<(), Error> {
            self.log.lock().unwrap().push("reset".into());
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), Error> {
            self.log.lock().unwrap().push("finish".into());
            Ok(())
        }
    }

    fn piece(n: i32) -> WriterMsg {
        WriterMsg::Piece(Piece { piece_num: n, ..Default::default() })
    }

    #[tokio::test]
    async fn sentinels() -> Result<(), Error> {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let notify = Arc::new(Notify::new());
        let reason = SharedReason::default();

        let writer = WriterHandle::spawn(recorder, 2, notify.clone(), reason.clone());
        writer.tx.send(piece(0)).await?;
        writer.tx.send(WriterMsg::Reset).await?;
        writer.tx.send(piece(1)).await?;
        writer.finish().await?;

        assert_eq!(*log.lock().unwrap(), ["piece 0", "reset", "piece 1", "finish"]);
        assert!(!reason.is_set());
        Ok(())
    }

    #[tokio::test]
    async fn failed_write_sets_reason() -> Result<(), Error> {
        let recorder = Recorder { fail_on: Some(1), ..Default::default() };
        let log = recorder.log.clone();
        let reason = SharedReason::default();

        let writer =
            WriterHandle::spawn(recorder, 1, Arc::new(Notify::new()), reason.clone());
        for n in 0..4 {
            writer.tx.send(piece(n)).await?;
        }
        assert!(writer.finish().await.is_err());

        assert_eq!(*log.lock().unwrap(), ["piece 0"]);
        assert_eq!(reason.get(), BackSourceReason::WriteError);
        Ok(())
    }
}
