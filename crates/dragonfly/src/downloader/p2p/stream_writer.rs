use std::{io, sync::Arc};

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::io::StreamReader;
use tracing::warn;

use super::writer::{report_success, PieceWriter};
use crate::{
    api::SupernodeClient,
    counter::Counter,
    downloader::DownloadReader,
    error::Error,
    limit_reader::LimitReader,
    piece::Piece,
};

pub type PipeSender = mpsc::Sender<io::Result<Bytes>>;

/// Writes pieces into a pipe in the order of their number, holding the
/// pieces that arrive early until their predecessors are written.
pub struct StreamWriter {
    pipe: PipeSender,
    cursor: i32,
    cache: HashMap<i32, Piece>,
    framed: bool,
    cid: String,
    api: SupernodeClient,
    counter: Arc<Counter>,
}

impl StreamWriter {
    pub fn new(
        pipe: PipeSender,
        framed: bool,
        cid: impl Into<String>,
        api: SupernodeClient,
        counter: Arc<Counter>,
    ) -> Self {
        Self {
            pipe,
            cursor: 0,
            cache: HashMap::new(),
            framed,
            cid: cid.into(),
            api,
            counter,
        }
    }

    async fn send(&self, piece: &Piece) -> Result<(), Error> {
        let content = piece.raw_content(self.framed);
        let len = content.len() as u64;
        self.pipe.send(Ok(content)).await.map_err(|_| Error::WriterClosed)?;
        self.counter.record_download(len);
        Ok(())
    }
}

/// The read half of the pipe. When `md5` is given, the read that reaches
/// the end fails if the bytes do not match it.
pub fn pipe(capacity: usize, md5: Option<String>) -> (PipeSender, DownloadReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    let reader = LimitReader::new(StreamReader::new(Box::pin(stream)), None, false);
    let reader = match md5 {
        Some(md5) => reader.expect_md5(md5),
        None => reader,
    };
    (tx, Box::pin(reader))
}

impl PieceWriter for StreamWriter {
    async fn write(&mut self, piece: Piece) -> Result<(), Error> {
        let start = Instant::now();

        if piece.piece_num < self.cursor {
            return Err(Error::PieceOutOfOrder(piece.piece_num, self.cursor));
        }
        if piece.piece_num > self.cursor {
            self.cache.insert(piece.piece_num, piece);
            return Ok(());
        }

        let mut next = Some(piece);
        while let Some(piece) = next {
            self.send(&piece).await?;
            report_success(&self.api, &self.cid, &piece, start);
            self.cursor += 1;
            next = self.cache.remove(&self.cursor);
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), Error> {
        let e = Error::StreamReset;
        let _ = self.pipe.send(Err(io::Error::other(e.to_string()))).await;
        Err(e)
    }

    async fn finish(&mut self) -> Result<(), Error> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let e = Error::StreamGap { missing: self.cursor, cached: self.cache.len() };
        warn!("{e}");
        let _ = self.pipe.send(Err(io::Error::other(e.to_string()))).await;
        Err(e)
    }
}
