use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt, BufWriter},
    sync::Notify,
    time::Instant,
};
use tracing::{debug, info, warn};

use super::{
    target_writer::TargetWriter,
    writer::{report_success, PieceWriter, WriterHandle},
};
use crate::{
    api::SupernodeClient,
    counter::Counter,
    downloader::SharedReason,
    error::Error,
    piece::{Piece, WriterMsg},
    utils::link,
};

const WRITE_BUFFER: usize = 4 * 1024 * 1024;

/// Paths and collaborators of a [`FileWriter`].
#[derive(Debug, Clone)]
pub struct FileWriterCtx {
    pub cid: String,
    /// `{dataDir}/{taskFileName}`, hard link of the service file.
    pub client_file: PathBuf,
    /// `{dataDir}/{taskFileName}.service`, served to other peers.
    pub service_file: PathBuf,
    pub temp_target: PathBuf,
    /// Whether this host uploads what it downloads.
    pub p2p: bool,
    /// Whether pieces arrive inside the 5 byte frame.
    pub framed: bool,
    pub queue_size: usize,
    pub api: SupernodeClient,
    pub counter: Arc<Counter>,
    pub reason: SharedReason,
}

/// Writes pieces into the service file, at their offset, so they can be
/// uploaded while the download goes on.
///
/// When the data dir and the target live on different filesystems the
/// client file cannot be renamed into the target, so every piece is also
/// written into the temporary target by a [`TargetWriter`]. Outside of the
/// P2P pattern only the temporary target is written.
pub struct FileWriter {
    ctx: FileWriterCtx,
    service: Option<BufWriter<File>>,
    target: Option<WriterHandle>,
    across_write: bool,
    written: usize,
}

impl FileWriter {
    pub async fn new(ctx: FileWriterCtx) -> Result<Self, Error> {
        let mut across_write = false;
        let mut service = None;

        if ctx.p2p {
            if let Some(dir) = ctx.service_file.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            if let Err(e) = link(&ctx.temp_target, &ctx.client_file).await {
                warn!("cannot link the temp target to the client file: {e}");
                across_write = true;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&ctx.service_file)
                .await?;
            if let Err(e) = link(&ctx.service_file, &ctx.client_file).await {
                warn!("cannot link the service file to the client file: {e}");
            }
            service = Some(BufWriter::with_capacity(WRITE_BUFFER, file));
        }

        let target = if !ctx.p2p || across_write {
            let writer = TargetWriter::new(&ctx.temp_target, ctx.framed).await?;
            Some(WriterHandle::spawn(
                writer,
                ctx.queue_size,
                Arc::new(Notify::new()),
                ctx.reason.clone(),
            ))
        } else {
            None
        };

        info!(
            "file writer ready, p2p:{} acrossWrite:{} service:{:?}",
            ctx.p2p, across_write, ctx.service_file
        );

        Ok(Self { ctx, service, target, across_write, written: 0 })
    }

    /// Whether the temporary target holds the file, instead of the client
    /// file.
    pub fn across_write(&self) -> bool {
        self.across_write || !self.ctx.p2p
    }

    pub fn client_file(&self) -> &Path {
        &self.ctx.client_file
    }

    async fn write_service(&mut self, piece: &Piece) -> Result<(), Error> {
        let Some(service) = self.service.as_mut() else {
            return Ok(());
        };
        let offset = piece.write_offset(self.ctx.framed);
        service.seek(SeekFrom::Start(offset)).await?;
        service.write_all(&piece.raw_content(self.ctx.framed)).await?;
        service.flush().await?;
        Ok(())
    }

    async fn forward(&self, msg: WriterMsg) -> Result<(), Error> {
        if let Some(target) = &self.target {
            target.tx.send(msg).await?;
        }
        Ok(())
    }
}

impl PieceWriter for FileWriter {
    async fn write(&mut self, piece: Piece) -> Result<(), Error> {
        let start = Instant::now();
        let len = piece.raw_content(self.ctx.framed).len();

        if !self.ctx.p2p {
            self.forward(WriterMsg::Piece(piece)).await?;
            self.ctx.counter.record_download(len as u64);
            return Ok(());
        }

        if self.across_write {
            self.forward(WriterMsg::Piece(piece.clone())).await?;
        }

        self.write_service(&piece).await?;
        self.written += 1;
        self.ctx.counter.record_download(len as u64);
        report_success(&self.ctx.api, &self.ctx.cid, &piece, start);
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), Error> {
        if let Some(service) = self.service.as_mut() {
            service.flush().await?;
            service.get_mut().set_len(0).await?;
        }
        self.written = 0;
        self.ctx.counter.reset();
        self.forward(WriterMsg::Reset).await
    }

    async fn finish(&mut self) -> Result<(), Error> {
        if let Some(service) = self.service.as_mut() {
            service.flush().await?;
            service.get_mut().sync_all().await?;
        }
        debug!("{} pieces written into the service file", self.written);

        if let Some(target) = self.target.take() {
            target.finish().await?;
        }
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        // a writer dropped before `finish` must not leave its target
        // writer behind
        if let Some(target) = &self.target {
            target.abort();
        }
    }
}
