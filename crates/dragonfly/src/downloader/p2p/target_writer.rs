use std::{io::SeekFrom, path::Path};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};

use super::writer::PieceWriter;
use crate::{error::Error, piece::Piece};

/// Writes the payload of every piece into the temporary target, next to
/// the real target.
#[derive(Debug)]
pub struct TargetWriter {
    file: File,
    framed: bool,
}

impl TargetWriter {
    pub async fn new(path: &Path, framed: bool) -> Result<Self, Error> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self { file, framed })
    }
}

impl PieceWriter for TargetWriter {
    async fn write(&mut self, piece: Piece) -> Result<(), Error> {
        let offset = piece.write_offset(self.framed);
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(&piece.raw_content(self.framed)).await?;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), Error> {
        self.file.set_len(0).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), Error> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}
