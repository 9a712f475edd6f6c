//! Pieces exchanged between the scheduler, the workers and the writers.
use std::fmt::Display;

use bytes::Bytes;

use crate::codec::{PIECE_HEAD_SIZE, PIECE_META_SIZE};

/// Outcome of a piece, as reported to the supernode.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceResult {
    Fail = 500,
    Suc = 501,
    #[default]
    Invalid = 502,
    /// Downloaded and handed to the writer, but not yet acknowledged.
    SemiSuc = 503,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceStatus {
    #[default]
    Start = 700,
    Running = 701,
    Finish = 702,
}

impl PieceResult {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Results that force the scheduler to pull right away instead of
    /// batching more acknowledgements.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Suc | Self::Fail | Self::Invalid)
    }
}

impl PieceStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// A chunk of a task, in any stage of its life.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Piece {
    pub task_id: String,
    pub super_node: String,
    pub dst_cid: String,
    pub range: String,
    pub result: PieceResult,
    pub status: PieceStatus,
    /// Size of the piece including the frame, 0 when unknown.
    pub piece_size: i32,
    pub piece_num: i32,
    pub content: Bytes,
}

impl Piece {
    /// A piece with no range, used to start or restart the pull loop.
    pub fn simple(
        task_id: impl Into<String>,
        super_node: impl Into<String>,
        status: PieceStatus,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            super_node: super_node.into(),
            status,
            result: PieceResult::Invalid,
            ..Default::default()
        }
    }

    pub fn new(
        task_id: impl Into<String>,
        super_node: impl Into<String>,
        dst_cid: impl Into<String>,
        range: impl Into<String>,
        result: PieceResult,
        status: PieceStatus,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            super_node: super_node.into(),
            dst_cid: dst_cid.into(),
            range: range.into(),
            result,
            status,
            ..Default::default()
        }
    }

    /// The payload of the piece. With `framed = false` the content is
    /// already raw.
    pub fn raw_content(&self, framed: bool) -> Bytes {
        let len = self.content.len();
        if !framed {
            return self.content.clone();
        }
        if len < PIECE_META_SIZE {
            return Bytes::new();
        }
        self.content.slice(PIECE_HEAD_SIZE..len - 1)
    }

    /// Offset of the payload in the content file.
    pub fn write_offset(&self, framed: bool) -> u64 {
        let pad = if framed { PIECE_META_SIZE as i64 } else { 0 };
        let content_size = (self.piece_size as i64 - pad).max(0);
        self.piece_num as u64 * content_size as u64
    }
}

impl Display for Piece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "taskID:{} node:{} dstCid:{} range:{} result:{} status:{} \
             pieceSize:{} pieceNum:{}",
            self.task_id,
            self.super_node,
            self.dst_cid,
            self.range,
            self.result.code(),
            self.status.code(),
            self.piece_size,
            self.piece_num
        )
    }
}

/// Messages consumed by the writers.
#[derive(Debug)]
pub enum WriterMsg {
    Piece(Piece),
    /// The piece size changed, everything written so far is void.
    Reset,
    /// No more pieces will arrive, flush and close.
    Last,
}
