//! Wire framing of one piece.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Size of the big-endian header that precedes the payload.
pub const PIECE_HEAD_SIZE: usize = 4;

/// Header plus tail.
pub const PIECE_META_SIZE: usize = 5;

/// Last byte of every framed piece.
pub const PIECE_TAIL: u8 = 0x7f;

/// A piece is sent over HTTP as a single frame that spans the whole body:
///
/// header,payload,tail
///  u32      x     u8     (in bits)
///
/// The header is `real_data_len | (piece_size << 4)`, where `piece_size` is
/// the size of a full frame. Every frame is `piece_size` bytes long, except
/// the last piece of a file which may be shorter.
///
/// Because the frame does not carry its own length in a recoverable way,
/// the decoder only yields at the end of the body.
///
/// # Example
///
/// ```
/// use dragonfly::codec::{encode, header};
///
/// let framed = encode(b"hello", 9);
///
/// // 5 | (9 << 4)
/// assert_eq!(header(5, 9), 149);
/// assert_eq!(&framed[..], &[0, 0, 0, 149, 104, 101, 108, 108, 111, 0x7f]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PieceCodec {
    piece_size: u32,
}

impl PieceCodec {
    /// A `piece_size` of 0 skips the header consistency check.
    pub fn new(piece_size: u32) -> Self {
        Self { piece_size }
    }
}

pub fn header(real_len: u32, piece_size: u32) -> u32 {
    real_len | (piece_size << 4)
}

pub fn encode(payload: &[u8], piece_size: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + PIECE_META_SIZE);
    buf.put_u32(header(payload.len() as u32, piece_size));
    buf.extend_from_slice(payload);
    buf.put_u8(PIECE_TAIL);
    buf.freeze()
}

/// Validate a framed piece and return its payload.
pub fn decode(framed: &Bytes, piece_size: u32) -> Result<Bytes, Error> {
    let total = framed.len();

    if total < PIECE_META_SIZE {
        return Err(Error::PieceCorrupt(format!(
            "frame of {total} bytes is shorter than the frame metadata"
        )));
    }
    if framed[total - 1] != PIECE_TAIL {
        return Err(Error::PieceCorrupt(format!(
            "wrong tail byte {:#x}",
            framed[total - 1]
        )));
    }

    let real_len = (total - PIECE_META_SIZE) as u32;
    let head = (&framed[..PIECE_HEAD_SIZE]).get_u32();

    if piece_size > 0 {
        if total > piece_size as usize {
            return Err(Error::PieceCorrupt(format!(
                "frame of {total} bytes exceeds the piece size {piece_size}"
            )));
        }
        if head != header(real_len, piece_size) {
            return Err(Error::PieceCorrupt(format!(
                "header {head} does not match length {real_len} and piece \
                 size {piece_size}"
            )));
        }
    } else if head & real_len != real_len {
        return Err(Error::PieceCorrupt(format!(
            "header {head} does not contain length {real_len}"
        )));
    }

    Ok(framed.slice(PIECE_HEAD_SIZE..total - 1))
}

/// Lowercase hex md5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

pub fn verify_md5(payload: &[u8], expected: &str) -> bool {
    md5_hex(payload) == expected.to_lowercase()
}

// From payload to frame
impl Encoder<Bytes> for PieceCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, buf: &mut BytesMut) -> Result<(), Error> {
        buf.reserve(item.len() + PIECE_META_SIZE);
        buf.put_u32(header(item.len() as u32, self.piece_size));
        buf.extend_from_slice(&item);
        buf.put_u8(PIECE_TAIL);
        Ok(())
    }
}

// From body to the validated frame, yielded whole so the writer can
// still see the header
impl Decoder for PieceCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, _buf: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let framed = buf.split().freeze();
        decode(&framed, self.piece_size)?;
        Ok(Some(framed))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;

    #[test]
    fn hello_frame() {
        let framed = encode(b"hello", 9);
        assert_eq!(framed.len(), 10);
        assert_eq!(&framed[..4], &[0, 0, 0, 0x95]);
        assert_eq!(framed[9], PIECE_TAIL);

        let payload = decode(&framed, 9).unwrap();
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn empty_frame() {
        let framed = encode(b"", 9);
        assert_eq!(framed.len(), PIECE_META_SIZE);
        assert!(decode(&framed, 9).unwrap().is_empty());
    }

    #[test]
    fn corrupt_frames() {
        let mut bad_tail = BytesMut::from(&encode(b"hello", 10)[..]);
        bad_tail[9] = 0;
        assert!(matches!(
            decode(&bad_tail.freeze(), 10),
            Err(Error::PieceCorrupt(_))
        ));

        // header says a different piece size
        let framed = encode(b"hello", 10);
        assert!(decode(&framed, 12).is_err());

        // longer than a full piece
        let framed = encode(b"hello world", 16);
        assert!(decode(&framed, 12).is_err());

        assert!(decode(&Bytes::from_static(&[0, 0, 0x7f]), 0).is_err());
    }

    #[test]
    fn md5() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
        assert!(verify_md5(b"hello", "5D41402ABC4B2A76B9719D911017C592"));
        assert!(!verify_md5(b"hell", "5d41402abc4b2a76b9719d911017c592"));
    }

    #[tokio::test]
    async fn framed_read_yields_at_eof() {
        let mut buf = BytesMut::new();
        PieceCodec::new(16).encode(Bytes::from_static(b"dragonfly"), &mut buf).unwrap();
        let body = buf.freeze();

        let mut framed = FramedRead::new(&body[..], PieceCodec::new(16));
        let frame = framed.next().await.unwrap().unwrap();
        assert_eq!(frame, body);
        assert!(framed.next().await.is_none());
    }
}
