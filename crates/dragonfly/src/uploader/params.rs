//! Byte range of a piece upload request.
use crate::{codec::PIECE_META_SIZE, error::Error};

/// What to read from the service file, and how to frame it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadParams {
    /// Bytes of frame around the payload, 0 when unframed.
    pub pad_size: i64,
    pub start: i64,
    /// Length of the response body, frame included.
    pub length: i64,
    pub piece_size: i64,
    pub piece_num: i64,
}

impl UploadParams {
    /// Bytes read from the service file.
    pub fn read_len(&self) -> i64 {
        self.length - self.pad_size
    }
}

/// Parse the `Range: bytes=start-end`, `pieceNum` and `pieceSize` headers.
pub fn parse_params(
    range: &str,
    piece_num: &str,
    piece_size: &str,
) -> Result<UploadParams, Error> {
    let piece_num = piece_num.trim().parse()?;
    let piece_size = piece_size.trim().parse()?;

    let invalid = || Error::InvalidValue("range".into(), range.to_owned());

    if range.matches('=').count() != 1 {
        return Err(invalid());
    }
    let (_, bytes) = range.split_once('=').ok_or_else(invalid)?;
    if bytes.matches('-').count() != 1 {
        return Err(invalid());
    }
    let (start, end) = bytes.split_once('-').ok_or_else(invalid)?;
    let start: i64 = start.trim().parse()?;
    let end: i64 = end.trim().parse()?;

    if end <= start {
        return Err(invalid());
    }

    Ok(UploadParams {
        pad_size: 0,
        start,
        length: end - start + 1,
        piece_size,
        piece_num,
    })
}

/// Translate a range expressed in framed coordinates into the service file,
/// which holds payloads only, and clamp it to the file size.
pub fn amend_range(
    size: i64,
    need_pad: bool,
    up: &mut UploadParams,
) -> Result<(), Error> {
    up.pad_size = 0;
    if need_pad {
        up.pad_size = PIECE_META_SIZE as i64;
        up.start -= up.piece_num * up.pad_size;
    }

    if up.length < up.pad_size || up.start < 0 {
        return Err(Error::RangeNotSatisfiable);
    }
    // an empty file still answers its single frame
    if up.start >= size && (!need_pad || size > 0) {
        return Err(Error::RangeNotSatisfiable);
    }

    if up.start + up.length - up.pad_size > size {
        up.length = size - up.start + up.pad_size;
        if size == 0 {
            up.length = up.pad_size;
        }
    }
    if up.length < up.pad_size {
        return Err(Error::RangeNotSatisfiable);
    }
    Ok(())
}
