//! Download of one piece from another peer, from the supernode, or from the
//! source when pieces travel without the frame.
use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncReadExt;
use tokio_util::{codec::FramedRead, io::StreamReader};
use tracing::debug;

use super::types::{CdnSource, PieceTask};
use crate::{
    codec::{self, PieceCodec},
    constants::{header, user_agent},
    error::Error,
    limit_reader::LimitReader,
    rate_limiter::RateLimiter,
};

#[derive(Debug, Clone)]
pub struct PeerClient {
    http: Client,
    /// Headers for the source, used when the piece path is a full url.
    source_headers: Vec<(String, String)>,
}

impl PeerClient {
    pub fn new(
        timeout: Duration,
        source_headers: Vec<(String, String)>,
    ) -> Result<Self, Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, source_headers })
    }

    /// Fetch the piece described by `task` and return its content, still
    /// framed when `cdn_source` frames it. The md5 of the payload is checked
    /// against the one of the assignment, when there is one.
    pub async fn download(
        &self,
        task: &PieceTask,
        cdn_source: CdnSource,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Bytes, Error> {
        let from_source = task.path.contains("://");

        let mut req = if from_source {
            let user_range = self
                .source_headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("range"))
                .map(|(_, v)| v.as_str());
            let range = real_range(&task.range, user_range);

            let mut req = self.http.get(&task.path);
            for (k, v) in &self.source_headers {
                if !k.eq_ignore_ascii_case("range") {
                    req = req.header(k, v);
                }
            }
            req.header(reqwest::header::RANGE, format!("bytes={range}"))
        } else {
            let url =
                format!("http://{}:{}{}", task.peer_ip, task.peer_port, task.path);
            self.http
                .get(url)
                .header(reqwest::header::RANGE, format!("bytes={}", task.range))
        };

        req = req
            .header(header::PIECE_NUM, task.piece_num.to_string())
            .header(header::PIECE_SIZE, task.piece_size.to_string())
            .header(header::CDN_SOURCE, cdn_source.as_str())
            .header(reqwest::header::USER_AGENT, user_agent());

        let res = req.send().await?;
        let status = res.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(Error::RangeNotSatisfiable);
        }
        if !status.is_success() {
            debug!(
                "peer {}:{} answered {status} for range {}",
                task.peer_ip, task.peer_port, task.range
            );
            return Err(Error::PeerStatus(status.as_u16()));
        }

        let body = Box::pin(res.bytes_stream().map_err(io::Error::other));
        let reader = LimitReader::new(StreamReader::new(body), limiter, false);
        let expected = task.md5();

        if cdn_source.is_framed() {
            let codec = PieceCodec::new(task.piece_size.max(0) as u32);
            let mut frames = FramedRead::new(reader, codec);
            let framed = frames.next().await.ok_or_else(|| {
                Error::PieceCorrupt("empty response body".to_owned())
            })??;

            let payload = codec::decode(&framed, task.piece_size.max(0) as u32)?;
            check_md5(&payload, expected)?;
            return Ok(framed);
        }

        let mut reader = reader;
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        check_md5(&content, expected)?;
        Ok(content.into())
    }
}

fn check_md5(payload: &[u8], expected: &str) -> Result<(), Error> {
    if expected.is_empty() {
        return Ok(());
    }
    let real = codec::md5_hex(payload);
    if real != expected.to_lowercase() {
        return Err(Error::PieceMd5NotMatch { real, expected: expected.to_owned() });
    }
    Ok(())
}

/// Shift a piece range into the window the user asked of the source, with
/// a `Range: bytes=lower-upper` header.
pub fn real_range(piece_range: &str, user_range: Option<&str>) -> String {
    let Some(user_range) = user_range else {
        return piece_range.to_owned();
    };
    let Some((_, bounds)) = user_range.split_once('=') else {
        return piece_range.to_owned();
    };
    let (Some((lower, upper)), Some((start, end))) =
        (parse_range(bounds), parse_range(piece_range))
    else {
        return piece_range.to_owned();
    };

    let real_start = start + lower;
    let real_end = (end + lower).min(upper);
    format!("{real_start}-{real_end}")
}

/// `start-end` into its two inclusive bounds.
pub fn parse_range(range: &str) -> Option<(u64, u64)> {
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, end))
}
