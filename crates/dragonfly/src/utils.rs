//! Utility functions
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{
    fs,
    io::AsyncReadExt,
    net::{lookup_host, TcpStream},
    time::timeout,
};

use crate::{
    codec::PIECE_META_SIZE,
    constants::{
        PEER_HTTP_PATH_PREFIX, SERVER_PORT_LOWER_LIMIT, SERVER_PORT_UPPER_LIMIT,
        STREAM_WRITER_ROUTINE_LIMIT,
    },
    error::Error,
};

/// transform bytes into a human readable format.
pub fn to_human_readable(n: u64) -> String {
    let mut n = n as f64;

    let units = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let delimiter = 1000_f64;

    if n < delimiter {
        return format!("{} {}", n, "B");
    }

    let mut u: i32 = 0;
    let r = 10_f64;

    while (n * r).round() / r >= delimiter && u < (units.len() as i32) - 1 {
        n /= delimiter;
        u += 1;
    }

    format!("{:.2} {}", n, units[u as usize])
}

/// Remove the query parameters listed in `filters`, so equivalent urls
/// share one task.
pub fn task_url(raw_url: &str, filters: &[String]) -> String {
    let Some(idx) = raw_url.find('?') else {
        return raw_url.to_owned();
    };
    if filters.is_empty() || idx >= raw_url.len() - 1 {
        return raw_url.to_owned();
    }

    let params: Vec<&str> = raw_url[idx + 1..]
        .split('&')
        .filter(|p| {
            let key = p.split('=').next().unwrap_or_default();
            !filters.iter().any(|f| f == key)
        })
        .collect();

    if params.is_empty() {
        return raw_url[..idx].to_owned();
    }
    format!("{}{}", &raw_url[..=idx], params.join("&"))
}

/// Split `key:value` header strings, skipping malformed ones.
pub fn parse_headers(headers: &[String]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|h| {
            let (k, v) = h.split_once(':')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_owned(), v.trim().to_owned()))
        })
        .collect()
}

pub fn cid(local_ip: &str, sign: &str) -> String {
    format!("{local_ip}-{sign}")
}

pub fn task_file_name(real_target: &Path, sign: &str) -> String {
    let base = real_target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{base}-{sign}")
}

pub fn task_path(task_file_name: &str) -> String {
    if task_file_name.is_empty() {
        return String::new();
    }
    format!("{PEER_HTTP_PATH_PREFIX}{task_file_name}")
}

pub fn service_file(task_file_name: &str, data_dir: &Path) -> PathBuf {
    data_dir.join(format!("{task_file_name}.service"))
}

pub fn task_file(task_file_name: &str, data_dir: &Path) -> PathBuf {
    data_dir.join(task_file_name)
}

/// Port that stays the same for 5 minutes, so consecutive invocations land
/// on the same peer server.
pub fn generate_port(offset: u16) -> u16 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    port_at(secs, offset)
}

fn port_at(unix_secs: u64, offset: u16) -> u16 {
    let span = (SERVER_PORT_UPPER_LIMIT - SERVER_PORT_LOWER_LIMIT) as u64;
    let port = (unix_secs / 300) % span + SERVER_PORT_LOWER_LIMIT as u64;
    (port + offset as u64).min(u16::MAX as u64) as u16
}

/// Time needed to download `file_length` bytes at `min_rate`, plus
/// `reserved`. `None` when it cannot be computed.
pub fn calculate_timeout(
    file_length: i64,
    min_rate: i64,
    default_min_rate: i64,
    reserved: Duration,
) -> Option<Duration> {
    if file_length <= 0 || (min_rate <= 0 && default_min_rate <= 0) {
        return None;
    }
    let rate = if min_rate <= 0 { default_min_rate } else { min_rate };
    Some(Duration::from_secs((file_length / rate) as u64) + reserved)
}

/// Number of concurrent workers for a file of `length` bytes.
pub fn calculate_routine_count(length: i64, piece_size: i32) -> usize {
    let limit = STREAM_WRITER_ROUTINE_LIMIT;
    if length < 0 || piece_size <= 0 {
        return limit;
    }
    if length == 0 {
        return 1;
    }
    let content = (piece_size as i64 - PIECE_META_SIZE as i64).max(1);
    let count = (length + content - 1) / content;
    (count as usize).clamp(1, limit)
}

/// Connect to `host:port` and return the local ip used for it.
pub async fn check_connect(
    host: &str,
    port: u16,
    wait: Duration,
) -> Result<String, Error> {
    let addr: SocketAddr = lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::InvalidValue(host.to_owned(), "no address".into()))?;

    let stream = timeout(wait, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            Error::PeerUnreachable(
                format!("{host}:{port}"),
                std::io::ErrorKind::TimedOut.into(),
            )
        })?
        .map_err(|e| Error::PeerUnreachable(format!("{host}:{port}"), e))?;

    Ok(stream.local_addr()?.ip().to_string())
}

pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_owned())
        .unwrap_or_default()
}

pub fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

/// Lowercase hex md5 of a file.
pub async fn md5_file(path: &Path) -> Result<String, Error> {
    let mut file = fs::File::open(path).await?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(hex::encode(ctx.compute().0))
}

/// Hard link `src` to `dst`, replacing `dst`.
pub async fn link(src: &Path, dst: &Path) -> Result<(), Error> {
    if fs::symlink_metadata(dst).await.is_ok() {
        fs::remove_file(dst).await?;
    }
    fs::hard_link(src, dst).await?;
    Ok(())
}

/// Rename `src` to `dst`, copying when they live on different filesystems.
pub async fn move_file(src: &Path, dst: &Path) -> Result<(), Error> {
    if fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).await?;
    fs::remove_file(src).await?;
    Ok(())
}
