//! Download straight from the source url, when the P2P network cannot be
//! used.
use std::{io, path::PathBuf, sync::Arc, time::Duration};

use futures::TryStreamExt;
use reqwest::{Client, Response};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use super::{DownloadReader, Downloader};
use crate::{
    config::{BackSourceReason, Config},
    constants::{user_agent, RATE_LIMITER_WINDOW},
    error::Error,
    limit_reader::LimitReader,
    rate_limiter::RateLimiter,
    utils::{move_file, parse_headers},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct BackSourceDownloader {
    url: String,
    headers: Vec<(String, String)>,
    md5: Option<String>,
    notbs: bool,
    insecure: bool,
    reason: BackSourceReason,
    local_limit: i64,
    temp_target: PathBuf,
    target: PathBuf,
    cleaned: bool,
}

impl BackSourceDownloader {
    pub fn new(config: &Config, reason: BackSourceReason) -> Self {
        Self {
            url: config.url.clone(),
            headers: parse_headers(&config.headers),
            md5: config.md5.clone().filter(|m| !m.is_empty()),
            notbs: config.notbs,
            insecure: config.insecure,
            reason,
            local_limit: config.local_limit,
            temp_target: config.rv.temp_target.clone(),
            target: config.rv.real_target.clone(),
            cleaned: false,
        }
    }

    pub fn reason(&self) -> BackSourceReason {
        self.reason
    }

    /// The user may forbid the fallback, and some failures would happen
    /// again with the source.
    fn check_allowed(&self) -> Result<(), Error> {
        if self.notbs || self.reason.forbids_fallback() {
            return Err(Error::BackSourceDisabled(self.reason));
        }
        Ok(())
    }

    async fn request(&self) -> Result<Response, Error> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(self.insecure)
            .user_agent(user_agent())
            .build()?;

        let mut req = http.get(&self.url);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(Error::BackSource(format!(
                "failed to get {}, status: {status}",
                self.url
            )));
        }
        Ok(res)
    }

    fn reader(&self, res: Response) -> LimitReader<impl tokio::io::AsyncRead + Unpin> {
        let body = Box::pin(res.bytes_stream().map_err(io::Error::other));
        let limiter = (self.local_limit > 0)
            .then(|| Arc::new(RateLimiter::new(self.local_limit, RATE_LIMITER_WINDOW)));
        LimitReader::new(StreamReader::new(body), limiter, self.md5.is_some())
    }
}

impl Downloader for BackSourceDownloader {
    #[tracing::instrument(skip_all, name = "back_source")]
    async fn run(&mut self) -> Result<(), Error> {
        self.check_allowed()?;
        self.cleaned = false;

        info!("start download {} from the source, reason: {}", self.url, self.reason);

        let res = self.request().await?;
        let mut reader = self.reader(res);

        if let Some(dir) = self.temp_target.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = fs::File::create(&self.temp_target).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let (Some(expected), Some(real)) = (&self.md5, reader.md5()) {
            if &real != expected {
                return Err(Error::Md5NotMatch { real, expected: expected.clone() });
            }
        }

        move_file(&self.temp_target, &self.target).await?;
        info!("download {written} bytes from the source into {:?}", self.target);
        Ok(())
    }

    async fn run_stream(self) -> Result<DownloadReader, Error> {
        self.check_allowed()?;
        info!("start stream {} from the source, reason: {}", self.url, self.reason);

        let res = self.request().await?;
        let reader = self.reader(res);
        let reader = match &self.md5 {
            Some(md5) => reader.expect_md5(md5.clone()),
            None => reader,
        };
        Ok(Box::pin(reader))
    }

    async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        if let Err(e) = fs::remove_file(&self.temp_target).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove {:?}: {e}", self.temp_target);
            }
        }
        self.cleaned = true;
    }
}

#[cfg(test)]
mod tests {
    use axum::{routing::get, Router};
    use tokio::{io::AsyncReadExt, net::TcpListener};

    use super::*;
    use crate::codec::md5_hex;

    const BODY: &[u8] = b"test downloader";

    async fn source() -> String {
        let app = Router::new()
            .route("/download.test", get(|| async { BODY }))
            .route(
                "/missing",
                get(|| async { axum::http::StatusCode::NOT_FOUND }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://127.0.0.1:{port}")
    }

    fn config(url: String, dir: &std::path::Path) -> Config {
        let mut config = Config::new(url, dir.join("back.test"), dir.join("home"));
        config.rv.real_target = dir.join("back.test");
        config.rv.temp_target = dir.join("dfget-x.tmp-1");
        config.local_limit = 0;
        config
    }

    #[tokio::test]
    async fn run() -> Result<(), Error> {
        let host = source().await;
        let dir = tempfile::tempdir()?;
        let mut config = config(format!("{host}/download.test"), dir.path());

        config.notbs = true;
        let mut d = BackSourceDownloader::new(&config, BackSourceReason::DownloadError);
        assert!(matches!(d.run().await, Err(Error::BackSourceDisabled(_))));

        config.notbs = false;
        let mut d = BackSourceDownloader::new(&config, BackSourceReason::NoSpace);
        assert!(matches!(d.run().await, Err(Error::BackSourceDisabled(_))));

        let mut d = BackSourceDownloader::new(&config, BackSourceReason::None);
        d.run().await?;
        assert_eq!(fs::read(dir.path().join("back.test")).await?, BODY);

        config.md5 = Some("x".into());
        let mut d = BackSourceDownloader::new(&config, BackSourceReason::None);
        assert!(matches!(d.run().await, Err(Error::Md5NotMatch { .. })));
        d.cleanup().await;
        assert!(!config.rv.temp_target.exists());

        config.md5 = Some(md5_hex(BODY));
        let mut d = BackSourceDownloader::new(&config, BackSourceReason::None);
        d.run().await?;

        config.url = format!("{host}/missing");
        let mut d = BackSourceDownloader::new(&config, BackSourceReason::None);
        assert!(matches!(d.run().await, Err(Error::BackSource(_))));
        Ok(())
    }

    #[tokio::test]
    async fn run_stream() -> Result<(), Error> {
        let host = source().await;
        let dir = tempfile::tempdir()?;
        let mut config = config(format!("{host}/download.test"), dir.path());

        config.notbs = true;
        let d = BackSourceDownloader::new(&config, BackSourceReason::None);
        assert!(d.run_stream().await.is_err());

        config.notbs = false;
        config.md5 = Some(md5_hex(BODY));
        let d = BackSourceDownloader::new(&config, BackSourceReason::None);
        let mut reader = d.run_stream().await?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        assert_eq!(out, BODY);

        config.md5 = Some("x".into());
        let d = BackSourceDownloader::new(&config, BackSourceReason::None);
        let mut reader = d.run_stream().await?;
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
        Ok(())
    }
}
