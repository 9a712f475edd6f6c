//! Control calls from a downloader to the local peer server.
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        header, LOCAL_HTTP_PATH_CHECK, LOCAL_HTTP_PATH_CLIENT,
        LOCAL_HTTP_PATH_RATE, LOCAL_HTTP_PING, VERSION,
    },
    error::Error,
};

pub const UPLOADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Query of `/client/finish`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FinishTaskRequest {
    #[serde(rename = "taskFileName", default)]
    pub task_file_name: String,
    #[serde(rename = "taskID", default)]
    pub task_id: String,
    #[serde(default)]
    pub cid: String,
    #[serde(rename = "superNode", default)]
    pub super_node: String,
}

#[derive(Debug, Clone)]
pub struct UploaderClient {
    http: Client,
}

impl UploaderClient {
    pub fn new() -> Result<Self, Error> {
        Self::with_timeout(UPLOADER_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, Error> {
        Ok(Self { http: Client::builder().timeout(timeout).build()? })
    }

    /// Ask for a share of the host bandwidth, returns the granted rate.
    pub async fn parse_rate(
        &self,
        ip: &str,
        port: u16,
        task_file_name: &str,
        rate_limit: i64,
    ) -> Result<i64, Error> {
        let url = format!("http://{ip}:{port}{LOCAL_HTTP_PATH_RATE}{task_file_name}");
        let res = self
            .http
            .get(url)
            .header(header::RATE_LIMIT, rate_limit.to_string())
            .send()
            .await?;
        let body = text_ok(res).await?;
        Ok(body.trim().parse()?)
    }

    /// Register the task on the server. Returns the task file name the
    /// server echoed, or an empty string when it runs another version.
    pub async fn check_server(
        &self,
        ip: &str,
        port: u16,
        task_file_name: &str,
        data_dir: &str,
        total_limit: i64,
    ) -> Result<String, Error> {
        let url =
            format!("http://{ip}:{port}{LOCAL_HTTP_PATH_CHECK}{task_file_name}");
        let res = self
            .http
            .get(url)
            .header(header::DATA_DIR, data_dir)
            .header(header::TOTAL_LIMIT, total_limit.to_string())
            .send()
            .await?;
        let body = text_ok(res).await?;

        let suffix = format!("@{VERSION}");
        Ok(body.strip_suffix(&suffix).unwrap_or_default().to_owned())
    }

    pub async fn finish_task(
        &self,
        ip: &str,
        port: u16,
        req: &FinishTaskRequest,
    ) -> Result<(), Error> {
        let url = format!("http://{ip}:{port}{LOCAL_HTTP_PATH_CLIENT}finish");
        let res = self.http.get(url).query(req).send().await?;
        text_ok(res).await?;
        Ok(())
    }

    pub async fn ping_server(&self, ip: &str, port: u16) -> bool {
        let url = format!("http://{ip}:{port}{LOCAL_HTTP_PING}");
        matches!(
            self.http.get(url).send().await,
            Ok(res) if res.status() == StatusCode::OK
        )
    }
}

async fn text_ok(res: reqwest::Response) -> Result<String, Error> {
    let status = res.status();
    let body = res.text().await?;
    if status != StatusCode::OK {
        return Err(Error::PeerStatus(status.as_u16()));
    }
    Ok(body)
}
