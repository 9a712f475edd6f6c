use std::time::Duration;

use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::types::{
    BaseResponse, ClientErrorRequest, PullPieceTaskRequest,
    PullPieceTaskResponse, RegisterRequest, RegisterResponse,
    ReportPieceRequest, TaskMetricsRequest,
};
use crate::{
    constants::{user_agent, SUPERNODE_TIMEOUT},
    error::Error,
};

pub const PEER_REGISTER_PATH: &str = "/peer/registry";
pub const PEER_PULL_PIECE_TASK_PATH: &str = "/peer/task";
pub const PEER_REPORT_PIECE_PATH: &str = "/peer/piece/suc";
pub const PEER_CLIENT_ERROR_PATH: &str = "/peer/piece/error";
pub const PEER_SERVICE_DOWN_PATH: &str = "/peer/service/down";
pub const TASK_METRICS_PATH: &str = "/task/metrics";

const METRICS_RETRIES: usize = 2;

/// Stateless HTTP client of the supernode API. Every call takes the
/// supernode as `host:port`, so one client can talk to all of them.
#[derive(Debug, Clone)]
pub struct SupernodeClient {
    http: Client,
}

impl SupernodeClient {
    pub fn new() -> Result<Self, Error> {
        Self::with_timeout(SUPERNODE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, Error> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent())
            .build()?;
        Ok(Self { http })
    }

    pub async fn register(
        &self,
        node: &str,
        req: &RegisterRequest,
    ) -> Result<RegisterResponse, Error> {
        let res = self
            .http
            .post(url(node, PEER_REGISTER_PATH))
            .json(req)
            .send()
            .await?;
        decode(res).await
    }

    pub async fn pull_piece_task(
        &self,
        node: &str,
        req: &PullPieceTaskRequest,
    ) -> Result<PullPieceTaskResponse, Error> {
        self.get(node, PEER_PULL_PIECE_TASK_PATH, req).await
    }

    pub async fn report_piece(
        &self,
        node: &str,
        req: &ReportPieceRequest,
    ) -> Result<BaseResponse, Error> {
        self.get(node, PEER_REPORT_PIECE_PATH, req).await
    }

    pub async fn service_down(
        &self,
        node: &str,
        task_id: &str,
        cid: &str,
    ) -> Result<BaseResponse, Error> {
        self.get(
            node,
            PEER_SERVICE_DOWN_PATH,
            &[("taskId", task_id), ("cid", cid)],
        )
        .await
    }

    pub async fn report_client_error(
        &self,
        node: &str,
        req: &ClientErrorRequest,
    ) -> Result<BaseResponse, Error> {
        self.get(node, PEER_CLIENT_ERROR_PATH, req).await
    }

    /// Sent once, then retried at most twice.
    pub async fn report_metrics(
        &self,
        node: &str,
        req: &TaskMetricsRequest,
    ) -> Result<BaseResponse, Error> {
        let mut attempt = 0;
        loop {
            let res = async {
                let res = self
                    .http
                    .post(url(node, TASK_METRICS_PATH))
                    .json(req)
                    .send()
                    .await?;
                decode::<BaseResponse>(res).await
            }
            .await;

            match res {
                Ok(res) => return Ok(res),
                Err(e) if attempt < METRICS_RETRIES => {
                    attempt += 1;
                    warn!("report metrics to {node} failed: {e}, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get<Q, T>(&self, node: &str, path: &str, query: &Q) -> Result<T, Error>
    where
        Q: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let res = self.http.get(url(node, path)).query(query).send().await?;
        decode(res).await
    }
}

fn url(node: &str, path: &str) -> String {
    format!("http://{node}{path}")
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, Error> {
    let status = res.status();
    let body = res.bytes().await?;
    if !status.is_success() {
        return Err(Error::SupernodeStatus(
            status.as_u16(),
            String::from_utf8_lossy(&body).trim().to_owned(),
        ));
    }
    debug!("supernode response: {}", String::from_utf8_lossy(&body));
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use axum::{
        extract::{Query, State},
        http::StatusCode,
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use tokio::{net::TcpListener, sync::Mutex};

    use super::*;

    type Params = HashMap<String, String>;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("127.0.0.1:{port}")
    }

    /// Answers metrics with 500 for the first `failures` hits.
    async fn metrics_node(failures: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                TASK_METRICS_PATH,
                post(
                    move |State(hits): State<Arc<AtomicUsize>>,
                          Json(body): Json<TaskMetricsRequest>| async move {
                        assert_eq!(body.task_id, "t1");
                        if hits.fetch_add(1, Ordering::SeqCst) < failures {
                            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                        }
                        Json(json!({"code": 200})).into_response()
                    },
                ),
            )
            .with_state(hits.clone());
        (serve(app).await, hits)
    }

    fn metrics() -> TaskMetricsRequest {
        TaskMetricsRequest { task_id: "t1".into(), ..Default::default() }
    }

    #[tokio::test]
    async fn metrics_retried_at_most_twice() -> Result<(), Error> {
        let api = SupernodeClient::new()?;

        let (node, hits) = metrics_node(usize::MAX).await;
        let err = api.report_metrics(&node, &metrics()).await.unwrap_err();
        assert!(matches!(err, Error::SupernodeStatus(500, _)));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let (node, hits) = metrics_node(1).await;
        let res = api.report_metrics(&node, &metrics()).await?;
        assert_eq!(res.code, 200);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn queries_carry_the_task() -> Result<(), Error> {
        let seen: Arc<Mutex<Vec<(&'static str, Params)>>> = Arc::default();
        let record = |path: &'static str| {
            move |State(seen): State<Arc<Mutex<Vec<(&'static str, Params)>>>>,
                  Query(q): Query<Params>| async move {
                seen.lock().await.push((path, q));
                Json(json!({"code": 200}))
            }
        };
        let app = Router::new()
            .route(PEER_SERVICE_DOWN_PATH, get(record(PEER_SERVICE_DOWN_PATH)))
            .route(PEER_CLIENT_ERROR_PATH, get(record(PEER_CLIENT_ERROR_PATH)))
            .with_state(seen.clone());
        let node = serve(app).await;
        let api = SupernodeClient::new()?;

        api.service_down(&node, "t1", "c1").await?;
        let req = ClientErrorRequest {
            error_type: "FILE_MD5_NOT_MATCH".into(),
            src_cid: "c1".into(),
            dst_cid: "c2".into(),
            dst_ip: "10.0.0.2".into(),
            task_id: "t1".into(),
            range: "0-9".into(),
            real_md5: "aa".into(),
            expected_md5: "bb".into(),
        };
        let res = api.report_client_error(&node, &req).await?;
        assert_eq!(res.code, 200);

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 2);

        let (path, down) = &seen[0];
        assert_eq!(*path, PEER_SERVICE_DOWN_PATH);
        assert_eq!(down.len(), 2);
        assert_eq!(down["taskId"], "t1");
        assert_eq!(down["cid"], "c1");

        let (path, error) = &seen[1];
        assert_eq!(*path, PEER_CLIENT_ERROR_PATH);
        assert_eq!(error["errorType"], "FILE_MD5_NOT_MATCH");
        assert_eq!(error["srcCid"], "c1");
        assert_eq!(error["dstCid"], "c2");
        assert_eq!(error["dstIp"], "10.0.0.2");
        assert_eq!(error["taskId"], "t1");
        assert_eq!(error["range"], "0-9");
        assert_eq!(error["realMd5"], "aa");
        assert_eq!(error["expectedMd5"], "bb");
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_node_is_an_http_error() -> Result<(), Error> {
        let api = SupernodeClient::with_timeout(Duration::from_millis(200))?;
        let err = api.service_down("127.0.0.1:1", "t1", "c1").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        Ok(())
    }
}
