//! Registration of a task to one supernode of the weighted list, and
//! migration to the next ones.
use std::{fmt::Display, time::Duration};

use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::{
    api::{
        types::{CdnSource, RegisterRequest, RegisterResponse},
        SupernodeClient,
    },
    config::Config,
    constants::{code, VERSION},
    error::Error,
    locator::{Locator, SupernodeEntry},
    utils::{hostname, task_path},
};

pub const WAIT_AUTH_RETRIES: usize = 3;
pub const WAIT_AUTH_INTERVAL: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterResult {
    /// `host:port` of the supernode that accepted the task.
    pub node: String,
    /// Supernodes left to migrate to.
    pub remainder_nodes: Vec<SupernodeEntry>,
    pub url: String,
    pub task_id: String,
    pub file_length: i64,
    pub piece_size: i32,
    pub cdn_source: CdnSource,
}

impl Display for RegisterResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "node:{} taskID:{} fileLength:{} pieceSize:{} cdnSource:{}",
            self.node,
            self.task_id,
            self.file_length,
            self.piece_size,
            self.cdn_source.as_str()
        )
    }
}

pub struct Registrar {
    api: SupernodeClient,
    locator: Locator,
    request: RegisterRequest,
    wait_auth_interval: Duration,
}

impl Registrar {
    /// The request is built once from the prepared `config`, only the
    /// supernode ip changes between attempts.
    pub fn new(api: SupernodeClient, locator: Locator, config: &Config) -> Self {
        let (md5, identifier) = match (&config.md5, &config.identifier) {
            (Some(md5), _) if !md5.is_empty() => (Some(md5.clone()), None),
            (_, Some(id)) if !id.is_empty() => (None, Some(id.clone())),
            _ => (None, None),
        };

        let request = RegisterRequest {
            raw_url: config.url.clone(),
            task_url: config.rv.task_url.clone(),
            cid: config.rv.cid.clone(),
            ip: config.rv.local_ip.clone(),
            host_name: hostname(),
            port: config.rv.peer_port,
            path: task_path(&config.rv.task_file_name),
            version: VERSION.to_owned(),
            call_system: config.call_system.clone(),
            headers: config.headers.clone(),
            dfdaemon: config.dfdaemon,
            insecure: config.insecure,
            md5,
            identifier,
            super_node_ip: String::new(),
        };

        Self { api, locator, request, wait_auth_interval: WAIT_AUTH_INTERVAL }
    }

    pub fn with_wait_auth_interval(mut self, interval: Duration) -> Self {
        self.wait_auth_interval = interval;
        self
    }

    /// Register to the first supernode that accepts the task, starting
    /// after the last one tried. Calling it again migrates the task.
    pub async fn register(&mut self) -> Result<RegisterResult, Error> {
        let start = Instant::now();
        let mut last: Option<(String, Result<RegisterResponse, Error>)> = None;

        info!("do register to one of {:?}", self.locator.remainder());

        'nodes: while let Some(node) = self.locator.next() {
            let addr = node.addr();
            self.request.super_node_ip = node.host.clone();

            let mut retries = 0;
            loop {
                let res = self.api.register(&addr, &self.request).await;
                match &res {
                    Ok(r) => info!("do register to {addr}, code:{} msg:{:?}", r.code, r.msg),
                    Err(e) => warn!("do register to {addr} error: {e}"),
                }

                let code = res.as_ref().map(|r| r.code).ok();
                last = Some((addr.clone(), res));

                match code {
                    Some(code::WAIT_AUTH) if retries < WAIT_AUTH_RETRIES => {
                        retries += 1;
                        info!(
                            "sleep {:.1}s to wait auth({retries}/{WAIT_AUTH_RETRIES})...",
                            self.wait_auth_interval.as_secs_f64()
                        );
                        sleep(self.wait_auth_interval).await;
                    }
                    Some(code::SUCCESS | code::NEED_AUTH | code::URL_NOT_REACHABLE) => {
                        break 'nodes
                    }
                    _ => break,
                }
            }
        }

        let Some((node, res)) = last else {
            return Err(Error::NodeEmpty);
        };
        let res = res.map_err(|e| Error::RegisterFail(e.to_string()))?;

        match res.code {
            code::SUCCESS => {}
            code::NEED_AUTH => return Err(Error::NeedAuth),
            code => {
                return Err(Error::SupernodeCode {
                    node,
                    code,
                    msg: res.msg.unwrap_or_default(),
                })
            }
        }

        let data = res.data.unwrap_or_default();
        let result = RegisterResult {
            node,
            remainder_nodes: self.locator.remainder().to_vec(),
            url: self.request.raw_url.clone(),
            task_id: data.task_id,
            file_length: data.file_length,
            piece_size: data.piece_size,
            cdn_source: data.cdn_source,
        };

        info!(
            "do register result:{result} and cost:{:.3}s",
            start.elapsed().as_secs_f64()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::*;

    /// Fake supernode answering register with the codes in `codes`, in
    /// order, then always the last one.
    async fn supernode(codes: Vec<i32>) -> (SupernodeEntry, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = (Arc::new(codes), hits.clone());

        let app = Router::new()
            .route(
                "/peer/registry",
                post(
                    |State((codes, hits)): State<(Arc<Vec<i32>>, Arc<AtomicUsize>)>,
                     Json(req): Json<Value>| async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst);
                        let code = codes[n.min(codes.len() - 1)];
                        assert_eq!(req["rawUrl"], "http://src/hello.txt");
                        Json(json!({
                            "code": code,
                            "msg": "from fake",
                            "data": {"taskId": format!("t-{}", req["superNodeIp"].as_str().unwrap()),
                                     "fileLength": 5, "pieceSize": 10}
                        }))
                    },
                ),
            )
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let entry = SupernodeEntry { host: "127.0.0.1".into(), port, weight: 1 };
        (entry, hits)
    }

    fn config() -> Config {
        Config::new("http://src/hello.txt", "/tmp/hello.txt", "/tmp/home")
    }

    #[tokio::test]
    async fn first_success_wins() -> Result<(), Error> {
        let (bad, bad_hits) = supernode(vec![code::SYSTEM_ERROR]).await;
        let (good, _) = supernode(vec![code::SUCCESS]).await;
        let (rest, rest_hits) = supernode(vec![code::SUCCESS]).await;

        let locator = Locator::new(vec![bad, good.clone(), rest.clone()]);
        let mut registrar = Registrar::new(SupernodeClient::new()?, locator, &config());

        let result = registrar.register().await?;
        assert_eq!(result.node, good.addr());
        assert_eq!(result.task_id, "t-127.0.0.1");
        assert_eq!(result.piece_size, 10);
        assert_eq!(result.remainder_nodes, vec![rest.clone()]);
        assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
        assert_eq!(rest_hits.load(Ordering::SeqCst), 0);

        // migration continues with the remainder
        let result = registrar.register().await?;
        assert_eq!(result.node, rest.addr());
        assert!(result.remainder_nodes.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn wait_auth_retries_same_node() -> Result<(), Error> {
        let (node, hits) =
            supernode(vec![code::WAIT_AUTH, code::WAIT_AUTH, code::SUCCESS]).await;

        let locator = Locator::new(vec![node.clone(), node]);
        let mut registrar = Registrar::new(SupernodeClient::new()?, locator, &config())
            .with_wait_auth_interval(Duration::from_millis(10));

        registrar.register().await?;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // the duplicate was not consumed
        assert_eq!(registrar.locator.remainder().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn need_auth_stops() -> Result<(), Error> {
        let (node, _) = supernode(vec![code::NEED_AUTH]).await;
        let (other, other_hits) = supernode(vec![code::SUCCESS]).await;

        let locator = Locator::new(vec![node, other]);
        let mut registrar = Registrar::new(SupernodeClient::new()?, locator, &config());

        let err = registrar.register().await.unwrap_err();
        assert!(matches!(err, Error::NeedAuth));
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn every_node_fails() -> Result<(), Error> {
        let locator = Locator::new(vec![]);
        let mut registrar = Registrar::new(SupernodeClient::new()?, locator, &config());
        assert!(matches!(registrar.register().await, Err(Error::NodeEmpty)));

        let (node, _) = supernode(vec![code::TASK_CONFLICT]).await;
        let locator = Locator::new(vec![node]);
        let mut registrar = Registrar::new(SupernodeClient::new()?, locator, &config());
        let err = registrar.register().await.unwrap_err();
        assert!(matches!(err, Error::SupernodeCode { code: 606, .. }));
        Ok(())
    }
}
