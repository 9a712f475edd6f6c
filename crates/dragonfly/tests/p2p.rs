use std::{collections::HashMap as StdHashMap, path::Path, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{header::RANGE, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use dragonfly::{
    codec::{encode, md5_hex},
    config::{Config, Pattern},
    error::Error,
    hub::Hub,
    meta::MetaStore,
    uploader::ServerLauncher,
    utils::service_file,
};
use serde_json::{json, Value};
use tokio::{io::AsyncReadExt, net::TcpListener, sync::Mutex};

const CONTENT: &[u8] = b"hello dragonfly";
const PIECE_SIZE: usize = 10;
const PAYLOAD: usize = PIECE_SIZE - 5;

type Params = StdHashMap<String, String>;

/// Hands out one piece per pull, the next one once the previous one was
/// acknowledged, then the end of the task.
#[derive(Clone, Default)]
struct FakeNode {
    peer_port: u16,
    path: String,
    pulls: Arc<Mutex<Vec<Params>>>,
    metrics: Arc<Mutex<Vec<Value>>>,
}

impl FakeNode {
    fn pieces(&self) -> Vec<Value> {
        CONTENT
            .chunks(PAYLOAD)
            .enumerate()
            .map(|(i, chunk)| {
                let start = i * PIECE_SIZE;
                json!({
                    "range": format!("{start}-{}", start + PIECE_SIZE - 1),
                    "pieceNum": i,
                    "pieceSize": PIECE_SIZE,
                    "pieceMd5": format!("{}:{}", md5_hex(chunk), chunk.len()),
                    "cid": "peer-a",
                    "peerIp": "127.0.0.1",
                    "peerPort": self.peer_port,
                    "path": self.path,
                })
            })
            .collect()
    }

    fn reply(&self, q: &Params) -> Value {
        let pieces = self.pieces();
        let acked = q.get("result").is_some_and(|r| r == "503" || r == "501");
        let next = match q.get("range").filter(|_| acked) {
            Some(range) => pieces
                .iter()
                .position(|p| p["range"] == range.as_str())
                .map_or(0, |i| i + 1),
            None => 0,
        };

        match pieces.get(next) {
            Some(piece) => json!({"code": 601, "data": [piece]}),
            None => json!({
                "code": 600,
                "data": {"md5": md5_hex(CONTENT), "fileLength": CONTENT.len()},
            }),
        }
    }
}

async fn serve(app: Router) -> Result<u16, Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move { axum::serve(listener, app).await });
    Ok(port)
}

async fn supernode(node: FakeNode) -> Result<u16, Error> {
    let app = Router::new()
        .route(
            "/peer/registry",
            post(|| async {
                Json(json!({
                    "code": 200,
                    "data": {
                        "taskId": "task-1",
                        "fileLength": CONTENT.len(),
                        "pieceSize": PIECE_SIZE,
                    }
                }))
            }),
        )
        .route(
            "/peer/task",
            get(|State(node): State<FakeNode>, Query(q): Query<Params>| async move {
                let reply = node.reply(&q);
                node.pulls.lock().await.push(q);
                Json(reply)
            }),
        )
        .route("/peer/piece/suc", get(|| async { Json(json!({"code": 200})) }))
        .route(
            "/task/metrics",
            post(|State(node): State<FakeNode>, Json(body): Json<Value>| async move {
                node.metrics.lock().await.push(body);
                Json(json!({"code": 200}))
            }),
        )
        .with_state(node);
    serve(app).await
}

/// The supernode side of the cdn: framed pieces of the content.
async fn cdn() -> Result<u16, Error> {
    let app = Router::new().route(
        "/qtdown/hello.txt",
        get(|headers: HeaderMap| async move {
            let start = headers
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("bytes="))
                .and_then(|v| v.split('-').next())
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or_default();
            let from = (start / PIECE_SIZE * PAYLOAD).min(CONTENT.len());
            let to = (from + PAYLOAD).min(CONTENT.len());
            (StatusCode::PARTIAL_CONTENT, encode(&CONTENT[from..to], PIECE_SIZE as u32))
        }),
    );
    serve(app).await
}

async fn get_file(config: Config) -> Result<(), Error> {
    Hub::new(config, ServerLauncher::Embedded)?
        .get_file()
        .await
        .map_err(|e| Error::BackSource(e.to_string()))
}

async fn free_port() -> Result<u16, Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

fn client(home: &Path, node: u16) -> Config {
    let mut config = Config::new(
        "http://src/hello.txt",
        home.join("out").join("hello.txt"),
        home.join("home"),
    );
    config.nodes = vec![format!("127.0.0.1:{node}")];
    config
}

#[tokio::test]
async fn second_peer_downloads_from_the_first() -> Result<(), Error> {
    let a_dir = tempfile::tempdir()?;
    let b_dir = tempfile::tempdir()?;

    // peer a gets the file from the cdn and serves it afterwards
    let node_a = FakeNode {
        peer_port: cdn().await?,
        path: "/qtdown/hello.txt".into(),
        ..Default::default()
    };
    let mut a = client(a_dir.path(), supernode(node_a.clone()).await?);
    a.peer_port = free_port().await?;
    let (a_port, a_sign, a_output) = (a.peer_port, a.sign.clone(), a.output.clone());
    let a_meta = a.rv.meta_path.clone();
    let a_data = a.rv.system_data_dir.clone();

    get_file(a).await?;

    assert_eq!(tokio::fs::read(&a_output).await?, CONTENT);
    assert_eq!(MetaStore::new(&a_meta).service_port().await, a_port);
    let name = format!("hello.txt-{a_sign}");
    assert_eq!(tokio::fs::read(service_file(&name, &a_data)).await?, CONTENT);

    let metrics = node_a.metrics.lock().await;
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0]["success"], true);
    assert_eq!(metrics[0]["taskId"], "task-1");
    assert_eq!(metrics[0]["port"], a_port);
    drop(metrics);

    // peer b only downloads, from the peer server of a
    let node_b = FakeNode {
        peer_port: a_port,
        path: format!("/peer/file/{name}"),
        ..Default::default()
    };
    let mut b = client(b_dir.path(), supernode(node_b.clone()).await?);
    b.pattern = Pattern::Cdn;
    let b_output = b.output.clone();

    get_file(b).await?;
    assert_eq!(tokio::fs::read(&b_output).await?, CONTENT);

    let pulls = node_b.pulls.lock().await;
    assert_eq!(pulls[0]["status"], "700");
    let acked: Vec<&str> = pulls
        .iter()
        .filter(|p| p.get("result").is_some_and(|r| r == "503"))
        .map(|p| p["range"].as_str())
        .collect();
    for piece in node_b.pieces() {
        assert!(acked.contains(&piece["range"].as_str().unwrap_or_default()));
    }
    Ok(())
}

#[tokio::test]
async fn reader_streams_from_the_cdn() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let node = FakeNode {
        peer_port: cdn().await?,
        path: "/qtdown/hello.txt".into(),
        ..Default::default()
    };
    let mut config = client(dir.path(), supernode(node.clone()).await?);
    config.peer_port = free_port().await?;
    let meta = config.rv.meta_path.clone();

    let mut reader = Hub::new(config, ServerLauncher::Embedded)?
        .get_reader()
        .await
        .map_err(|e| Error::BackSource(e.to_string()))?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await?;
    assert_eq!(out, CONTENT);

    // nothing was written and no server was started
    assert!(!dir.path().join("out").exists());
    assert_eq!(MetaStore::new(&meta).service_port().await, 0);
    assert!(node.metrics.lock().await.is_empty());
    Ok(())
}
