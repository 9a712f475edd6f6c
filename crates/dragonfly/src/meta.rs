//! Port of the running peer server, persisted in `host.meta` so later
//! invocations can reuse the server.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use tokio::{fs, time::sleep};
use tracing::warn;

use crate::error::Error;

const LOCK_RETRY: Duration = Duration::from_millis(10);
const LOCK_ATTEMPTS: usize = 300;
/// A lock file older than this was left by a dead process.
const STALE_LOCK: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    pub service_port: u16,
}

#[derive(Debug, Clone)]
pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file reads as the default record.
    pub async fn load(&self) -> Result<MetaData, Error> {
        match fs::read(&self.path).await {
            Ok(buf) => Ok(serde_json::from_slice(&buf)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(MetaData::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// The port of the last peer server, 0 when unknown.
    pub async fn service_port(&self) -> u16 {
        self.load().await.map(|m| m.service_port).unwrap_or_default()
    }

    pub async fn update_service_port(&self, port: u16) -> Result<(), Error> {
        let _lock = FileLock::acquire(&self.path).await?;

        let mut meta = self.load().await.unwrap_or_default();
        if meta.service_port == port && self.path.exists() {
            return Ok(());
        }
        meta.service_port = port;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(&self.path, serde_json::to_vec(&meta)?).await?;
        Ok(())
    }
}

/// Advisory lock held by creating `{path}.lock`, released on drop.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    async fn acquire(target: &Path) -> Result<Self, Error> {
        let mut path = target.as_os_str().to_owned();
        path.push(".lock");
        let path = PathBuf::from(path);

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        for _ in 0..LOCK_ATTEMPTS {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path).await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path).await {
                        warn!("removing stale lock {path:?}");
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::IO(std::io::Error::new(
            ErrorKind::WouldBlock,
            format!("could not lock {path:?}"),
        )))
    }
}

async fn is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age > STALE_LOCK)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_port() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let store = MetaStore::new(dir.path().join("meta").join("host.meta"));

        assert_eq!(store.service_port().await, 0);

        store.update_service_port(15123).await?;
        assert_eq!(store.service_port().await, 15123);
        let raw = fs::read_to_string(store.path()).await?;
        assert_eq!(raw, r#"{"servicePort":15123}"#);

        store.update_service_port(0).await?;
        assert_eq!(store.load().await?, MetaData { service_port: 0 });

        // the lock was released
        assert!(!dir.path().join("meta").join("host.meta.lock").exists());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_updates() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("host.meta");

        let mut handles = Vec::new();
        for port in 15000..15010 {
            let store = MetaStore::new(&path);
            handles.push(tokio::spawn(async move {
                store.update_service_port(port).await
            }));
        }
        for h in handles {
            h.await??;
        }

        let port = MetaStore::new(&path).service_port().await;
        assert!((15000..15010).contains(&port));
        Ok(())
    }
}
