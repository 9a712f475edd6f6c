use std::{path::PathBuf, time::SystemTime};

use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::api::uploader::FinishTaskRequest;

/// A task the peer server knows about, by task file name.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    pub task_id: String,
    /// Rate the downloader of the task asked for, while it runs.
    pub rate_limit: i64,
    pub cid: String,
    pub data_dir: PathBuf,
    pub super_node: String,
    pub finished: bool,
    pub access_time: SystemTime,
}

impl TaskConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_id: String::new(),
            rate_limit: 0,
            cid: String::new(),
            data_dir: data_dir.into(),
            super_node: String::new(),
            finished: false,
            access_time: SystemTime::now(),
        }
    }
}

/// Tasks served by this host. Every mutation happens under the write lock,
/// so readers always see whole entries.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskConfig>>,
}

impl TaskRegistry {
    pub async fn get(&self, name: &str) -> Option<TaskConfig> {
        self.tasks.read().await.get(name).cloned()
    }

    /// Like [`Self::get`], refreshing the access time of the task.
    pub async fn touch(&self, name: &str) -> Option<TaskConfig> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(name)?;
        task.access_time = SystemTime::now();
        Some(task.clone())
    }

    pub async fn put(&self, name: impl Into<String>, task: TaskConfig) {
        self.tasks.write().await.insert(name.into(), task);
    }

    pub async fn remove(&self, name: &str) -> Option<TaskConfig> {
        self.tasks.write().await.remove(name)
    }

    pub async fn set_rate(&self, name: &str, rate: i64) {
        if let Some(task) = self.tasks.write().await.get_mut(name) {
            task.rate_limit = rate;
        }
    }

    /// Mark a task as finished, creating it in `default_data_dir` when the
    /// downloader never checked in.
    pub async fn finish(&self, req: &FinishTaskRequest, default_data_dir: &PathBuf) {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .entry(req.task_file_name.clone())
            .or_insert_with(|| TaskConfig::new(default_data_dir));

        task.task_id.clone_from(&req.task_id);
        task.rate_limit = 0;
        task.cid.clone_from(&req.cid);
        task.super_node.clone_from(&req.super_node);
        task.finished = true;
        task.access_time = SystemTime::now();
    }

    /// Sum of the rates asked by the tasks still downloading.
    pub async fn running_rate(&self) -> i64 {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| !t.finished)
            .map(|t| t.rate_limit)
            .sum()
    }

    pub async fn snapshot(&self) -> Vec<(String, TaskConfig)> {
        self.tasks
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finish_req(name: &str) -> FinishTaskRequest {
        FinishTaskRequest {
            task_file_name: name.into(),
            task_id: "t1".into(),
            cid: "c1".into(),
            super_node: "127.0.0.1:8002".into(),
        }
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let registry = TaskRegistry::default();
        let data = PathBuf::from("/data");

        registry.put("a", TaskConfig::new("/other")).await;
        registry.set_rate("a", 100).await;
        registry.finish(&finish_req("a"), &data).await;
        registry.finish(&finish_req("a"), &data).await;

        let a = registry.get("a").await.unwrap();
        assert!(a.finished);
        assert_eq!(a.rate_limit, 0);
        assert_eq!(a.data_dir, PathBuf::from("/other"));
        assert_eq!(a.super_node, "127.0.0.1:8002");

        // unknown tasks land in the default data dir
        registry.finish(&finish_req("b"), &data).await;
        assert_eq!(registry.get("b").await.unwrap().data_dir, data);
        assert_eq!(registry.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn running_rate_skips_finished() {
        let registry = TaskRegistry::default();
        for (name, rate) in [("a", 100), ("b", 50), ("c", 25)] {
            registry.put(name, TaskConfig::new("/data")).await;
            registry.set_rate(name, rate).await;
        }
        registry.finish(&finish_req("c"), &PathBuf::from("/data")).await;
        assert_eq!(registry.running_rate().await, 150);

        assert!(registry.touch("missing").await.is_none());
        assert!(registry.remove("a").await.is_some());
        assert_eq!(registry.running_rate().await, 50);
    }
}
