use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::Worker;

use super::EngineError;

/// Read-only source of the active worker roster.
/// Queried at the start of every operation; the engine never caches it.
#[async_trait]
pub trait WorkerRoster: Send + Sync {
    async fn workers(&self) -> Result<Vec<Worker>, EngineError>;
}

/// In-memory roster. Replaceable at runtime for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticRoster {
    workers: RwLock<Vec<Worker>>,
}

impl StaticRoster {
    pub fn new(workers: Vec<Worker>) -> Self {
        Self {
            workers: RwLock::new(workers),
        }
    }

    pub async fn replace(&self, workers: Vec<Worker>) {
        *self.workers.write().await = workers;
    }
}

#[async_trait]
impl WorkerRoster for StaticRoster {
    async fn workers(&self) -> Result<Vec<Worker>, EngineError> {
        Ok(self.workers.read().await.clone())
    }
}

/// Roster backed by a JSON array of workers on disk, re-read on every call.
/// A missing file is an empty roster.
#[derive(Debug, Clone)]
pub struct JsonFileRoster {
    path: PathBuf,
}

impl JsonFileRoster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WorkerRoster for JsonFileRoster {
    async fn workers(&self) -> Result<Vec<Worker>, EngineError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::Roster(e.to_string())),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Roster(format!("{}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn worker(first: &str) -> Worker {
        Worker {
            id: Ulid::new(),
            first_name: first.into(),
            last_name: "Doe".into(),
        }
    }

    #[tokio::test]
    async fn static_roster_replace() {
        let roster = StaticRoster::new(vec![worker("Ann")]);
        assert_eq!(roster.workers().await.unwrap().len(), 1);
        roster.replace(vec![worker("Ann"), worker("Bob")]).await;
        assert_eq!(roster.workers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn json_roster_missing_file_is_empty() {
        let path = std::env::temp_dir()
            .join("slotkeeper_test_roster")
            .join(format!("{}.json", Ulid::new()));
        let roster = JsonFileRoster::new(path);
        assert!(roster.workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn json_roster_rereads_each_call() {
        let dir = std::env::temp_dir().join("slotkeeper_test_roster");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.json", Ulid::new()));

        let first = vec![worker("Ann")];
        std::fs::write(&path, serde_json::to_vec(&first).unwrap()).unwrap();
        let roster = JsonFileRoster::new(&path);
        assert_eq!(roster.workers().await.unwrap(), first);

        let second = vec![worker("Ann"), worker("Bob")];
        std::fs::write(&path, serde_json::to_vec(&second).unwrap()).unwrap();
        assert_eq!(roster.workers().await.unwrap(), second);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn json_roster_malformed_is_roster_error() {
        let dir = std::env::temp_dir().join("slotkeeper_test_roster");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.json", Ulid::new()));
        std::fs::write(&path, b"{not json").unwrap();

        let err = JsonFileRoster::new(&path).workers().await.unwrap_err();
        assert!(matches!(err, EngineError::Roster(_)));

        let _ = std::fs::remove_file(&path);
    }
}
