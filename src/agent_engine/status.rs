use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SeeFlowResult;

/// Terminal status of a run, pushed to the host exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// `automatic` is true when retries were exhausted rather than the model asking.
    AwaitingUser { reason: String, automatic: bool },
    Failed { reason: String },
    Cancelled,
}

#[async_trait]
pub trait RunStatusReporter: Send + Sync {
    async fn report(&self, status: RunStatus) -> SeeFlowResult<()>;
}

/// Only logs the status.
#[derive(Debug, Default, Clone)]
pub struct LogReporter;

#[async_trait]
impl RunStatusReporter for LogReporter {
    async fn report(&self, status: RunStatus) -> SeeFlowResult<()> {
        tracing::info!(status = ?status, "run finished");
        Ok(())
    }
}

#[derive(Serialize)]
struct StatusRecord<'a> {
    #[serde(flatten)]
    status: &'a RunStatus,
    finished_at: chrono::DateTime<chrono::Utc>,
}

/// Writes the status as a JSON document, replacing any previous content.
#[derive(Debug, Clone)]
pub struct JsonFileReporter {
    path: PathBuf,
}

impl JsonFileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RunStatusReporter for JsonFileReporter {
    async fn report(&self, status: RunStatus) -> SeeFlowResult<()> {
        let record = StatusRecord {
            status: &status,
            finished_at: chrono::Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        tracing::info!(path = %self.path.display(), status = ?status, "run status written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_file_reporter_writes_tagged_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out").join("status.json");
        JsonFileReporter::new(&path)
            .report(RunStatus::AwaitingUser {
                reason: "Need the 2FA code".into(),
                automatic: false,
            })
            .await
            .expect("report");
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["status"], "awaiting_user");
        assert_eq!(value["reason"], "Need the 2FA code");
        assert_eq!(value["automatic"], false);
        assert!(value["finished_at"].is_string());
    }
}
