use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{SeeFlowError, SeeFlowResult};
use crate::workflow::types::{Step, WorkflowType};

/// Source of workflow definitions. The runner only ever reads.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Steps of the workflow, sorted by `order`.
    async fn load_steps(&self, workflow_id: &str) -> SeeFlowResult<Vec<Step>>;
}

/// On-disk workflow document.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type", alias = "workflow_type")]
    pub workflow_type: WorkflowType,
    pub steps: Vec<Step>,
}

impl WorkflowFile {
    pub fn from_path(path: &Path) -> SeeFlowResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut workflow: WorkflowFile = serde_json::from_str(&content).map_err(|e| {
            SeeFlowError::Workflow(format!("{}: {e}", path.display()))
        })?;
        workflow.steps.sort_by_key(|s| s.order);
        tracing::debug!(
            path = %path.display(),
            steps = workflow.steps.len(),
            "workflow file loaded"
        );
        Ok(workflow)
    }
}

/// Reads `<root>/<workflow_id>.json`.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, workflow_id: &str) -> SeeFlowResult<PathBuf> {
        if workflow_id.is_empty()
            || workflow_id.contains(['/', '\\'])
            || workflow_id.contains("..")
        {
            return Err(SeeFlowError::Workflow(format!(
                "invalid workflow id '{workflow_id}'"
            )));
        }
        Ok(self.root.join(format!("{workflow_id}.json")))
    }
}

#[async_trait]
impl WorkflowStore for JsonFileStore {
    async fn load_steps(&self, workflow_id: &str) -> SeeFlowResult<Vec<Step>> {
        let path = self.path_for(workflow_id)?;
        if !path.exists() {
            return Err(SeeFlowError::Workflow(format!(
                "workflow '{workflow_id}' not found at {}",
                path.display()
            )));
        }
        let workflow = tokio::task::spawn_blocking(move || WorkflowFile::from_path(&path))
            .await
            .map_err(|e| SeeFlowError::Workflow(format!("workflow load task failed: {e}")))??;
        Ok(workflow.steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::StepAction;

    #[tokio::test]
    async fn loads_steps_sorted_by_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("wf1.json"),
            r#"{
                "type": "desktop",
                "steps": [
                    { "action": "wait", "params": { "seconds": 1 }, "order": 2 },
                    { "action": "navigate", "params": { "url": "https://a.test" }, "order": 1 }
                ]
            }"#,
        )
        .expect("write");

        let store = JsonFileStore::new(dir.path());
        let steps = store.load_steps("wf1").await.expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[0].action,
            StepAction::Navigate {
                url: Some("https://a.test".into())
            }
        );
    }

    #[tokio::test]
    async fn rejects_path_traversal_and_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_steps("../etc/passwd").await.is_err());
        assert!(store.load_steps("nope").await.is_err());
    }

    #[test]
    fn workflow_file_defaults_to_browser() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.json");
        std::fs::write(&path, r#"{ "steps": [] }"#).expect("write");
        let wf = WorkflowFile::from_path(&path).expect("parse");
        assert_eq!(wf.workflow_type, WorkflowType::Browser);
    }
}
