use async_trait::async_trait;
use dashmap::DashMap;
use flowcore::{FlowError, Workflow, WorkflowError, WorkflowId, WorkflowStore};
use std::path::{Path, PathBuf};

/// Workflows held in memory
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: DashMap<WorkflowId, Workflow>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflows(workflows: impl IntoIterator<Item = Workflow>) -> Self {
        let store = Self::new();
        for workflow in workflows {
            store.workflows.insert(workflow.id.clone(), workflow);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn load_all(&self) -> Result<Vec<Workflow>, FlowError> {
        let mut workflows: Vec<Workflow> = self.workflows.iter().map(|w| w.value().clone()).collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    async fn save(&self, workflow: &Workflow) -> Result<(), FlowError> {
        self.workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }
}

/// One `<id>.json` file per workflow in a directory
pub struct JsonDirectoryStore {
    dir: PathBuf,
}

impl JsonDirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, workflow_id: &str) -> Result<PathBuf, FlowError> {
        let usable = !workflow_id.is_empty()
            && !workflow_id.starts_with('.')
            && !workflow_id.contains(['/', '\\']);
        if !usable {
            return Err(WorkflowError::Invalid(format!(
                "workflow id '{}' cannot be used as a file name",
                workflow_id
            ))
            .into());
        }
        Ok(self.dir.join(format!("{}.json", workflow_id)))
    }
}

#[async_trait]
impl WorkflowStore for JsonDirectoryStore {
    async fn load_all(&self) -> Result<Vec<Workflow>, FlowError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut workflows = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(text) => serde_json::from_str::<Workflow>(&text).map_err(FlowError::from),
                Err(err) => Err(err.into()),
            };
            match parsed {
                Ok(workflow) => workflows.push(workflow),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable workflow file")
                }
            }
        }

        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    async fn save(&self, workflow: &Workflow) -> Result<(), FlowError> {
        let path = self.path_for(&workflow.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec_pretty(workflow)?).await?;
        tokio::fs::rename(&staging, &path).await?;
        tracing::debug!(workflow_id = %workflow.id, path = %path.display(), "Workflow saved");
        Ok(())
    }
}
