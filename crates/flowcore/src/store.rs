use crate::{FlowError, Workflow};
use async_trait::async_trait;

/// Authoritative source of workflow definitions.
///
/// Read at startup and written on save; never consulted while a run is in flight.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Workflow>, FlowError>;

    async fn save(&self, workflow: &Workflow) -> Result<(), FlowError>;
}
