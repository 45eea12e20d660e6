use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::model::WorkerSnapshot;

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetPriorityRequest {
    /// `null` clears the override and falls back to the class priority.
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkerListResponse {
    pub workers: Vec<WorkerSnapshot>,
    #[schema(value_type = Vec<String>)]
    pub queued_jobs: Vec<uuid::Uuid>,
}
