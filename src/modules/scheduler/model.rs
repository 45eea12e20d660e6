use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use utoipa::ToSchema;
use uuid::Uuid;

use super::protocol::ServerMessage;

pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
}

/// Declared by the worker in its `info` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerCapabilities {
    /// Looked up in the operator's class -> priority map.
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug)]
pub(crate) enum Connection {
    Connected {
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    Disconnected {
        since: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct JobSlot {
    pub job_id: Uuid,
    pub asset_id: Uuid,
}

#[derive(Debug)]
pub(crate) struct WorkerEntry {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub capabilities: Option<WorkerCapabilities>,
    pub class_priority: i32,
    pub priority_override: Option<i32>,
    pub connection: Connection,
    /// Bumped on every (re)attach; a pending grace expiry only fires for
    /// the epoch it was scheduled for.
    pub epoch: u64,
    pub last_active: Instant,
    pub current_job: Option<JobSlot>,
}

impl WorkerEntry {
    pub fn new(id: WorkerId, outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id,
            status: WorkerStatus::Idle,
            capabilities: None,
            class_priority: 0,
            priority_override: None,
            connection: Connection::Connected { outbound },
            epoch: 0,
            last_active: Instant::now(),
            current_job: None,
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority_override.unwrap_or(self.class_priority)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection, Connection::Connected { .. })
    }

    /// Connected, idle, slot-free and has announced its capabilities.
    pub fn is_dispatchable(&self) -> bool {
        self.is_connected()
            && self.status == WorkerStatus::Idle
            && self.current_job.is_none()
            && self.capabilities.is_some()
    }

    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        (self.is_connected() && self.status == WorkerStatus::Idle && self.current_job.is_none())
            .then(|| now.saturating_duration_since(self.last_active))
    }

    /// Best-effort send; false when the connection is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        match &self.connection {
            Connection::Connected { outbound } => outbound.send(message).is_ok(),
            Connection::Disconnected { .. } => false,
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            status: self.status,
            priority: self.priority(),
            capabilities: self.capabilities.clone(),
            current_job: self.current_job,
            connected: self.is_connected(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub priority: i32,
    #[schema(value_type = Option<Object>)]
    pub capabilities: Option<WorkerCapabilities>,
    pub current_job: Option<JobSlot>,
    pub connected: bool,
}

/// A pending assignment request. The descriptor is handed to the worker verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub asset_id: Uuid,
    pub variants: Vec<String>,
    pub descriptor: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub worker_id: WorkerId,
    pub job_id: Uuid,
    pub asset_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub backlog: usize,
    pub idle: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub id: WorkerId,
    pub epoch: u64,
    pub reconnected: bool,
}

/// Published for observers; nothing in the core waits on delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SchedulerEvent {
    WorkerAdded {
        worker_id: WorkerId,
    },
    WorkerReconnected {
        worker_id: WorkerId,
    },
    WorkerRemoved {
        worker_id: WorkerId,
        job: Option<JobSlot>,
    },
    WorkerUpdated {
        worker_id: WorkerId,
        status: WorkerStatus,
        message: Option<String>,
    },
    Progress {
        worker_id: WorkerId,
        job_id: Uuid,
        position_seconds: f64,
    },
    JobAssigned {
        worker_id: WorkerId,
        job_id: Uuid,
        asset_id: Uuid,
    },
    JobRejected {
        worker_id: WorkerId,
        job_id: Uuid,
        reason: Option<String>,
    },
    FileProduced {
        worker_id: WorkerId,
        asset_id: Uuid,
        variants: Vec<String>,
    },
}
