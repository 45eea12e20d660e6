//! Applies worker messages to job and asset records.
//!
//! The scheduler only tracks who holds which job. This layer turns its
//! outcomes into record updates: dispatch sets `encoding`/`processing`,
//! `state idle` finishes the held job, `state error` fails it, and an
//! explicit rejection puts it back to `new` without re-queueing.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{QueuedJob, SchedulerEvent, WorkerId, WorkerStatus};
use super::protocol::WorkerMessage;
use super::service::Scheduler;
use crate::modules::asset::model::{AssetState, Job, JobState};
use crate::modules::asset::repository::{AssetStore, StoreError};
use crate::modules::asset::tracker::VariantTracker;
use crate::workers::autoscaler::Autoscaler;
use crate::workers::upload_watcher::UploadWatcher;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("job {0} is not in state new")]
    NotNew(Uuid),
    #[error("job {0} is already queued or assigned")]
    Duplicate(Uuid),
    #[error("job {0} declares no variants")]
    NoVariants(Uuid),
}

pub struct JobLifecycle {
    scheduler: Arc<Scheduler>,
    store: Arc<dyn AssetStore>,
    tracker: Arc<VariantTracker>,
    uploads: Option<UploadWatcher>,
    autoscaler: Option<Arc<Autoscaler>>,
}

impl JobLifecycle {
    pub fn new(
        scheduler: Arc<Scheduler>,
        store: Arc<dyn AssetStore>,
        tracker: Arc<VariantTracker>,
        uploads: Option<UploadWatcher>,
        autoscaler: Option<Arc<Autoscaler>>,
    ) -> Self {
        Self {
            scheduler,
            store,
            tracker,
            uploads,
            autoscaler,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Puts a `new` job on the queue and runs a dispatch pass.
    pub async fn enqueue(&self, job: &Job) -> Result<(), EnqueueError> {
        if job.state != JobState::New {
            return Err(EnqueueError::NotNew(job.id));
        }
        if job.variants.is_empty() {
            return Err(EnqueueError::NoVariants(job.id));
        }
        let queued = QueuedJob {
            job_id: job.id,
            asset_id: job.asset_id,
            variants: job.variants.clone(),
            descriptor: job.descriptor.clone(),
        };
        if !self.scheduler.enqueue(queued) {
            return Err(EnqueueError::Duplicate(job.id));
        }
        self.kick().await;
        Ok(())
    }

    /// One dispatch pass, then record-keeping for what got assigned.
    pub async fn kick(&self) {
        let assignments = self.scheduler.dispatch();
        for assignment in &assignments {
            if let Err(e) = self
                .store
                .set_job_state(assignment.job_id, JobState::Encoding, None)
                .await
            {
                error!(job_id = %assignment.job_id, error = %e, "failed to mark job encoding");
            }
            if let Err(e) = self
                .store
                .set_asset_state(assignment.asset_id, AssetState::Processing)
                .await
            {
                error!(asset_id = %assignment.asset_id, error = %e, "failed to mark asset processing");
            }
        }

        if let Some(autoscaler) = &self.autoscaler {
            let capacity = self.scheduler.capacity();
            if capacity.backlog > capacity.idle {
                let autoscaler = autoscaler.clone();
                tokio::spawn(async move {
                    autoscaler.ensure_capacity(capacity).await;
                });
            }
        }
    }

    /// The single dispatch switch for a registered worker's messages.
    pub async fn on_message(&self, worker_id: WorkerId, message: WorkerMessage) {
        match message {
            WorkerMessage::Register { .. } => {
                debug!(worker_id, "duplicate register ignored");
            }
            WorkerMessage::Info { capabilities } => {
                if self.scheduler.set_info(worker_id, capabilities) {
                    self.kick().await;
                }
            }
            WorkerMessage::Progress {
                job_id,
                position_seconds,
            } => {
                if self.scheduler.progress(worker_id, job_id, position_seconds) {
                    self.log_store(
                        self.store.raise_job_progress(job_id, position_seconds).await,
                        job_id,
                    );
                }
            }
            WorkerMessage::State { status, message } => {
                self.on_state(worker_id, status, message).await;
            }
            WorkerMessage::FileProduced { asset_id, variants } => {
                self.on_file_produced(worker_id, asset_id, variants).await;
            }
            WorkerMessage::AssignAck {
                job_id,
                accepted: true,
                ..
            } => {
                debug!(worker_id, job_id = %job_id, "assignment accepted");
            }
            WorkerMessage::AssignAck {
                job_id,
                accepted: false,
                reason,
            } => {
                if self.scheduler.reject(worker_id, job_id, reason.clone()).is_some() {
                    self.log_store(
                        self.store.set_job_state(job_id, JobState::New, reason).await,
                        job_id,
                    );
                    self.kick().await;
                }
            }
        }
    }

    async fn on_state(&self, worker_id: WorkerId, status: WorkerStatus, message: Option<String>) {
        let freed = self.scheduler.set_status(worker_id, status, message.clone());
        if let Some(slot) = freed {
            match status {
                WorkerStatus::Idle => {
                    info!(worker_id, job_id = %slot.job_id, "job done");
                    self.log_store(
                        self.store.set_job_state(slot.job_id, JobState::Done, None).await,
                        slot.job_id,
                    );
                    if let Err(e) = self.tracker.on_job_done(slot.asset_id).await {
                        error!(asset_id = %slot.asset_id, error = %e, "finisher check failed");
                    }
                }
                WorkerStatus::Error => {
                    warn!(worker_id, job_id = %slot.job_id, message = ?message, "job failed on worker");
                    self.log_store(
                        self.store
                            .set_job_state(slot.job_id, JobState::Error, message)
                            .await,
                        slot.job_id,
                    );
                }
                WorkerStatus::Busy => {}
            }
        }
        if matches!(status, WorkerStatus::Idle | WorkerStatus::Error) {
            self.kick().await;
        }
    }

    async fn on_file_produced(&self, worker_id: WorkerId, asset_id: Uuid, variants: Vec<String>) {
        let expected = match self.scheduler.current_job(worker_id) {
            Some(slot) if slot.asset_id == asset_id => match self.store.get_job(slot.job_id).await {
                Ok(Some(job)) => Some(job.variants),
                Ok(None) => None,
                Err(e) => {
                    error!(job_id = %slot.job_id, error = %e, "job lookup failed");
                    None
                }
            },
            _ => None,
        };
        match &expected {
            Some(expected) => {
                for variant in variants.iter().filter(|v| !expected.contains(v)) {
                    warn!(worker_id, asset_id = %asset_id, variant = %variant, "worker produced an unexpected variant");
                }
            }
            None => {
                warn!(worker_id, asset_id = %asset_id, "file-produced for an asset the worker does not hold");
            }
        }
        self.scheduler.publish(SchedulerEvent::FileProduced {
            worker_id,
            asset_id,
            variants,
        });
        if let Some(uploads) = &self.uploads {
            uploads.nudge();
        }
    }

    fn log_store(&self, result: Result<(), StoreError>, job_id: Uuid) {
        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "job record update failed");
        }
    }
}
