//! Matches queued jobs to idle workers.
//!
//! Reading the worker list, picking a worker, popping the queue head and
//! recording the assignment all happen under one acquisition of the
//! scheduler lock. The loop is greedy and stops as soon as either the queue
//! or the set of dispatchable workers is empty.

use std::collections::BTreeMap;

use tokio::time::Instant;
use tracing::{info, warn};

use super::model::{Assignment, JobSlot, SchedulerEvent, WorkerEntry, WorkerId, WorkerStatus};
use super::protocol::ServerMessage;
use super::service::{Scheduler, SchedulerState};

/// Highest priority first, lowest id on ties.
fn pick_worker(workers: &BTreeMap<WorkerId, WorkerEntry>) -> Option<WorkerId> {
    workers
        .values()
        .filter(|w| w.is_dispatchable())
        .max_by(|a, b| a.priority().cmp(&b.priority()).then(b.id.cmp(&a.id)))
        .map(|w| w.id)
}

fn dispatch_locked(state: &mut SchedulerState) -> Vec<Assignment> {
    let mut assignments = Vec::new();
    while !state.queue.is_empty() {
        let Some(worker_id) = pick_worker(&state.workers) else {
            break;
        };
        let Some(job) = state.queue.pop_front() else {
            break;
        };
        let Some(worker) = state.workers.get_mut(&worker_id) else {
            state.queue.push_front(job);
            break;
        };

        let sent = worker.send(ServerMessage::AssignJob {
            job_id: job.job_id,
            asset_id: job.asset_id,
            variants: job.variants.clone(),
            descriptor: job.descriptor.clone(),
        });
        if !sent {
            // Channel closed under us: take the worker out of rotation and
            // keep the job at the head.
            warn!(worker_id, job_id = %job.job_id, "assignment send failed");
            worker.status = WorkerStatus::Error;
            state.queue.push_front(job);
            continue;
        }

        worker.status = WorkerStatus::Busy;
        worker.last_active = Instant::now();
        worker.current_job = Some(JobSlot {
            job_id: job.job_id,
            asset_id: job.asset_id,
        });
        assignments.push(Assignment {
            worker_id,
            job_id: job.job_id,
            asset_id: job.asset_id,
        });
    }
    assignments
}

impl Scheduler {
    pub fn dispatch(&self) -> Vec<Assignment> {
        let assignments = {
            let mut state = self.state.lock();
            dispatch_locked(&mut state)
        };
        for a in &assignments {
            info!(worker_id = a.worker_id, job_id = %a.job_id, asset_id = %a.asset_id, "job assigned");
            self.publish(SchedulerEvent::JobAssigned {
                worker_id: a.worker_id,
                job_id: a.job_id,
                asset_id: a.asset_id,
            });
        }
        assignments
    }
}
