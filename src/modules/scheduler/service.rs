//! Worker registry and job queue behind one mutex.
//!
//! Workers are addressed by id only. Every mutation of the registry or the
//! queue happens inside a method of [`Scheduler`] while its lock is held.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    Capacity, Connection, JobSlot, QueuedJob, Registration, SchedulerEvent, WorkerCapabilities,
    WorkerEntry, WorkerId, WorkerSnapshot, WorkerStatus,
};
use super::protocol::{ServerMessage, verify_worker_token};
use crate::config::settings::SchedulerConfig;

const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
pub(crate) struct SchedulerState {
    pub workers: BTreeMap<WorkerId, WorkerEntry>,
    pub queue: VecDeque<QueuedJob>,
    next_id: WorkerId,
}

impl SchedulerState {
    fn issue_id(&mut self) -> WorkerId {
        self.next_id += 1;
        self.next_id
    }
}

pub struct Scheduler {
    pub(crate) state: Mutex<SchedulerState>,
    config: SchedulerConfig,
    token_secret: String,
    pub(crate) events: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, token_secret: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(SchedulerState::default()),
            config,
            token_secret: token_secret.into(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Registers or reattaches a worker connection. `None` when the token
    /// is refused; no id is issued in that case.
    pub fn register(
        &self,
        previous_id: Option<WorkerId>,
        token: &str,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Option<Registration> {
        let Some(claims) = verify_worker_token(token, &self.token_secret) else {
            warn!(previous_id = ?previous_id, "worker registration refused");
            return None;
        };

        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(entry) = previous_id.and_then(|id| state.workers.get_mut(&id)) {
            if let Connection::Disconnected { since } = entry.connection {
                if now.saturating_duration_since(since) < self.config.grace_window {
                    entry.connection = Connection::Connected {
                        outbound: outbound.clone(),
                    };
                    entry.epoch += 1;
                    entry.last_active = now;
                    let registration = Registration {
                        id: entry.id,
                        epoch: entry.epoch,
                        reconnected: true,
                    };
                    let _ = outbound.send(ServerMessage::Registered { id: entry.id });
                    drop(state);
                    info!(worker_id = registration.id, worker = %claims.sub, "worker reconnected");
                    self.publish(SchedulerEvent::WorkerReconnected {
                        worker_id: registration.id,
                    });
                    return Some(registration);
                }
            }
        }

        let id = state.issue_id();
        state.workers.insert(id, WorkerEntry::new(id, outbound.clone()));
        drop(state);

        let _ = outbound.send(ServerMessage::Registered { id });
        info!(worker_id = id, worker = %claims.sub, "worker registered");
        self.publish(SchedulerEvent::WorkerAdded { worker_id: id });
        Some(Registration {
            id,
            epoch: 0,
            reconnected: false,
        })
    }

    /// Starts the grace window. The entry and its job slot are purged
    /// unless the worker reattaches before it runs out.
    pub fn disconnect(self: &Arc<Self>, id: WorkerId, epoch: u64) {
        {
            let mut state = self.state.lock();
            let Some(entry) = state.workers.get_mut(&id) else {
                return;
            };
            if entry.epoch != epoch || !entry.is_connected() {
                return;
            }
            entry.connection = Connection::Disconnected {
                since: Instant::now(),
            };
        }
        debug!(worker_id = id, grace = ?self.config.grace_window, "worker disconnected");

        let scheduler = self.clone();
        let grace = self.config.grace_window;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            scheduler.expire(id, epoch);
        });
    }

    /// Removes a worker still disconnected in `epoch`. Returns whether it did.
    pub(crate) fn expire(&self, id: WorkerId, epoch: u64) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.workers.get(&id) {
                Some(entry) if entry.epoch == epoch && !entry.is_connected() => {
                    state.workers.remove(&id)
                }
                _ => None,
            }
        };
        let Some(entry) = removed else {
            return false;
        };
        match entry.current_job {
            Some(slot) => warn!(
                worker_id = id,
                job_id = %slot.job_id,
                asset_id = %slot.asset_id,
                "worker removed while holding a job; job is not requeued"
            ),
            None => info!(worker_id = id, "worker removed"),
        }
        self.publish(SchedulerEvent::WorkerRemoved {
            worker_id: id,
            job: entry.current_job,
        });
        true
    }

    /// Stores capabilities and derives the class priority.
    /// Returns true for the first `info` of a connection.
    pub fn set_info(&self, id: WorkerId, capabilities: WorkerCapabilities) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.workers.get_mut(&id) else {
            return false;
        };
        entry.class_priority = self
            .config
            .class_priorities
            .get(&capabilities.class)
            .copied()
            .unwrap_or(0);
        let first = entry.capabilities.is_none();
        entry.capabilities = Some(capabilities);
        entry.last_active = Instant::now();
        let status = entry.status;
        drop(state);

        self.publish(SchedulerEvent::WorkerUpdated {
            worker_id: id,
            status,
            message: None,
        });
        first
    }

    /// Mirrors a worker state report. `idle` and `error` free the job slot,
    /// which is returned.
    pub fn set_status(
        &self,
        id: WorkerId,
        status: WorkerStatus,
        message: Option<String>,
    ) -> Option<JobSlot> {
        let freed = {
            let mut state = self.state.lock();
            let entry = state.workers.get_mut(&id)?;
            entry.status = status;
            entry.last_active = Instant::now();
            match status {
                WorkerStatus::Idle | WorkerStatus::Error => entry.current_job.take(),
                WorkerStatus::Busy => None,
            }
        };
        self.publish(SchedulerEvent::WorkerUpdated {
            worker_id: id,
            status,
            message,
        });
        freed
    }

    /// Returns true when `job_id` is the worker's current job.
    pub fn progress(&self, id: WorkerId, job_id: Uuid, position_seconds: f64) -> bool {
        let holds = {
            let mut state = self.state.lock();
            let Some(entry) = state.workers.get_mut(&id) else {
                return false;
            };
            entry.last_active = Instant::now();
            entry.current_job.is_some_and(|slot| slot.job_id == job_id)
        };
        self.publish(SchedulerEvent::Progress {
            worker_id: id,
            job_id,
            position_seconds,
        });
        holds
    }

    pub fn current_job(&self, id: WorkerId) -> Option<JobSlot> {
        self.state.lock().workers.get(&id)?.current_job
    }

    /// Explicit rejection of an assignment: the slot is freed and returned.
    /// The job is not put back on the queue.
    pub fn reject(&self, id: WorkerId, job_id: Uuid, reason: Option<String>) -> Option<JobSlot> {
        let freed = {
            let mut state = self.state.lock();
            let entry = state.workers.get_mut(&id)?;
            if entry.current_job.is_none_or(|slot| slot.job_id != job_id) {
                return None;
            }
            entry.status = WorkerStatus::Idle;
            entry.current_job.take()
        };
        warn!(worker_id = id, job_id = %job_id, reason = ?reason, "assignment rejected");
        self.publish(SchedulerEvent::JobRejected {
            worker_id: id,
            job_id,
            reason,
        });
        freed
    }

    /// Operator override; `None` falls back to the class priority.
    pub fn set_priority_override(&self, id: WorkerId, priority: Option<i32>) -> bool {
        let mut state = self.state.lock();
        match state.workers.get_mut(&id) {
            Some(entry) => {
                entry.priority_override = priority;
                true
            }
            None => false,
        }
    }

    /// Asks a worker to terminate itself.
    pub fn quit(&self, id: WorkerId) -> bool {
        let state = self.state.lock();
        state
            .workers
            .get(&id)
            .is_some_and(|entry| entry.send(ServerMessage::Quit))
    }

    /// Appends to the queue tail. Refused when the job is already queued
    /// or already assigned.
    pub fn enqueue(&self, job: QueuedJob) -> bool {
        let mut state = self.state.lock();
        let queued = state.queue.iter().any(|q| q.job_id == job.job_id);
        let assigned = state
            .workers
            .values()
            .any(|w| w.current_job.is_some_and(|slot| slot.job_id == job.job_id));
        if queued || assigned {
            return false;
        }
        debug!(job_id = %job.job_id, asset_id = %job.asset_id, "job queued");
        state.queue.push_back(job);
        true
    }

    /// Removes a still-queued job. Dispatched jobs cannot be cancelled.
    pub fn remove_queued(&self, job_id: Uuid) -> bool {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.retain(|q| q.job_id != job_id);
        state.queue.len() != before
    }

    pub fn queued_jobs(&self) -> Vec<Uuid> {
        self.state.lock().queue.iter().map(|q| q.job_id).collect()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.state
            .lock()
            .workers
            .values()
            .map(WorkerEntry::snapshot)
            .collect()
    }

    pub fn capacity(&self) -> Capacity {
        let state = self.state.lock();
        Capacity {
            backlog: state.queue.len(),
            idle: state
                .workers
                .values()
                .filter(|w| w.is_dispatchable())
                .count(),
        }
    }

    /// Sends `quit` to workers idle past the configured threshold.
    pub fn sweep_idle(&self) -> Vec<WorkerId> {
        let Some(threshold) = self.config.idle_shutdown else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut quit = Vec::new();
        for entry in state.workers.values_mut() {
            if entry.idle_for(now).is_some_and(|idle| idle >= threshold)
                && entry.send(ServerMessage::Quit)
            {
                entry.last_active = now;
                quit.push(entry.id);
            }
        }
        if !quit.is_empty() {
            info!(workers = ?quit, "idle workers asked to quit");
        }
        quit
    }

    pub async fn run_idle_sweeper(self: Arc<Self>) {
        let Some(threshold) = self.config.idle_shutdown else {
            return;
        };
        let period = threshold.min(std::time::Duration::from_secs(5));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            self.sweep_idle();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::modules::scheduler::protocol::issue_worker_token;

    pub(crate) const SECRET: &str = "worker-secret";

    pub(crate) fn scheduler(grace_secs: u64) -> Arc<Scheduler> {
        let config = SchedulerConfig {
            class_priorities: [("gpu".to_string(), 10), ("cpu".to_string(), 5)]
                .into_iter()
                .collect(),
            grace_window: Duration::from_secs(grace_secs),
            idle_shutdown: None,
        };
        Arc::new(Scheduler::new(config, SECRET))
    }

    pub(crate) fn connect(
        scheduler: &Scheduler,
        previous_id: Option<WorkerId>,
    ) -> (Registration, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = issue_worker_token(SECRET, "enc", 600);
        let registration = scheduler.register(previous_id, &token, tx).unwrap();
        (registration, rx)
    }

    pub(crate) fn capabilities(class: &str) -> WorkerCapabilities {
        WorkerCapabilities {
            class: class.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn queued(n: u8) -> QueuedJob {
        QueuedJob {
            job_id: Uuid::new_v4(),
            asset_id: Uuid::new_v4(),
            variants: vec!["1000k".into()],
            descriptor: json!({ "n": n }),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn bad_token_issues_no_id() {
        let scheduler = scheduler(5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(scheduler.register(None, "forged", tx).is_none());
        assert!(scheduler.snapshot().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_unknown_ids_get_fresh_ones() {
        let scheduler = scheduler(5);
        let (a, mut rx) = connect(&scheduler, None);
        let (b, _) = connect(&scheduler, Some(99));
        let (c, _) = connect(&scheduler, Some(a.id));
        assert!(a.id < b.id && b.id < c.id);
        assert!(!c.reconnected);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Registered { id: a.id });
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_keeps_slot() {
        let scheduler = scheduler(5);
        let mut events = scheduler.subscribe();
        let (reg, _rx) = connect(&scheduler, None);
        scheduler.set_info(reg.id, capabilities("gpu"));
        scheduler.enqueue(queued(1));
        let assigned = scheduler.dispatch();
        assert_eq!(assigned.len(), 1);

        scheduler.disconnect(reg.id, reg.epoch);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let (again, _rx2) = connect(&scheduler, Some(reg.id));
        assert!(again.reconnected);
        assert_eq!(again.id, reg.id);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot[0].current_job.map(|s| s.job_id),
            Some(assigned[0].job_id)
        );
        let seen = drain(&mut events);
        assert!(
            !seen
                .iter()
                .any(|e| matches!(e, SchedulerEvent::WorkerRemoved { .. }))
        );
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, SchedulerEvent::WorkerAdded { .. }))
                .count(),
            1
        );
        assert!(seen.contains(&SchedulerEvent::WorkerReconnected { worker_id: reg.id }));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_grace_is_a_new_worker() {
        let scheduler = scheduler(5);
        let mut events = scheduler.subscribe();
        let (reg, _rx) = connect(&scheduler, None);
        scheduler.set_info(reg.id, capabilities("gpu"));
        scheduler.enqueue(queued(1));
        let assigned = scheduler.dispatch();

        scheduler.disconnect(reg.id, reg.epoch);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(scheduler.snapshot().is_empty());
        let removed = drain(&mut events).into_iter().find_map(|e| match e {
            SchedulerEvent::WorkerRemoved { worker_id, job } => Some((worker_id, job)),
            _ => None,
        });
        let (worker_id, job) = removed.unwrap();
        assert_eq!(worker_id, reg.id);
        assert_eq!(job.map(|s| s.job_id), Some(assigned[0].job_id));

        let (again, _rx2) = connect(&scheduler, Some(reg.id));
        assert!(!again.reconnected);
        assert_ne!(again.id, reg.id);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_does_not_remove_reattached_worker() {
        let scheduler = scheduler(5);
        let (reg, _rx) = connect(&scheduler, None);
        scheduler.disconnect(reg.id, reg.epoch);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let (again, _rx2) = connect(&scheduler, Some(reg.id));
        scheduler.disconnect(again.id, again.epoch);
        // First expiry fires at 5s for epoch 0 and must be ignored.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(scheduler.snapshot().len(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.snapshot().is_empty());
    }

    #[tokio::test]
    async fn first_info_is_reported_once_and_sets_class_priority() {
        let scheduler = scheduler(5);
        let (reg, _rx) = connect(&scheduler, None);
        assert!(scheduler.set_info(reg.id, capabilities("cpu")));
        assert!(!scheduler.set_info(reg.id, capabilities("gpu")));
        assert_eq!(scheduler.snapshot()[0].priority, 10);

        assert!(scheduler.set_priority_override(reg.id, Some(42)));
        assert_eq!(scheduler.snapshot()[0].priority, 42);
        assert!(scheduler.set_priority_override(reg.id, None));
        assert_eq!(scheduler.snapshot()[0].priority, 10);
    }

    #[tokio::test]
    async fn idle_and_error_free_the_slot() {
        let scheduler = scheduler(5);
        let (reg, _rx) = connect(&scheduler, None);
        scheduler.set_info(reg.id, capabilities("gpu"));
        let job = queued(1);
        scheduler.enqueue(job.clone());
        scheduler.dispatch();

        assert_eq!(scheduler.set_status(reg.id, WorkerStatus::Busy, None), None);
        let freed = scheduler.set_status(reg.id, WorkerStatus::Idle, None).unwrap();
        assert_eq!(freed.job_id, job.job_id);
        assert_eq!(scheduler.current_job(reg.id), None);
    }

    #[tokio::test]
    async fn rejection_frees_slot_without_requeue() {
        let scheduler = scheduler(5);
        let (reg, _rx) = connect(&scheduler, None);
        scheduler.set_info(reg.id, capabilities("gpu"));
        let job = queued(1);
        scheduler.enqueue(job.clone());
        scheduler.dispatch();

        assert!(scheduler.reject(reg.id, Uuid::new_v4(), None).is_none());
        let freed = scheduler.reject(reg.id, job.job_id, Some("busy".into()));
        assert_eq!(freed.map(|s| s.job_id), Some(job.job_id));
        assert!(scheduler.queued_jobs().is_empty());
        assert_eq!(scheduler.snapshot()[0].status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_refused_and_queued_jobs_can_be_removed() {
        let scheduler = scheduler(5);
        let job = queued(1);
        assert!(scheduler.enqueue(job.clone()));
        assert!(!scheduler.enqueue(job.clone()));
        assert_eq!(scheduler.queued_jobs(), vec![job.job_id]);
        assert!(scheduler.remove_queued(job.job_id));
        assert!(!scheduler.remove_queued(job.job_id));

        let (reg, _rx) = connect(&scheduler, None);
        scheduler.set_info(reg.id, capabilities("gpu"));
        scheduler.enqueue(job.clone());
        scheduler.dispatch();
        assert!(!scheduler.enqueue(job));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_are_asked_to_quit() {
        let config = SchedulerConfig {
            idle_shutdown: Some(Duration::from_secs(30)),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(config, SECRET);
        let (reg, mut rx) = connect(&scheduler, None);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Registered { id: reg.id });

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(scheduler.sweep_idle().is_empty());
        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(scheduler.sweep_idle(), vec![reg.id]);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Quit);
        assert!(scheduler.sweep_idle().is_empty());
    }

    #[tokio::test]
    async fn quit_reaches_connected_worker_only() {
        let scheduler = scheduler(5);
        let (reg, mut rx) = connect(&scheduler, None);
        rx.try_recv().unwrap();
        assert!(scheduler.quit(reg.id));
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Quit);
        assert!(!scheduler.quit(reg.id + 1));
    }
}
