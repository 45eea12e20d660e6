use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::infrastructure::provisioner::Provisioner;
use crate::modules::scheduler::model::Capacity;

/// Requests more encode workers when the backlog outgrows the idle pool.
pub struct Autoscaler {
    provisioner: Arc<dyn Provisioner>,
    max_instances: usize,
    in_flight: AtomicBool,
}

impl Autoscaler {
    pub fn new(provisioner: Arc<dyn Provisioner>, max_instances: usize) -> Self {
        Self {
            provisioner,
            max_instances,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Asks for `min(backlog, max_instances)` instances. Concurrent calls
    /// while a request is outstanding are dropped. Returns the count requested.
    pub async fn ensure_capacity(&self, capacity: Capacity) -> Option<usize> {
        if capacity.backlog <= capacity.idle {
            return None;
        }
        let instances = capacity.backlog.min(self.max_instances);
        if instances == 0 {
            return None;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("provisioning already in flight");
            return None;
        }

        let result = self.provisioner.provision(instances).await;
        self.in_flight.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                info!(instances, backlog = capacity.backlog, idle = capacity.idle, "worker provisioning requested");
                Some(instances)
            }
            Err(e) => {
                warn!(instances, error = %e, "worker provisioning failed");
                None
            }
        }
    }
}
