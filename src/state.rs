use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::settings::AppConfig;
use crate::infrastructure::probe::MediaProber;
use crate::infrastructure::queue::FinishedNotifier;
use crate::infrastructure::storage::Storage;
use crate::modules::asset::repository::AssetStore;
use crate::modules::asset::tracker::VariantTracker;
use crate::modules::asset::verifier::Verifier;
use crate::modules::manifest::ManifestService;
use crate::modules::scheduler::lifecycle::JobLifecycle;
use crate::modules::scheduler::service::Scheduler;
use crate::modules::signer::Signer;
use crate::workers::autoscaler::Autoscaler;
use crate::workers::upload_watcher::{UploadEvent, UploadWatcher};

/// External collaborators, chosen by `main` from configuration.
pub struct Backends {
    pub store: Arc<dyn AssetStore>,
    pub storage: Arc<dyn Storage>,
    pub prober: Arc<dyn MediaProber>,
    pub notifier: Arc<dyn FinishedNotifier>,
    pub autoscaler: Option<Arc<Autoscaler>>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn AssetStore>,
    pub storage: Arc<dyn Storage>,
    pub manifests: Arc<ManifestService>,
    pub tracker: Arc<VariantTracker>,
    pub lifecycle: Arc<JobLifecycle>,
}

impl AppState {
    /// Wires the services together. The returned watcher and event stream
    /// still have to be started by the caller.
    pub fn new(
        config: AppConfig,
        backends: Backends,
    ) -> (Self, UploadWatcher, mpsc::UnboundedReceiver<UploadEvent>) {
        let Backends {
            store,
            storage,
            prober,
            notifier,
            autoscaler,
        } = backends;

        let signer = Signer::new(&config.signing_secret, &config.public_base_url);
        let cdn = config
            .cdn
            .as_ref()
            .map(|cdn| Signer::new(&cdn.signing_secret, &cdn.base_url));
        let manifests = Arc::new(ManifestService::new(
            storage.clone(),
            prober.clone(),
            signer,
            cdn,
            Duration::from_secs(config.signed_url_ttl_secs),
        ));

        let verifier = Arc::new(Verifier::new(
            storage.clone(),
            prober,
            manifests.clone(),
            store.clone(),
            config.verifier.clone(),
        ));
        let tracker = Arc::new(VariantTracker::new(
            store.clone(),
            manifests.clone(),
            verifier,
            notifier,
        ));

        let (uploads, upload_events) =
            UploadWatcher::new(config.staging_dir.clone(), storage.clone(), config.upload.clone());

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            config.worker_token_secret.clone(),
        ));
        let lifecycle = Arc::new(JobLifecycle::new(
            scheduler,
            store.clone(),
            tracker.clone(),
            Some(uploads.clone()),
            autoscaler,
        ));

        let state = Self {
            config: Arc::new(config),
            store,
            storage,
            manifests,
            tracker,
            lifecycle,
        };
        (state, uploads, upload_events)
    }
}
