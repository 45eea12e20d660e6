//! Records uploaded variant playlists and runs the finisher exactly once per
//! asset: master playlist, `processed`, verifier, finished notification.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{Asset, AssetState, JobState, parse_variant_playlist_name};
use super::repository::{AssetStore, StoreError};
use super::verifier::{VerificationReport, Verifier};
use crate::infrastructure::queue::{AssetFinished, FinishedNotifier};
use crate::modules::manifest::ManifestService;
use crate::workers::upload_watcher::UploadEvent;

type AssetLock = Arc<tokio::sync::Mutex<()>>;

pub struct VariantTracker {
    store: Arc<dyn AssetStore>,
    manifests: Arc<ManifestService>,
    verifier: Arc<Verifier>,
    notifier: Arc<dyn FinishedNotifier>,
    locks: Mutex<HashMap<Uuid, AssetLock>>,
}

impl VariantTracker {
    pub fn new(
        store: Arc<dyn AssetStore>,
        manifests: Arc<ManifestService>,
        verifier: Arc<Verifier>,
        notifier: Arc<dyn FinishedNotifier>,
    ) -> Self {
        Self {
            store,
            manifests,
            verifier,
            notifier,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes upload events until every sender is gone.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<UploadEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::Uploaded { file_name, .. } => {
                    if !file_name.ends_with(".m3u8") {
                        continue;
                    }
                    let tracker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tracker.on_uploaded(&file_name).await {
                            error!(file = %file_name, error = %e, "failed to record uploaded variant");
                        }
                    });
                }
                UploadEvent::Failed { file_name, error } => {
                    error!(file = %file_name, error = %error, "upload failed permanently, variant will not be recorded");
                }
            }
        }
    }

    /// Handles `{asset}.{variant}.m3u8` reaching durable storage.
    /// Returns the finished asset state when this call ran the finisher.
    pub async fn on_uploaded(&self, file_name: &str) -> Result<Option<AssetState>, StoreError> {
        let Some((asset_id, variant)) = parse_variant_playlist_name(file_name) else {
            debug!(file = %file_name, "not a variant playlist");
            return Ok(None);
        };

        let lock = self.asset_lock(asset_id);
        let result = {
            let _guard = lock.lock().await;
            self.record(asset_id, variant).await
        };
        self.release(asset_id, lock);
        result
    }

    /// The asset's job reached `done`; the finisher may now be due.
    pub async fn on_job_done(&self, asset_id: Uuid) -> Result<Option<AssetState>, StoreError> {
        let lock = self.asset_lock(asset_id);
        let result = {
            let _guard = lock.lock().await;
            match self.store.get_asset(asset_id).await? {
                Some(asset) => self.try_finish(asset).await,
                None => Ok(None),
            }
        };
        self.release(asset_id, lock);
        result
    }

    /// Rebuilds the master playlist and re-runs the verifier for an asset
    /// that already went through the finisher.
    pub async fn reverify(&self, asset_id: Uuid) -> Result<Option<VerificationReport>, StoreError> {
        let lock = self.asset_lock(asset_id);
        let result = {
            let _guard = lock.lock().await;
            self.reverify_locked(asset_id).await
        };
        self.release(asset_id, lock);
        result
    }

    async fn reverify_locked(&self, asset_id: Uuid) -> Result<Option<VerificationReport>, StoreError> {
        let Some(asset) = self.store.get_asset(asset_id).await? else {
            return Err(StoreError::NotFound(asset_id));
        };
        if asset.state.awaiting_finish() {
            return Ok(None);
        }
        if let Err(e) = self.manifests.build_master(&asset).await {
            warn!(asset_id = %asset_id, error = %e, "master playlist rebuild failed");
            self.store.set_asset_state(asset_id, AssetState::Error).await?;
            return Ok(None);
        }
        match self.verifier.verify(&asset).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                warn!(asset_id = %asset_id, error = %e, "verification failed");
                Ok(None)
            }
        }
    }

    async fn record(&self, asset_id: Uuid, variant: &str) -> Result<Option<AssetState>, StoreError> {
        let Some(asset) = self.store.get_asset(asset_id).await? else {
            warn!(asset_id = %asset_id, variant = %variant, "upload for unknown asset");
            return Ok(None);
        };
        if !asset.expects(variant) {
            debug!(asset_id = %asset_id, variant = %variant, "ignoring unexpected variant");
            return Ok(None);
        }
        let asset = self.store.add_uploaded_variant(asset_id, variant).await?;
        info!(
            asset_id = %asset_id,
            variant = %variant,
            uploaded = asset.uploaded_variants.len(),
            expected = asset.variants.len(),
            "variant uploaded"
        );
        self.try_finish(asset).await
    }

    /// Caller holds the asset lock.
    async fn try_finish(&self, asset: Asset) -> Result<Option<AssetState>, StoreError> {
        if !asset.state.awaiting_finish() || !asset.all_variants_uploaded() {
            return Ok(None);
        }
        let job_done = match asset.job_id {
            Some(job_id) => self
                .store
                .get_job(job_id)
                .await?
                .is_some_and(|job| job.state == JobState::Done),
            None => false,
        };
        if !job_done {
            debug!(asset_id = %asset.id, "all variants uploaded, waiting for job to finish");
            return Ok(None);
        }

        info!(asset_id = %asset.id, "finishing asset");
        if let Err(e) = self.manifests.build_master(&asset).await {
            error!(asset_id = %asset.id, error = %e, "master playlist build failed");
            self.store.set_asset_state(asset.id, AssetState::Error).await?;
            self.notify(asset.id, AssetState::Error).await;
            return Ok(Some(AssetState::Error));
        }
        self.store.set_asset_state(asset.id, AssetState::Processed).await?;

        let state = match self.verifier.verify(&asset).await {
            Ok(report) => report.state,
            Err(e) => {
                error!(asset_id = %asset.id, error = %e, "verification failed");
                AssetState::Error
            }
        };
        self.notify(asset.id, state).await;
        Ok(Some(state))
    }

    async fn notify(&self, asset_id: Uuid, state: AssetState) {
        let event = AssetFinished { asset_id, state };
        if let Err(e) = self.notifier.asset_finished(&event).await {
            warn!(asset_id = %asset_id, error = %e, "finished notification failed");
        }
    }

    fn asset_lock(&self, asset_id: Uuid) -> AssetLock {
        self.locks.lock().entry(asset_id).or_default().clone()
    }

    /// Drops the map entry once nobody else holds or waits on the lock.
    fn release(&self, asset_id: Uuid, lock: AssetLock) {
        let mut locks = self.locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&asset_id);
        }
    }
}
