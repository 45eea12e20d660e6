//! Test doubles for the external collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::infrastructure::probe::{MediaProber, ProbeError, ProbeResult};
use crate::infrastructure::provisioner::{ProvisionError, Provisioner};
use crate::infrastructure::queue::{AssetFinished, FinishedNotifier};
use crate::infrastructure::storage::memory::MemoryStorage;
use crate::infrastructure::storage::{ObjectStream, Storage, StorageError, StoredObject};

/// Answers with a fixed duration per variant label found in the probed URL.
pub struct DurationProber {
    durations: HashMap<String, f64>,
    pub calls: AtomicUsize,
}

impl DurationProber {
    pub fn new(durations: &[(&str, f64)]) -> Self {
        Self {
            durations: durations
                .iter()
                .map(|(label, secs)| (label.to_string(), *secs))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MediaProber for DurationProber {
    async fn probe(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.durations
            .iter()
            .find(|(label, _)| url.contains(&format!(".{label}.m3u8")))
            .map(|(_, secs)| ProbeResult {
                duration_secs: *secs,
                width: Some(1280),
                height: Some(720),
            })
            .ok_or(ProbeError::MissingDuration)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<AssetFinished>>,
}

#[async_trait]
impl FinishedNotifier for RecordingNotifier {
    async fn asset_finished(&self, event: &AssetFinished) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingProvisioner {
    pub requests: Mutex<Vec<usize>>,
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn provision(&self, instances: usize) -> Result<(), ProvisionError> {
        self.requests.lock().push(instances);
        Ok(())
    }
}

/// Memory storage whose uploads fail for names containing `fail_marker`.
pub struct FlakyStorage {
    pub inner: Arc<MemoryStorage>,
    fail_marker: String,
    pub failed_attempts: AtomicUsize,
}

impl FlakyStorage {
    pub fn failing_on(fail_marker: &str) -> Self {
        Self {
            inner: Arc::new(MemoryStorage::new()),
            fail_marker: fail_marker.to_string(),
            failed_attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn upload(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        if path.contains(&self.fail_marker) {
            self.failed_attempts.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Backend("injected failure".to_string()));
        }
        self.inner.upload(path, bytes).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn download(&self, path: &str) -> Result<ObjectStream, StorageError> {
        self.inner.download(path).await
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.inner.remove(path).await
    }
}

pub fn test_config(staging_dir: &std::path::Path) -> crate::config::settings::AppConfig {
    crate::config::settings::AppConfig {
        server_port: 0,
        public_base_url: "https://media.example.com".to_string(),
        database_url: None,
        rabbitmq_url: None,
        minio_url: String::new(),
        minio_bucket: String::new(),
        minio_access_key: String::new(),
        minio_secret_key: String::new(),
        staging_dir: staging_dir.to_path_buf(),
        signing_secret: "signing-secret".to_string(),
        signed_url_ttl_secs: 600,
        worker_token_secret: "worker-secret".to_string(),
        operator_token_secret: "operator-secret".to_string(),
        scheduler: Default::default(),
        upload: Default::default(),
        verifier: Default::default(),
        cdn: None,
        provisioner_url: None,
        max_worker_instances: 0,
        ffprobe_path: "ffprobe".to_string(),
    }
}

/// Fully wired state over in-memory backends.
pub fn memory_state(staging_dir: &std::path::Path) -> (crate::state::AppState, Arc<MemoryStorage>) {
    use crate::modules::asset::repository::MemoryAssetStore;
    use crate::state::{AppState, Backends};

    let storage = Arc::new(MemoryStorage::new());
    let (state, _uploads, _events) = AppState::new(
        test_config(staging_dir),
        Backends {
            store: Arc::new(MemoryAssetStore::new()),
            storage: storage.clone(),
            prober: Arc::new(DurationProber::new(&[])),
            notifier: Arc::new(RecordingNotifier::default()),
            autoscaler: None,
        },
    );
    (state, storage)
}

pub fn operator_token(secret: &str, role: &str) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    let claims = crate::middleware::auth::OperatorClaims {
        sub: "ops".to_string(),
        role: role.to_string(),
        exp: (time::OffsetDateTime::now_utc().unix_timestamp() + 600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .expect("token encodes")
}
