//! Staging-directory watcher that pushes finished outputs to durable storage.
//!
//! Segment files are finished as soon as they appear. A playlist is finished
//! once it carries `#EXT-X-ENDLIST`, and is only uploaded after every
//! segment it references is durable, so a stored playlist never points at
//! missing media. Uploads run on a fixed pool pulling from one FIFO, with a
//! fixed backoff between attempts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::settings::UploadConfig;
use crate::infrastructure::storage::{Storage, object_key};
use crate::modules::manifest::playlist::{is_finished, media_file_name};

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Uploaded { asset_id: String, file_name: String },
    Failed { file_name: String, error: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum UploadError {
    #[error("upload of {file} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        file: String,
        attempts: u32,
        last_error: String,
    },
    #[error("{file} depends on {dependency}, which failed to upload")]
    DependencyFailed { file: String, dependency: String },
    #[error("upload watcher stopped")]
    Closed,
}

type Waiter = oneshot::Sender<Result<(), UploadError>>;

#[derive(Default)]
struct Tracked {
    in_flight: HashSet<String>,
    failed: HashMap<String, UploadError>,
    waiters: HashMap<String, Vec<Waiter>>,
}

struct Inner {
    staging_dir: PathBuf,
    storage: Arc<dyn Storage>,
    config: UploadConfig,
    queue_tx: async_channel::Sender<PathBuf>,
    queue_rx: async_channel::Receiver<PathBuf>,
    tracked: Mutex<Tracked>,
    events: mpsc::UnboundedSender<UploadEvent>,
}

#[derive(Clone)]
pub struct UploadWatcher {
    inner: Arc<Inner>,
}

/// `{asset_id}.{rest}` -> `asset_id`.
fn asset_id_of(file_name: &str) -> Option<&str> {
    let (asset_id, rest) = file_name.split_once('.')?;
    (!asset_id.is_empty() && !rest.is_empty()).then_some(asset_id)
}

/// Media files a playlist references by name.
fn referenced_files(playlist: &str) -> Vec<String> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(media_file_name)
        .map(str::to_string)
        .collect()
}

impl UploadWatcher {
    pub fn new(
        staging_dir: impl Into<PathBuf>,
        storage: Arc<dyn Storage>,
        config: UploadConfig,
    ) -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        let (events, events_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            inner: Arc::new(Inner {
                staging_dir: staging_dir.into(),
                storage,
                config,
                queue_tx,
                queue_rx,
                tracked: Mutex::new(Tracked::default()),
                events,
            }),
        };
        (watcher, events_rx)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.inner.staging_dir
    }

    /// Spawns the upload pool.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.concurrency.max(1))
            .map(|slot| {
                let watcher = self.clone();
                let queue = self.inner.queue_rx.clone();
                tokio::spawn(async move {
                    while let Ok(path) = queue.recv().await {
                        let _ = watcher.upload_with_retry(&path).await;
                    }
                    debug!(slot, "upload pool task stopped");
                })
            })
            .collect()
    }

    /// Starts filesystem notifications for the staging directory. The
    /// returned watcher must be kept alive.
    pub fn watch(&self) -> notify::Result<RecommendedWatcher> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut fs_watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "staging watch error"),
            },
        )?;
        fs_watcher.watch(&self.inner.staging_dir, RecursiveMode::NonRecursive)?;
        info!(dir = %self.inner.staging_dir.display(), "watching staging directory");

        let watcher = self.clone();
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                watcher.consider(&path).await;
            }
        });
        Ok(fs_watcher)
    }

    /// Considers every file currently staged. Returns how many were queued.
    pub async fn rescan(&self) -> std::io::Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.inner.staging_dir).await?;
        let mut queued = 0;
        while let Some(entry) = entries.next_entry().await? {
            if self.consider(&entry.path()).await {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Background rescan, e.g. after a worker reports produced files.
    pub fn nudge(&self) {
        let watcher = self.clone();
        tokio::spawn(async move {
            match watcher.rescan().await {
                Ok(n) if n > 0 => debug!(queued = n, "staging rescan queued files"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "staging rescan failed"),
            }
        });
    }

    /// Queues `path` if it is a finished, not yet handled output.
    pub async fn consider(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            return false;
        };
        if file_name.starts_with('.') {
            return false;
        }
        if asset_id_of(&file_name).is_none() {
            debug!(file = %file_name, "staged file without asset prefix ignored");
            return false;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return false,
        }

        let dependencies = if file_name.ends_with(".m3u8") {
            match tokio::fs::read_to_string(path).await {
                Ok(content) if is_finished(&content) => referenced_files(&content),
                Ok(_) => return false,
                Err(e) => {
                    debug!(file = %file_name, error = %e, "playlist not readable yet");
                    return false;
                }
            }
        } else {
            Vec::new()
        };

        {
            let mut tracked = self.inner.tracked.lock();
            if tracked.failed.contains_key(&file_name) || !tracked.in_flight.insert(file_name.clone()) {
                return false;
            }
        }

        if dependencies.is_empty() {
            return self.inner.queue_tx.send(path.to_path_buf()).await.is_ok();
        }

        // Playlists wait for their segments outside the pool so waiting never
        // holds an upload slot.
        let watcher = self.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            for dependency in &dependencies {
                if watcher.await_upload(dependency).await.is_err() {
                    let err = UploadError::DependencyFailed {
                        file: file_name.clone(),
                        dependency: dependency.clone(),
                    };
                    watcher.fail(&file_name, err);
                    return;
                }
            }
            if watcher.inner.queue_tx.send(path).await.is_err() {
                watcher.fail(&file_name, UploadError::Closed);
            }
        });
        true
    }

    /// Resolves once `file_name` is durable: immediately when it is already
    /// stored, otherwise when its upload finishes.
    pub async fn await_upload(&self, file_name: &str) -> Result<(), UploadError> {
        let asset_id = asset_id_of(file_name).unwrap_or_default();
        let rx = {
            let mut tracked = self.inner.tracked.lock();
            if let Some(err) = tracked.failed.get(file_name) {
                return Err(err.clone());
            }
            let (tx, rx) = oneshot::channel();
            let waiters = tracked.waiters.entry(file_name.to_string()).or_default();
            waiters.retain(|w| !w.is_closed());
            waiters.push(tx);
            rx
        };

        match self.inner.storage.exists(&object_key(asset_id, file_name)).await {
            Ok(true) => {
                drop(rx);
                self.prune_waiters(file_name);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => debug!(file = %file_name, error = %e, "existence check failed, waiting for upload"),
        }
        rx.await.unwrap_or(Err(UploadError::Closed))
    }

    /// Drops abandoned waiters for `file_name`, and the entry once none remain.
    fn prune_waiters(&self, file_name: &str) {
        let mut tracked = self.inner.tracked.lock();
        if let Some(waiters) = tracked.waiters.get_mut(file_name) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                tracked.waiters.remove(file_name);
            }
        }
    }

    async fn upload_with_retry(&self, path: &Path) -> Result<(), UploadError> {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            return Err(UploadError::Closed);
        };
        let asset_id = asset_id_of(&file_name).unwrap_or_default().to_string();
        let key = object_key(&asset_id, &file_name);
        let max_attempts = self.inner.config.max_attempts.max(1);

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let read = tokio::fs::read(path).await;
            if let Err(e) = &read
                && e.kind() == std::io::ErrorKind::NotFound
                && self.inner.storage.exists(&key).await.unwrap_or(false)
            {
                // A duplicate queue entry for a file an earlier pass already
                // uploaded and removed.
                debug!(file = %file_name, "staged copy gone and object stored, nothing to do");
                self.release(&file_name);
                return Ok(());
            }
            let result = match read {
                Ok(bytes) => self
                    .inner
                    .storage
                    .upload(&key, Bytes::from(bytes))
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => {
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        warn!(file = %file_name, error = %e, "could not remove staged copy");
                    }
                    info!(file = %file_name, attempt, "uploaded");
                    self.succeed(&asset_id, &file_name);
                    return Ok(());
                }
                Err(e) => {
                    warn!(file = %file_name, attempt, max_attempts, error = %e, "upload attempt failed");
                    last_error = e;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.inner.config.backoff).await;
                    }
                }
            }
        }

        let err = UploadError::Exhausted {
            file: file_name.clone(),
            attempts: max_attempts,
            last_error,
        };
        self.fail(&file_name, err.clone());
        Err(err)
    }

    fn succeed(&self, asset_id: &str, file_name: &str) {
        let waiters = {
            let mut tracked = self.inner.tracked.lock();
            tracked.in_flight.remove(file_name);
            tracked.waiters.remove(file_name).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        let _ = self.inner.events.send(UploadEvent::Uploaded {
            asset_id: asset_id.to_string(),
            file_name: file_name.to_string(),
        });
    }

    /// Clears the in-flight mark of an already durable file without a
    /// second `Uploaded` event.
    fn release(&self, file_name: &str) {
        let waiters = {
            let mut tracked = self.inner.tracked.lock();
            tracked.in_flight.remove(file_name);
            tracked.waiters.remove(file_name).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Permanent failure: the file stays staged and is never retried by
    /// rescans.
    fn fail(&self, file_name: &str, err: UploadError) {
        error!(file = %file_name, error = %err, "upload failed permanently");
        let waiters = {
            let mut tracked = self.inner.tracked.lock();
            tracked.in_flight.remove(file_name);
            tracked.failed.insert(file_name.to_string(), err.clone());
            tracked.waiters.remove(file_name).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
        let _ = self.inner.events.send(UploadEvent::Failed {
            file_name: file_name.to_string(),
            error: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::storage::memory::MemoryStorage;
    use crate::test_support::FlakyStorage;

    const ASSET: &str = "5f0c6a5e-8f6b-4c53-9d1e-3f1b2a4c5d6e";

    fn config() -> UploadConfig {
        UploadConfig {
            concurrency: 2,
            max_attempts: 10,
            backoff: Duration::from_secs(2),
        }
    }

    fn variant_playlist(finished: bool) -> String {
        let mut s = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-PLAYLIST-TYPE:VOD\n\
             #EXTINF:2.0,\n{ASSET}.1000k.000.ts\n#EXTINF:2.0,\n{ASSET}.1000k.001.ts\n"
        );
        if finished {
            s.push_str("#EXT-X-ENDLIST\n");
        }
        s
    }

    async fn stage(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    async fn next_events(
        rx: &mut mpsc::UnboundedReceiver<UploadEvent>,
        n: usize,
    ) -> Vec<UploadEvent> {
        let mut out = Vec::new();
        while out.len() < n {
            let event = tokio::time::timeout(Duration::from_secs(120), rx.recv())
                .await
                .unwrap()
                .unwrap();
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn uploads_segments_before_their_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let (watcher, mut events) = UploadWatcher::new(dir.path(), storage.clone(), config());
        watcher.start();

        let playlist = format!("{ASSET}.1000k.m3u8");
        stage(dir.path(), &playlist, &variant_playlist(true)).await;
        stage(dir.path(), &format!("{ASSET}.1000k.000.ts"), "seg0").await;
        stage(dir.path(), &format!("{ASSET}.1000k.001.ts"), "seg1").await;
        assert_eq!(watcher.rescan().await.unwrap(), 3);

        watcher.await_upload(&playlist).await.unwrap();
        let events = next_events(&mut events, 3).await;
        assert_eq!(
            events.last(),
            Some(&UploadEvent::Uploaded {
                asset_id: ASSET.to_string(),
                file_name: playlist.clone()
            })
        );
        assert_eq!(storage.get(&format!("{ASSET}/{ASSET}.1000k.000.ts")).unwrap(), "seg0");
        assert!(storage.get(&format!("{ASSET}/{playlist}")).is_some());
        assert!(!dir.path().join(&playlist).exists());
        assert!(!dir.path().join(format!("{ASSET}.1000k.000.ts")).exists());
    }

    #[tokio::test]
    async fn unfinished_playlist_waits_for_endlist() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let (watcher, _events) = UploadWatcher::new(dir.path(), storage.clone(), config());
        watcher.start();

        let path = stage(dir.path(), &format!("{ASSET}.1000k.m3u8"), &variant_playlist(false)).await;
        assert!(!watcher.consider(&path).await);
        assert_eq!(storage.len(), 0);

        stage(dir.path(), &format!("{ASSET}.1000k.m3u8"), &variant_playlist(true)).await;
        assert!(watcher.consider(&path).await);
        // Queued once only.
        assert!(!watcher.consider(&path).await);
    }

    #[tokio::test]
    async fn await_resolves_for_already_stored_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        storage.insert(format!("{ASSET}/{ASSET}.1000k.m3u8"), "#EXTM3U");
        let (watcher, _events) = UploadWatcher::new(dir.path(), storage, config());
        watcher
            .await_upload(&format!("{ASSET}.1000k.m3u8"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolved_awaits_leave_no_waiters_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        for i in 0..50 {
            storage.insert(format!("{ASSET}/{ASSET}.1000k.{i:03}.ts"), "seg");
        }
        let (watcher, _events) = UploadWatcher::new(dir.path(), storage, config());
        for i in 0..50 {
            watcher
                .await_upload(&format!("{ASSET}.1000k.{i:03}.ts"))
                .await
                .unwrap();
        }
        assert!(watcher.inner.tracked.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn requeued_file_already_stored_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let segment = format!("{ASSET}.1000k.000.ts");
        storage.insert(format!("{ASSET}/{segment}"), "seg0");
        let (watcher, mut events) = UploadWatcher::new(dir.path(), storage, config());
        watcher.inner.tracked.lock().in_flight.insert(segment.clone());

        // The staged copy was removed by the upload that stored it.
        watcher
            .upload_with_retry(&dir.path().join(&segment))
            .await
            .unwrap();

        let tracked = watcher.inner.tracked.lock();
        assert!(tracked.failed.is_empty());
        assert!(tracked.in_flight.is_empty());
        drop(tracked);
        assert!(events.try_recv().is_err());
        watcher.await_upload(&segment).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_considers_of_one_file_never_fail_it() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let upload_config = UploadConfig {
            concurrency: 4,
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let (watcher, mut events) = UploadWatcher::new(dir.path(), storage.clone(), upload_config);
        watcher.start();

        let total = 300;
        let mut paths = Vec::new();
        for i in 0..total {
            paths.push(stage(dir.path(), &format!("{ASSET}.1000k.{i:03}.ts"), "seg").await);
        }
        let mut handles = Vec::new();
        for path in &paths {
            for _ in 0..3 {
                let watcher = watcher.clone();
                let path = path.clone();
                handles.push(tokio::spawn(async move { watcher.consider(&path).await }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let uploaded = next_events(&mut events, total).await;
        assert!(uploaded.iter().all(|e| matches!(e, UploadEvent::Uploaded { .. })));
        // Let any duplicate queue entries drain.
        for _ in 0..200 {
            if watcher.inner.tracked.lock().in_flight.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(storage.len(), total);
        let tracked = watcher.inner.tracked.lock();
        assert!(tracked.failed.is_empty());
        assert!(tracked.in_flight.is_empty());
        drop(tracked);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, UploadEvent::Failed { .. }), "{event:?}");
        }
    }

    #[tokio::test]
    async fn files_without_asset_prefix_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, _events) =
            UploadWatcher::new(dir.path(), Arc::new(MemoryStorage::new()), config());
        let path = stage(dir.path(), "README", "x").await;
        assert!(!watcher.consider(&path).await);
        let hidden = stage(dir.path(), &format!(".{ASSET}.1000k.000.ts"), "x").await;
        assert!(!watcher.consider(&hidden).await);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_segment_blocks_its_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FlakyStorage::failing_on(".1000k.000.ts"));
        let (watcher, mut events) = UploadWatcher::new(dir.path(), storage.clone(), config());
        watcher.start();

        let segment = format!("{ASSET}.1000k.000.ts");
        let playlist = format!("{ASSET}.1000k.m3u8");
        stage(dir.path(), &segment, "seg0").await;
        stage(dir.path(), &format!("{ASSET}.1000k.001.ts"), "seg1").await;
        stage(dir.path(), &playlist, &variant_playlist(true)).await;
        watcher.rescan().await.unwrap();

        let err = watcher.await_upload(&segment).await.unwrap_err();
        assert!(matches!(err, UploadError::Exhausted { attempts: 10, .. }));
        assert_eq!(storage.failed_attempts.load(Ordering::SeqCst), 10);

        let events = next_events(&mut events, 3).await;
        assert!(events.contains(&UploadEvent::Failed {
            file_name: playlist.clone(),
            error: UploadError::DependencyFailed {
                file: playlist.clone(),
                dependency: segment.clone()
            }
            .to_string(),
        }));
        assert!(!events.iter().any(|e| matches!(
            e,
            UploadEvent::Uploaded { file_name, .. } if *file_name == playlist
        )));
        assert!(storage.inner.get(&format!("{ASSET}/{playlist}")).is_none());
        // Failed files stay staged and are not picked up again.
        assert!(dir.path().join(&segment).exists());
        assert_eq!(watcher.rescan().await.unwrap(), 0);
        assert!(matches!(
            watcher.await_upload(&playlist).await,
            Err(UploadError::DependencyFailed { .. })
        ));
    }

    #[test]
    fn playlist_references_are_media_names() {
        let refs = referenced_files(&variant_playlist(true));
        assert_eq!(
            refs,
            vec![format!("{ASSET}.1000k.000.ts"), format!("{ASSET}.1000k.001.ts")]
        );
        assert_eq!(asset_id_of("abc.1000k.m3u8"), Some("abc"));
        assert_eq!(asset_id_of("abc"), None);
        assert_eq!(asset_id_of(".hidden"), None);
    }
}
