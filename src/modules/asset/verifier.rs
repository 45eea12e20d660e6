//! Re-derives an asset's health from what durable storage actually holds.
//!
//! Segment files are bucketed by variant label (second dot component of the
//! name). Variants whose count trails the fullest variant by more than the
//! tolerance are faulty. Every other expected variant is re-probed through a
//! signed URL and must match the source duration.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::model::{Asset, AssetState};
use super::repository::{AssetStore, StoreError};
use crate::config::settings::VerifierConfig;
use crate::infrastructure::probe::MediaProber;
use crate::infrastructure::storage::{Storage, StorageError};
use crate::modules::manifest::ManifestService;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("listing stored outputs failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VerificationReport {
    pub asset_id: Uuid,
    pub state: AssetState,
    /// Stored file count per expected variant.
    pub segment_counts: BTreeMap<String, usize>,
    pub faulty: Vec<String>,
    /// Probed duration per variant; absent when the probe failed.
    pub durations: BTreeMap<String, f64>,
    pub mismatched: Vec<String>,
}

pub struct Verifier {
    storage: Arc<dyn Storage>,
    prober: Arc<dyn MediaProber>,
    manifests: Arc<ManifestService>,
    store: Arc<dyn AssetStore>,
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(
        storage: Arc<dyn Storage>,
        prober: Arc<dyn MediaProber>,
        manifests: Arc<ManifestService>,
        store: Arc<dyn AssetStore>,
        config: VerifierConfig,
    ) -> Self {
        Self {
            storage,
            prober,
            manifests,
            store,
            config,
        }
    }

    pub async fn verify(&self, asset: &Asset) -> Result<VerificationReport, VerifyError> {
        let objects = match self.storage.list(&format!("{}/", asset.id)).await {
            Ok(objects) => objects,
            Err(e) => {
                self.store.set_asset_state(asset.id, AssetState::Error).await?;
                return Err(e.into());
            }
        };

        let counts = count_by_variant(
            asset,
            objects
                .iter()
                .filter(|o| !o.is_directory)
                .map(|o| o.file_name()),
        );
        let faulty = faulty_variants(&counts, self.config.segment_tolerance);

        let mut durations = BTreeMap::new();
        let mut mismatched = Vec::new();
        // Sequential on purpose: one probe at a time per asset.
        for variant in asset.variants.iter().filter(|v| !faulty.contains(v)) {
            let probed = match self.manifests.variant_url(asset, variant) {
                Ok(url) => self.prober.probe(&url).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match probed {
                Ok(probe) => {
                    durations.insert(variant.clone(), probe.duration_secs);
                    let delta = (asset.source_duration - probe.duration_secs).abs();
                    if delta > self.config.duration_tolerance_secs {
                        warn!(asset_id = %asset.id, variant = %variant, probed = probe.duration_secs, source = asset.source_duration, "duration mismatch");
                        mismatched.push(variant.clone());
                    }
                }
                Err(e) => {
                    warn!(asset_id = %asset.id, variant = %variant, error = %e, "variant probe failed");
                    mismatched.push(variant.clone());
                }
            }
        }

        let state = if faulty.is_empty() && mismatched.is_empty() {
            AssetState::Verified
        } else {
            AssetState::Error
        };
        self.store.set_asset_state(asset.id, state).await?;
        info!(asset_id = %asset.id, state = %state, faulty = faulty.len(), mismatched = mismatched.len(), "asset verified");

        Ok(VerificationReport {
            asset_id: asset.id,
            state,
            segment_counts: counts,
            faulty,
            durations,
            mismatched,
        })
    }
}

/// Counts stored files per expected variant. Missing variants count zero;
/// playlists and labels the asset does not expect are skipped.
fn count_by_variant<'a>(
    asset: &Asset,
    file_names: impl Iterator<Item = &'a str>,
) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> =
        asset.variants.iter().map(|v| (v.clone(), 0)).collect();
    for name in file_names {
        if name.ends_with(".m3u8") {
            continue;
        }
        let Some(label) = name.split('.').nth(1) else {
            continue;
        };
        if let Some(count) = counts.get_mut(label) {
            *count += 1;
        }
    }
    counts
}

fn faulty_variants(counts: &BTreeMap<String, usize>, tolerance: usize) -> Vec<String> {
    let max = counts.values().copied().max().unwrap_or(0);
    counts
        .iter()
        .filter(|(_, count)| max - **count > tolerance)
        .map(|(variant, _)| variant.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::storage::memory::MemoryStorage;
    use crate::modules::asset::model::Job;
    use crate::modules::asset::repository::MemoryAssetStore;
    use crate::modules::signer::Signer;
    use crate::test_support::DurationProber;

    async fn fixture(
        durations: &[(&str, f64)],
        segments: &[(&str, usize)],
    ) -> (Verifier, Arc<MemoryAssetStore>, Asset) {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(MemoryAssetStore::new());
        let prober = Arc::new(DurationProber::new(durations));
        let asset = Asset::new(
            "Film",
            vec!["1000k".to_string(), "2500k".to_string()],
            120.4,
            BTreeMap::new(),
        );
        store
            .create(&asset, &Job::for_asset(&asset, serde_json::json!({})))
            .await
            .unwrap();
        for (label, n) in segments {
            storage.insert(format!("{}/{}.{label}.m3u8", asset.id, asset.id), "#EXTM3U");
            for i in 0..*n {
                storage.insert(format!("{}/{}.{label}.{i:03}.ts", asset.id, asset.id), "ts");
            }
        }
        storage.insert(format!("{}/{}.m3u8", asset.id, asset.id), "#EXTM3U");

        let manifests = Arc::new(ManifestService::new(
            storage.clone(),
            prober.clone(),
            Signer::new("secret", "http://localhost:3000"),
            None,
            Duration::from_secs(60),
        ));
        let verifier = Verifier::new(
            storage,
            prober,
            manifests,
            store.clone(),
            VerifierConfig::default(),
        );
        (verifier, store, asset)
    }

    #[tokio::test]
    async fn durations_within_tolerance_verify() {
        let (verifier, store, asset) =
            fixture(&[("1000k", 121.0), ("2500k", 121.0)], &[("1000k", 60), ("2500k", 60)]).await;
        let report = verifier.verify(&asset).await.unwrap();
        assert_eq!(report.state, AssetState::Verified);
        let stored = store.get_asset(asset.id).await.unwrap().unwrap();
        assert_eq!(stored.state, AssetState::Verified);
    }

    #[tokio::test]
    async fn duration_outside_tolerance_is_error() {
        let (verifier, store, asset) =
            fixture(&[("1000k", 124.0), ("2500k", 121.0)], &[("1000k", 60), ("2500k", 60)]).await;
        let report = verifier.verify(&asset).await.unwrap();
        assert_eq!(report.state, AssetState::Error);
        assert_eq!(report.mismatched, vec!["1000k"]);
        assert_eq!(
            store.get_asset(asset.id).await.unwrap().unwrap().state,
            AssetState::Error
        );
    }

    #[tokio::test]
    async fn short_variant_is_faulty_and_not_probed() {
        let (verifier, _, asset) =
            fixture(&[("1000k", 120.4), ("2500k", 120.4)], &[("1000k", 60), ("2500k", 54)]).await;
        let report = verifier.verify(&asset).await.unwrap();
        assert_eq!(report.faulty, vec!["2500k"]);
        assert!(!report.durations.contains_key("2500k"));
        assert_eq!(report.state, AssetState::Error);
    }

    #[tokio::test]
    async fn count_difference_at_tolerance_passes() {
        let (verifier, _, asset) =
            fixture(&[("1000k", 120.4), ("2500k", 120.4)], &[("1000k", 60), ("2500k", 55)]).await;
        let report = verifier.verify(&asset).await.unwrap();
        assert!(report.faulty.is_empty());
        assert_eq!(report.state, AssetState::Verified);
    }

    #[tokio::test]
    async fn probe_failure_is_error() {
        let (verifier, _, asset) =
            fixture(&[("1000k", 120.4)], &[("1000k", 60), ("2500k", 60)]).await;
        let report = verifier.verify(&asset).await.unwrap();
        assert_eq!(report.mismatched, vec!["2500k"]);
        assert_eq!(report.state, AssetState::Error);
    }

    #[test]
    fn counting_ignores_playlists_and_unknown_labels() {
        let asset = Asset::new("x", vec!["1000k".to_string()], 1.0, BTreeMap::new());
        let names = ["a.1000k.000.ts", "a.1000k.m3u8", "a.m3u8", "a.sub_en.000.vtt", "a"];
        let counts = count_by_variant(&asset, names.into_iter());
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["1000k"], 1);
    }
}
