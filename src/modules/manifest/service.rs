use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ManifestError;
use super::playlist::{
    MasterEntry, RewriteOptions, SegmentBase, SubtitleEntry, bandwidth_for_label, render_master,
    rewrite_variant,
};
use crate::infrastructure::probe::MediaProber;
use crate::infrastructure::storage::{ObjectStream, Storage, object_key};
use crate::modules::asset::model::Asset;
use crate::modules::signer::{Scope, Signer};

pub const KEY_FILE: &str = "file.key";
pub const KEYINFO_FILE: &str = "keyinfo";

/// Path under the signed prefix for a file of an asset.
pub fn asset_path(asset_id: Uuid, file_name: &str) -> String {
    format!("assets/{asset_id}/{file_name}")
}

/// Covers every file of one asset: `assets/{id}`.
const ASSET_SCOPE: Scope = Scope::Prefix(2);

pub struct ManifestService {
    storage: Arc<dyn Storage>,
    prober: Arc<dyn MediaProber>,
    signer: Signer,
    cdn: Option<Signer>,
    http: reqwest::Client,
    url_ttl: Duration,
}

impl ManifestService {
    pub fn new(
        storage: Arc<dyn Storage>,
        prober: Arc<dyn MediaProber>,
        signer: Signer,
        cdn: Option<Signer>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            prober,
            signer,
            cdn,
            http: reqwest::Client::new(),
            url_ttl,
        }
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Signed master playlist URL handed to players.
    pub fn playback_url(&self, asset: &Asset) -> Result<String, ManifestError> {
        let path = asset_path(asset.id, &asset.master_playlist_name());
        Ok(self.signer.signed_url(&path, ASSET_SCOPE, self.url_ttl)?)
    }

    /// Signed URL of one variant playlist, as fetched by the prober.
    pub fn variant_url(&self, asset: &Asset, variant: &str) -> Result<String, ManifestError> {
        let path = asset_path(asset.id, &asset.variant_playlist_name(variant));
        Ok(self.signer.signed_url(&path, ASSET_SCOPE, self.url_ttl)?)
    }

    pub fn key_url(&self, asset_id: Uuid) -> Result<String, ManifestError> {
        let path = asset_path(asset_id, KEY_FILE);
        Ok(self.signer.signed_url(&path, Scope::Exact, self.url_ttl)?)
    }

    pub fn keyinfo_url(&self, asset_id: Uuid) -> Result<String, ManifestError> {
        let path = asset_path(asset_id, KEYINFO_FILE);
        Ok(self.signer.signed_url(&path, Scope::Exact, self.url_ttl)?)
    }

    /// Three lines: key file name, signed key URL, hex IV.
    pub fn keyinfo(&self, asset: &Asset) -> Result<String, ManifestError> {
        Ok(format!(
            "{KEY_FILE}\n{}\n{}\n",
            self.key_url(asset.id)?,
            asset.iv_hex()
        ))
    }

    /// Probes each variant once for its resolution, renders the master
    /// playlist and stores it at `{id}/{id}.m3u8`.
    pub async fn build_master(&self, asset: &Asset) -> Result<String, ManifestError> {
        let mut entries = Vec::with_capacity(asset.variants.len());
        for variant in &asset.variants {
            let url = self.variant_url(asset, variant)?;
            let resolution = match self.prober.probe(&url).await {
                Ok(probe) => probe.width.zip(probe.height),
                Err(e) => {
                    warn!(asset_id = %asset.id, variant = %variant, error = %e, "resolution probe failed");
                    None
                }
            };
            entries.push(MasterEntry {
                variant: variant.clone(),
                bandwidth: bandwidth_for_label(variant),
                resolution,
                uri: asset.variant_playlist_name(variant),
            });
        }

        let subtitles: Vec<SubtitleEntry> = asset
            .subtitles
            .iter()
            .map(|(language, label)| SubtitleEntry {
                language: language.clone(),
                uri: asset.variant_playlist_name(label),
            })
            .collect();

        let master = render_master(&entries, &subtitles);
        let key = object_key(&asset.id.to_string(), &asset.master_playlist_name());
        self.storage
            .upload(&key, Bytes::from(master.clone()))
            .await?;
        info!(asset_id = %asset.id, variants = entries.len(), "master playlist stored");
        Ok(master)
    }

    pub async fn master(&self, asset: &Asset) -> Result<Bytes, ManifestError> {
        let key = object_key(&asset.id.to_string(), &asset.master_playlist_name());
        Ok(self.storage.download_bytes(&key).await?)
    }

    /// Fetches a stored variant playlist and rewrites it for delivery.
    pub async fn variant(&self, asset: &Asset, file_name: &str) -> Result<String, ManifestError> {
        let asset_dir = asset.id.to_string();
        let key_uri = self.key_url(asset.id)?;
        let iv_hex = asset.iv_hex();

        let (raw, cdn_base) = match &self.cdn {
            Some(cdn) => {
                let url = cdn.signed_url(&object_key(&asset_dir, file_name), Scope::Exact, self.url_ttl)?;
                debug!(asset_id = %asset.id, file = %file_name, "fetching variant through cdn");
                let raw = self
                    .http
                    .get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .bytes()
                    .await?;
                let dir = cdn
                    .sign(&object_key(&asset_dir, file_name), Scope::Prefix(1), self.url_ttl)?
                    .prefix_path()
                    .map(|p| format!("{}{}", cdn.base_url(), p));
                (raw, dir)
            }
            None => {
                let raw = self
                    .storage
                    .download_bytes(&object_key(&asset_dir, file_name))
                    .await?;
                (raw, None)
            }
        };

        let segments = match cdn_base.as_deref() {
            Some(base) => SegmentBase::Absolute(base),
            None => SegmentBase::Relative,
        };
        rewrite_variant(
            &raw,
            RewriteOptions {
                key_uri: &key_uri,
                iv_hex: &iv_hex,
                segments,
            },
        )
    }

    /// Raw stored object, for segments served from the signed prefix.
    pub async fn object(&self, asset_id: Uuid, file_name: &str) -> Result<ObjectStream, ManifestError> {
        Ok(self
            .storage
            .download(&object_key(&asset_id.to_string(), file_name))
            .await?)
    }
}
