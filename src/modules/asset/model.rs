use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AssetState {
    New,
    Processing,
    Processed,
    Verified,
    Error,
}

impl AssetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetState::New => "new",
            AssetState::Processing => "processing",
            AssetState::Processed => "processed",
            AssetState::Verified => "verified",
            AssetState::Error => "error",
        }
    }

    /// States from which the finisher may still run.
    pub fn awaiting_finish(&self) -> bool {
        matches!(self, AssetState::New | AssetState::Processing)
    }
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(AssetState::New),
            "processing" => Ok(AssetState::Processing),
            "processed" => Ok(AssetState::Processed),
            "verified" => Ok(AssetState::Verified),
            "error" => Ok(AssetState::Error),
            other => Err(format!("unknown asset state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    New,
    Encoding,
    Done,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Encoding => "encoding",
            JobState::Done => "done",
            JobState::Error => "error",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobState::New),
            "encoding" => Ok(JobState::Encoding),
            "done" => Ok(JobState::Done),
            "error" => Ok(JobState::Error),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Asset {
    pub id: Uuid,
    pub title: String,
    pub state: AssetState,
    /// Expected variant labels, in declaration order, without duplicates.
    pub variants: Vec<String>,
    #[schema(value_type = Vec<String>)]
    pub uploaded_variants: BTreeSet<String>,
    /// Subtitle language -> subtitle playlist label.
    #[schema(value_type = Object)]
    pub subtitles: BTreeMap<String, String>,
    pub source_duration: f64,
    #[serde(skip)]
    pub encryption_key: [u8; 16],
    #[serde(skip)]
    pub encryption_iv: [u8; 16],
    pub job_id: Option<Uuid>,
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

impl Asset {
    pub fn new(
        title: impl Into<String>,
        variants: impl IntoIterator<Item = String>,
        source_duration: f64,
        subtitles: BTreeMap<String, String>,
    ) -> Self {
        let mut ordered: Vec<String> = Vec::new();
        for variant in variants {
            if !ordered.contains(&variant) {
                ordered.push(variant);
            }
        }
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            state: AssetState::New,
            variants: ordered,
            uploaded_variants: BTreeSet::new(),
            subtitles,
            source_duration,
            encryption_key: rand::random(),
            encryption_iv: rand::random(),
            job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn expects(&self, variant: &str) -> bool {
        self.variants.iter().any(|v| v == variant)
    }

    pub fn all_variants_uploaded(&self) -> bool {
        !self.variants.is_empty()
            && self
                .variants
                .iter()
                .all(|v| self.uploaded_variants.contains(v))
    }

    /// Adds `variant` to the uploaded set when it is expected.
    /// Returns whether the set changed.
    pub fn record_uploaded(&mut self, variant: &str) -> bool {
        if !self.expects(variant) {
            return false;
        }
        self.uploaded_variants.insert(variant.to_string())
    }

    pub fn master_playlist_name(&self) -> String {
        format!("{}.m3u8", self.id)
    }

    pub fn variant_playlist_name(&self, variant: &str) -> String {
        format!("{}.{}.m3u8", self.id, variant)
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(self.encryption_iv)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Job {
    pub id: Uuid,
    pub asset_id: Uuid,
    /// Transcoder arguments. Opaque to the scheduler.
    #[schema(value_type = Object)]
    pub descriptor: Value,
    pub variants: Vec<String>,
    pub state: JobState,
    pub progress_secs: f64,
    pub error: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

impl Job {
    pub fn for_asset(asset: &Asset, descriptor: Value) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            asset_id: asset.id,
            descriptor,
            variants: asset.variants.clone(),
            state: JobState::New,
            progress_secs: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Splits `{asset_id}.{variant}.m3u8` into its parts.
pub fn parse_variant_playlist_name(file_name: &str) -> Option<(Uuid, &str)> {
    let mut parts = file_name.split('.');
    let asset_id = Uuid::parse_str(parts.next()?).ok()?;
    let variant = parts.next()?;
    match (parts.next(), parts.next()) {
        (Some("m3u8"), None) if !variant.is_empty() => Some((asset_id, variant)),
        _ => None,
    }
}
