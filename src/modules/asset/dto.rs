use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

use super::model::{Asset, Job};
use super::verifier::VerificationReport;

fn validate_labels(labels: &Vec<String>) -> Result<(), ValidationError> {
    let valid = |label: &String| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    if labels.iter().all(valid) {
        Ok(())
    } else {
        Err(ValidationError::new("variant_label")
            .with_message("Variant labels may only contain letters, digits, '_' and '-'".into()))
    }
}

fn validate_subtitles(subtitles: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    let labels: Vec<String> = subtitles.values().cloned().collect();
    validate_labels(&labels)
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateAssetRequest {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(
        length(min = 1, message = "At least one variant is required"),
        custom(function = "validate_labels")
    )]
    pub variants: Vec<String>,
    #[validate(range(exclusive_min = 0.0, message = "Source duration must be positive"))]
    pub source_duration: f64,
    /// Handed to the worker verbatim.
    #[schema(value_type = Object)]
    #[serde(default)]
    pub descriptor: Value,
    /// Language -> subtitle playlist label.
    #[validate(custom(function = "validate_subtitles"))]
    #[serde(default)]
    pub subtitles: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AssetResponse {
    pub asset: Asset,
    pub job: Option<Job>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PlaybackUrlsResponse {
    pub master: String,
    pub keyinfo: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    pub report: Option<VerificationReport>,
}
