use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::config::env::{self, EnvKey};

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub public_base_url: String,
    pub database_url: Option<String>,
    pub rabbitmq_url: Option<String>,
    pub minio_url: String,
    pub minio_bucket: String,
    pub minio_access_key: String,
    pub minio_secret_key: String,
    pub staging_dir: PathBuf,
    pub signing_secret: String,
    pub signed_url_ttl_secs: u64,
    pub worker_token_secret: String,
    pub operator_token_secret: String,
    pub scheduler: SchedulerConfig,
    pub upload: UploadConfig,
    pub verifier: VerifierConfig,
    pub cdn: Option<CdnConfig>,
    pub provisioner_url: Option<String>,
    pub max_worker_instances: usize,
    pub ffprobe_path: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SchedulerConfig {
    /// Worker class -> dispatch priority.
    pub class_priorities: HashMap<String, i32>,
    pub grace_window: Duration,
    /// `None` disables idle-worker shutdown.
    pub idle_shutdown: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            class_priorities: HashMap::new(),
            grace_window: Duration::from_secs(5),
            idle_shutdown: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct UploadConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 10,
            backoff: Duration::from_millis(2000),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct VerifierConfig {
    pub segment_tolerance: usize,
    pub duration_tolerance_secs: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            segment_tolerance: 5,
            duration_tolerance_secs: 2.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CdnConfig {
    pub base_url: String,
    pub signing_secret: String,
}

impl AppConfig {
    pub fn new() -> Result<Self, std::env::VarError> {
        let cdn = match (
            env::get_opt(EnvKey::CdnBaseUrl),
            env::get_opt(EnvKey::CdnSigningSecret),
        ) {
            (Some(base_url), Some(signing_secret)) => Some(CdnConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                signing_secret,
            }),
            _ => None,
        };

        let idle_secs: u64 = env::get_parsed(EnvKey::WorkerIdleShutdownSecs, 0);

        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            public_base_url: env::get_or(EnvKey::PublicBaseUrl, "http://localhost:3000")
                .trim_end_matches('/')
                .to_string(),
            database_url: env::get_opt(EnvKey::DatabaseUrl),
            rabbitmq_url: env::get_opt(EnvKey::RabbitMqUrl),
            minio_url: env::get(EnvKey::MinioUrl)?,
            minio_bucket: env::get(EnvKey::MinioBucket)?,
            minio_access_key: env::get(EnvKey::MinioAccessKey)?,
            minio_secret_key: env::get(EnvKey::MinioSecretKey)?,
            staging_dir: PathBuf::from(env::get_or(EnvKey::StagingDir, "./staging")),
            signing_secret: env::get(EnvKey::SigningSecret)?,
            signed_url_ttl_secs: env::get_parsed(EnvKey::SignedUrlTtl, 3600),
            worker_token_secret: env::get(EnvKey::WorkerTokenSecret)?,
            operator_token_secret: env::get(EnvKey::OperatorTokenSecret)?,
            scheduler: SchedulerConfig {
                class_priorities: parse_priorities(&env::get_or(EnvKey::WorkerPriorities, "")),
                grace_window: Duration::from_secs(env::get_parsed(EnvKey::WorkerGraceSecs, 5)),
                idle_shutdown: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            },
            upload: UploadConfig {
                concurrency: env::get_parsed(EnvKey::UploadConcurrency, 4).max(1),
                max_attempts: env::get_parsed(EnvKey::UploadMaxAttempts, 10).max(1),
                backoff: Duration::from_millis(env::get_parsed(EnvKey::UploadBackoffMs, 2000)),
            },
            verifier: VerifierConfig {
                segment_tolerance: env::get_parsed(EnvKey::SegmentTolerance, 5),
                duration_tolerance_secs: env::get_parsed(EnvKey::DurationTolerance, 2.0),
            },
            cdn,
            provisioner_url: env::get_opt(EnvKey::ProvisionerUrl),
            max_worker_instances: env::get_parsed(EnvKey::MaxWorkerInstances, 4),
            ffprobe_path: env::get_or(EnvKey::FfprobePath, "ffprobe"),
        })
    }
}

/// Parses `gpu=10,cpu=5` into a class -> priority map. Malformed pairs are skipped.
pub fn parse_priorities(raw: &str) -> HashMap<String, i32> {
    raw.split(',')
        .filter_map(|pair| {
            let (class, priority) = pair.split_once('=')?;
            let class = class.trim();
            if class.is_empty() {
                return None;
            }
            Some((class.to_string(), priority.trim().parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_class_priorities() {
        let map = parse_priorities("gpu=10, cpu = 5,broken,=3,slow=x");
        assert_eq!(map.len(), 2);
        assert_eq!(map["gpu"], 10);
        assert_eq!(map["cpu"], 5);
    }

    #[test]
    fn empty_priorities_yield_empty_map() {
        assert!(parse_priorities("").is_empty());
    }
}
