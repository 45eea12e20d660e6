use std::env;
use std::str::FromStr;

use tracing::warn;

pub enum EnvKey {
    ServerPort,
    PublicBaseUrl,
    DatabaseUrl,
    RabbitMqUrl,
    MinioUrl,
    MinioBucket,
    MinioAccessKey,
    MinioSecretKey,
    StagingDir,
    SigningSecret,
    SignedUrlTtl,
    WorkerTokenSecret,
    OperatorTokenSecret,
    WorkerPriorities,
    WorkerGraceSecs,
    WorkerIdleShutdownSecs,
    UploadConcurrency,
    UploadMaxAttempts,
    UploadBackoffMs,
    SegmentTolerance,
    DurationTolerance,
    CdnBaseUrl,
    CdnSigningSecret,
    ProvisionerUrl,
    MaxWorkerInstances,
    FfprobePath,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::PublicBaseUrl => "PUBLIC_BASE_URL",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::RabbitMqUrl => "RABBITMQ_URL",
            EnvKey::MinioUrl => "MINIO_ENDPOINT",
            EnvKey::MinioBucket => "MINIO_BUCKET_VIDEOS",
            EnvKey::MinioAccessKey => "AWS_ACCESS_KEY_ID",
            EnvKey::MinioSecretKey => "AWS_SECRET_ACCESS_KEY",
            EnvKey::StagingDir => "STAGING_DIR",
            EnvKey::SigningSecret => "SIGNING_SECRET",
            EnvKey::SignedUrlTtl => "SIGNED_URL_TTL_SECS",
            EnvKey::WorkerTokenSecret => "WORKER_TOKEN_SECRET",
            EnvKey::OperatorTokenSecret => "OPERATOR_TOKEN_SECRET",
            EnvKey::WorkerPriorities => "WORKER_PRIORITIES",
            EnvKey::WorkerGraceSecs => "WORKER_GRACE_SECS",
            EnvKey::WorkerIdleShutdownSecs => "WORKER_IDLE_SHUTDOWN_SECS",
            EnvKey::UploadConcurrency => "UPLOAD_CONCURRENCY",
            EnvKey::UploadMaxAttempts => "UPLOAD_MAX_ATTEMPTS",
            EnvKey::UploadBackoffMs => "UPLOAD_BACKOFF_MS",
            EnvKey::SegmentTolerance => "SEGMENT_TOLERANCE",
            EnvKey::DurationTolerance => "DURATION_TOLERANCE_SECS",
            EnvKey::CdnBaseUrl => "CDN_BASE_URL",
            EnvKey::CdnSigningSecret => "CDN_SIGNING_SECRET",
            EnvKey::ProvisionerUrl => "PROVISIONER_URL",
            EnvKey::MaxWorkerInstances => "MAX_WORKER_INSTANCES",
            EnvKey::FfprobePath => "FFPROBE_PATH",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_opt(key: EnvKey) -> Option<String> {
    env::var(key.as_str()).ok().filter(|v| !v.trim().is_empty())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    let name = key.as_str();
    match get(key) {
        Ok(val) => match val.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key = name, value = %val, "unparsable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_numbers_fall_back_to_the_default() {
        // Only this test touches MAX_WORKER_INSTANCES.
        unsafe { env::set_var(EnvKey::MaxWorkerInstances.as_str(), "ten") };
        assert_eq!(get_parsed::<usize>(EnvKey::MaxWorkerInstances, 4), 4);

        unsafe { env::set_var(EnvKey::MaxWorkerInstances.as_str(), " 7 ") };
        assert_eq!(get_parsed::<usize>(EnvKey::MaxWorkerInstances, 4), 7);

        unsafe { env::remove_var(EnvKey::MaxWorkerInstances.as_str()) };
        assert_eq!(get_parsed::<usize>(EnvKey::MaxWorkerInstances, 4), 4);
    }
}
