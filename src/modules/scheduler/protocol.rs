//! Worker channel messages. One JSON object per WebSocket text frame,
//! tagged by `type`.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::model::{WorkerCapabilities, WorkerId, WorkerStatus};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Register {
        #[serde(default)]
        previous_id: Option<WorkerId>,
        token: String,
    },
    Info {
        capabilities: WorkerCapabilities,
    },
    Progress {
        job_id: Uuid,
        position_seconds: f64,
    },
    State {
        status: WorkerStatus,
        #[serde(default)]
        message: Option<String>,
    },
    FileProduced {
        asset_id: Uuid,
        variants: Vec<String>,
    },
    AssignAck {
        job_id: Uuid,
        accepted: bool,
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Registered {
        id: WorkerId,
    },
    AssignJob {
        job_id: Uuid,
        asset_id: Uuid,
        variants: Vec<String>,
        descriptor: Value,
    },
    Quit,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerClaims {
    pub sub: String,
    pub exp: usize,
}

/// Checks a worker registration token. Any failure means "refuse".
pub fn verify_worker_token(token: &str, secret: &str) -> Option<WorkerClaims> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<WorkerClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .ok()
        .map(|data| data.claims)
}

#[cfg(test)]
pub(crate) fn issue_worker_token(secret: &str, name: &str, ttl_secs: i64) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    let exp = time::OffsetDateTime::now_utc().unix_timestamp() + ttl_secs;
    let claims = WorkerClaims {
        sub: name.to_string(),
        exp: exp.max(0) as usize,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
