use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// External fleet-management capability that starts encode worker instances.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Ensures at least `instances` workers are being provisioned.
    async fn provision(&self, instances: usize) -> Result<(), ProvisionError>;
}

#[derive(Debug, Serialize)]
struct ProvisionRequest {
    instances: usize,
}

pub struct HttpProvisioner {
    client: Client,
    url: String,
}

impl HttpProvisioner {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn provision(&self, instances: usize) -> Result<(), ProvisionError> {
        self.client
            .post(&self.url)
            .json(&ProvisionRequest { instances })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
