//! Outbound "asset finished" notifications.

pub mod rabbitmq;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::modules::asset::model::AssetState;

pub use rabbitmq::RabbitMqService;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AssetFinished {
    pub asset_id: Uuid,
    pub state: AssetState,
}

#[async_trait]
pub trait FinishedNotifier: Send + Sync {
    async fn asset_finished(&self, event: &AssetFinished) -> Result<()>;
}

/// Used when no broker is configured.
pub struct LogNotifier;

#[async_trait]
impl FinishedNotifier for LogNotifier {
    async fn asset_finished(&self, event: &AssetFinished) -> Result<()> {
        info!(asset_id = %event.asset_id, state = %event.state, "Asset finished");
        Ok(())
    }
}
