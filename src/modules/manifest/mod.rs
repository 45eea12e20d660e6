pub mod handler;
pub mod playlist;
pub mod service;

use thiserror::Error;

use crate::infrastructure::storage::StorageError;
use crate::modules::signer::SignatureError;

pub use service::ManifestService;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("playlist error: {0}")]
    Parse(String),
    #[error("expected a media playlist")]
    NotMediaPlaylist,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("cdn fetch failed: {0}")]
    Cdn(#[from] reqwest::Error),
}
