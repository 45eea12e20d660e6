pub mod asset;
pub mod manifest;
pub mod scheduler;
pub mod signer;
