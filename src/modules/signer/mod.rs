pub mod service;

pub use service::{Scope, SignatureError, SignedToken, Signer};
