//! Expiring, scope-limited HMAC tokens for URLs.
//!
//! A signed URL has the shape `/signed/{expiry_ms}/{scope}/{signature}/{path}`.
//! `scope = 0` authorises exactly `path`; `scope = n` authorises every path
//! whose first `n` components match, so one signature can cover all files of
//! an asset.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNED_PREFIX: &str = "signed";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signed url is malformed")]
    Malformed,
    #[error("signature expired")]
    Expired,
    #[error("path is outside the signed scope")]
    ScopeMismatch,
    #[error("invalid signature")]
    InvalidSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Exact,
    Prefix(usize),
}

impl Scope {
    fn from_segment(n: usize) -> Self {
        if n == 0 { Scope::Exact } else { Scope::Prefix(n) }
    }

    fn as_segment(self) -> usize {
        match self {
            Scope::Exact => 0,
            Scope::Prefix(n) => n,
        }
    }
}

/// A parsed or freshly issued token, bound to the path it was presented with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedToken {
    pub path: String,
    pub scope: Scope,
    pub expires_ms: i64,
    pub signature: String,
}

impl SignedToken {
    /// Relative URL form, always starting with `/signed/`.
    pub fn to_path(&self) -> String {
        format!(
            "/{SIGNED_PREFIX}/{}/{}/{}/{}",
            self.expires_ms,
            self.scope.as_segment(),
            self.signature,
            self.path
        )
    }

    /// The signed directory this token authorises, e.g. `/signed/../assets/{id}`.
    /// Relative URIs inside a manifest resolve against it.
    pub fn prefix_path(&self) -> Option<String> {
        let Scope::Prefix(n) = self.scope else {
            return None;
        };
        let components: Vec<&str> = components(&self.path).take(n).collect();
        Some(format!(
            "/{SIGNED_PREFIX}/{}/{}/{}/{}",
            self.expires_ms,
            n,
            self.signature,
            components.join("/")
        ))
    }

    /// Parses the part of a request path after `/signed/`.
    pub fn parse(rest: &str) -> Result<Self, SignatureError> {
        let rest = rest.trim_start_matches('/');
        let mut parts = rest.splitn(4, '/');
        let expires_ms = parts
            .next()
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(SignatureError::Malformed)?;
        let scope = parts
            .next()
            .and_then(|v| v.parse::<usize>().ok())
            .map(Scope::from_segment)
            .ok_or(SignatureError::Malformed)?;
        let signature = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::Malformed)?
            .to_string();
        let path = normalize(parts.next().ok_or(SignatureError::Malformed)?);
        if path.is_empty() {
            return Err(SignatureError::Malformed);
        }
        Ok(Self {
            path,
            scope,
            expires_ms,
            signature,
        })
    }
}

/// HMAC-SHA256 over `scopedPath` immediately followed by the decimal expiry.
///
/// There is no separator, so a trailing digit of the scoped path and the
/// leading digits of the expiry are interchangeable under one MAC. Only
/// `assets/{uuid}` scopes and file names are signed, and shortening a UUID
/// never yields another asset id, so a shifted token cannot name real content.
#[derive(Clone)]
pub struct Signer {
    secret: Arc<Vec<u8>>,
    base_url: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>, base_url: impl Into<String>) -> Self {
        Self {
            secret: Arc::new(secret.as_ref().to_vec()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn sign(&self, path: &str, scope: Scope, ttl: Duration) -> Result<SignedToken, SignatureError> {
        let expires_ms = now_ms().saturating_add(ttl.as_millis() as i64);
        self.sign_until(path, scope, expires_ms)
    }

    pub fn sign_until(
        &self,
        path: &str,
        scope: Scope,
        expires_ms: i64,
    ) -> Result<SignedToken, SignatureError> {
        let path = normalize(path);
        let scoped = scoped_path(&path, scope)?;
        let signature = hex::encode(self.mac(&scoped, expires_ms)?.finalize().into_bytes());
        Ok(SignedToken {
            path,
            scope,
            expires_ms,
            signature,
        })
    }

    /// Absolute URL for `path`, using this signer's base URL.
    pub fn signed_url(&self, path: &str, scope: Scope, ttl: Duration) -> Result<String, SignatureError> {
        Ok(format!("{}{}", self.base_url, self.sign(path, scope, ttl)?.to_path()))
    }

    pub fn verify(&self, token: &SignedToken) -> Result<(), SignatureError> {
        self.verify_at(token, now_ms())
    }

    pub fn verify_at(&self, token: &SignedToken, now_ms: i64) -> Result<(), SignatureError> {
        if now_ms >= token.expires_ms {
            return Err(SignatureError::Expired);
        }
        let scoped = scoped_path(&token.path, token.scope)?;
        let presented =
            hex::decode(&token.signature).map_err(|_| SignatureError::InvalidSignature)?;
        self.mac(&scoped, token.expires_ms)?
            .verify_slice(&presented)
            .map_err(|_| SignatureError::InvalidSignature)
    }

    fn mac(&self, scoped: &str, expires_ms: i64) -> Result<HmacSha256, SignatureError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|_| SignatureError::InvalidSignature)?;
        mac.update(scoped.as_bytes());
        mac.update(expires_ms.to_string().as_bytes());
        Ok(mac)
    }
}

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

fn normalize(path: &str) -> String {
    components(path).collect::<Vec<_>>().join("/")
}

fn scoped_path(path: &str, scope: Scope) -> Result<String, SignatureError> {
    match scope {
        Scope::Exact => Ok(normalize(path)),
        Scope::Prefix(n) => {
            let parts: Vec<&str> = components(path).take(n).collect();
            if parts.len() < n {
                return Err(SignatureError::ScopeMismatch);
            }
            Ok(parts.join("/"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Signer {
        Signer::new("super-secret-key", "https://media.example.com/")
    }

    #[test]
    fn valid_strictly_before_expiry() {
        let signer = signer();
        let token = signer
            .sign_until("/assets/a1/a1.m3u8", Scope::Exact, 10_000)
            .unwrap();
        assert_eq!(signer.verify_at(&token, 9_999), Ok(()));
        assert_eq!(signer.verify_at(&token, 10_000), Err(SignatureError::Expired));
        assert_eq!(signer.verify_at(&token, 10_001), Err(SignatureError::Expired));
    }

    #[test]
    fn exact_scope_rejects_other_paths() {
        let signer = signer();
        let mut token = signer
            .sign_until("assets/a1/a1.m3u8", Scope::Exact, 10_000)
            .unwrap();
        token.path = "assets/a1/a1.1000k.m3u8".into();
        assert_eq!(
            signer.verify_at(&token, 1),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn prefix_scope_covers_subtree() {
        let signer = signer();
        let token = signer
            .sign_until("assets/a1/a1.m3u8", Scope::Prefix(2), 10_000)
            .unwrap();

        let mut sibling = token.clone();
        sibling.path = "assets/a1/a1.1000k.003.ts".into();
        assert_eq!(signer.verify_at(&sibling, 1), Ok(()));

        let mut other_asset = token.clone();
        other_asset.path = "assets/a2/a2.m3u8".into();
        assert_eq!(
            signer.verify_at(&other_asset, 1),
            Err(SignatureError::InvalidSignature)
        );

        let mut too_short = token;
        too_short.path = "assets".into();
        assert_eq!(
            signer.verify_at(&too_short, 1),
            Err(SignatureError::ScopeMismatch)
        );
    }

    #[test]
    fn scope_change_invalidates_signature() {
        let signer = signer();
        let mut token = signer
            .sign_until("assets/a1/a1.m3u8", Scope::Prefix(2), 10_000)
            .unwrap();
        token.scope = Scope::Prefix(1);
        assert_eq!(
            signer.verify_at(&token, 1),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn different_secret_fails() {
        let token = signer()
            .sign_until("assets/a1/file.key", Scope::Exact, 10_000)
            .unwrap();
        let other = Signer::new("another-secret", "https://media.example.com");
        assert_eq!(
            other.verify_at(&token, 1),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn url_round_trip() {
        let signer = signer();
        let token = signer
            .sign_until("assets/a1/a1.m3u8", Scope::Prefix(2), 42_000)
            .unwrap();
        let path = token.to_path();
        assert!(path.starts_with("/signed/42000/2/"));

        let parsed = SignedToken::parse(path.trim_start_matches("/signed/")).unwrap();
        assert_eq!(parsed, token);
        assert_eq!(signer.verify_at(&parsed, 41_999), Ok(()));
        assert_eq!(
            parsed.prefix_path().unwrap(),
            format!("/signed/42000/2/{}/assets/a1", token.signature)
        );
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert_eq!(SignedToken::parse("abc/0/sig/x"), Err(SignatureError::Malformed));
        assert_eq!(SignedToken::parse("100/0/sig"), Err(SignatureError::Malformed));
        assert_eq!(SignedToken::parse("100/0//x"), Err(SignatureError::Malformed));
        assert_eq!(SignedToken::parse("100/-1/sig/x"), Err(SignatureError::Malformed));
    }

    #[test]
    fn garbage_signature_is_invalid_not_panic() {
        let signer = signer();
        let token = SignedToken {
            path: "assets/a1/file.key".into(),
            scope: Scope::Exact,
            expires_ms: 10_000,
            signature: "zz-not-hex".into(),
        };
        assert_eq!(
            signer.verify_at(&token, 1),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn signed_url_uses_base_without_double_slash() {
        let url = signer()
            .signed_url("assets/a1/a1.m3u8", Scope::Prefix(2), Duration::from_secs(60))
            .unwrap();
        assert!(url.starts_with("https://media.example.com/signed/"));
    }
}
