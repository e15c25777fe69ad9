//! Pluggable caller authentication.
//!
//! The HTTP layer extracts a bearer credential and hands it to a
//! [`CredentialVerifier`]; the resulting [`CallerIdentity`] is all the
//! sync handlers ever see. Swapping the scheme means swapping the
//! verifier, never touching the protocol.
//!
//! [`HmacVerifier`] is the production scheme: a credential is
//! `<caller>.<hex hmac-sha256(secret, caller)>`, so the server needs no
//! credential database, only the shared secret.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use merkle_sync_core::{AuthError, CallerIdentity};

use crate::config::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

/// Turns a raw credential into a caller identity.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, raw: &str) -> Result<CallerIdentity, AuthError>;
}

/// Verifies `<caller>.<signature>` credentials signed with a shared secret.
pub struct HmacVerifier {
    secret: Vec<u8>,
}

impl HmacVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Reads the secret from the environment variable named in `[auth]`.
    pub fn from_env(config: &AuthConfig) -> Result<Self> {
        let secret = std::env::var(&config.secret_env).unwrap_or_default();
        if secret.trim().is_empty() {
            bail!("{} environment variable not set", config.secret_env);
        }
        Ok(Self::new(secret))
    }

    /// Mints a credential for `caller`.
    pub fn issue(&self, caller: &str) -> Result<String> {
        if caller.is_empty() {
            bail!("caller must not be empty");
        }
        let signature = self.mac(caller).finalize().into_bytes();
        Ok(format!("{}.{}", caller, hex::encode(signature)))
    }

    fn mac(&self, caller: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(caller.as_bytes());
        mac
    }
}

#[async_trait]
impl CredentialVerifier for HmacVerifier {
    async fn verify(&self, raw: &str) -> Result<CallerIdentity, AuthError> {
        let (caller, signature) = raw.rsplit_once('.').ok_or(AuthError::Malformed)?;
        if caller.is_empty() {
            return Err(AuthError::Malformed);
        }
        let signature = hex::decode(signature).map_err(|_| AuthError::Malformed)?;

        // verify_slice compares in constant time
        self.mac(caller)
            .verify_slice(&signature)
            .map_err(|_| AuthError::Rejected)?;
        Ok(CallerIdentity::new(caller))
    }
}

/// Fixed credential table, for development and tests.
#[derive(Default)]
pub struct StaticVerifier {
    credentials: HashMap<String, CallerIdentity>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, credential: impl Into<String>, caller: impl Into<String>) -> Self {
        self.credentials
            .insert(credential.into(), CallerIdentity::new(caller));
        self
    }
}

#[async_trait]
impl CredentialVerifier for StaticVerifier {
    async fn verify(&self, raw: &str) -> Result<CallerIdentity, AuthError> {
        self.credentials.get(raw).cloned().ok_or(AuthError::Rejected)
    }
}

/// Extracts the credential from an `Authorization` header value.
pub fn bearer_credential(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::Missing)?;
    let credential = value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::Malformed)?
        .trim();
    if credential.is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_then_verify() {
        let v = HmacVerifier::new("s3cret");
        let token = v.issue("alice").unwrap();
        assert!(token.starts_with("alice."));
        assert_eq!(v.verify(&token).await.unwrap().as_str(), "alice");
    }

    #[tokio::test]
    async fn test_caller_with_dots() {
        let v = HmacVerifier::new("s3cret");
        let token = v.issue("ci.build.7").unwrap();
        assert_eq!(v.verify(&token).await.unwrap().as_str(), "ci.build.7");
    }

    #[tokio::test]
    async fn test_rejects_forged_and_foreign_tokens() {
        let v = HmacVerifier::new("s3cret");
        let other = HmacVerifier::new("different");

        let forged = v.issue("alice").unwrap().replacen("alice", "mallory", 1);
        assert_eq!(v.verify(&forged).await, Err(AuthError::Rejected));
        let foreign = other.issue("alice").unwrap();
        assert_eq!(v.verify(&foreign).await, Err(AuthError::Rejected));
    }

    #[tokio::test]
    async fn test_rejects_malformed_tokens() {
        let v = HmacVerifier::new("s3cret");
        assert_eq!(v.verify("no-separator").await, Err(AuthError::Malformed));
        assert_eq!(v.verify(".abcd").await, Err(AuthError::Malformed));
        assert_eq!(v.verify("alice.zz").await, Err(AuthError::Malformed));
    }

    #[tokio::test]
    async fn test_static_verifier() {
        let v = StaticVerifier::new().with("dev-token", "dev");
        assert_eq!(v.verify("dev-token").await.unwrap().as_str(), "dev");
        assert_eq!(v.verify("nope").await, Err(AuthError::Rejected));
    }

    #[test]
    fn test_bearer_credential() {
        assert_eq!(bearer_credential(Some("Bearer abc")), Ok("abc"));
        assert_eq!(bearer_credential(None), Err(AuthError::Missing));
        assert_eq!(bearer_credential(Some("Basic abc")), Err(AuthError::Malformed));
        assert_eq!(bearer_credential(Some("Bearer   ")), Err(AuthError::Missing));
    }
}
