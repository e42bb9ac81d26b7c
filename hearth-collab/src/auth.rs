//! Identity capability.
//!
//! Credential issuance lives outside this crate. A provider only has to
//! return a stable opaque id plus display profile; [`sign_in`] turns that
//! into a stored [`UserProfile`].
//!
//! On the gateway side a [`TokenVerifier`] resolves the token a client
//! presents in its Hello frame to the uid the connection acts as.

use crate::error::{CollabError, Result};
use crate::model::{UserProfile, ANONYMOUS_NAME};
use crate::registry::RoomRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            email: None,
            avatar_url: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_avatar_url(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    /// Display name, or "Anonymous" when missing or blank.
    pub fn name_or_anonymous(&self) -> &str {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => ANONYMOUS_NAME,
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Authenticate the current user. Fails with [`CollabError::AuthFailed`].
    async fn authenticate(&self) -> Result<Identity>;
}

/// Provider with a fixed outcome.
#[derive(Debug, Clone)]
pub struct StaticIdentityProvider {
    outcome: std::result::Result<Identity, String>,
}

impl StaticIdentityProvider {
    pub fn new(identity: Identity) -> Self {
        Self {
            outcome: Ok(identity),
        }
    }

    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            outcome: Err(reason.into()),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self) -> Result<Identity> {
        self.outcome.clone().map_err(CollabError::AuthFailed)
    }
}

/// Server-side check of the token a client presents.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve `token` to a uid. Fails with [`CollabError::AuthFailed`].
    async fn verify(&self, token: &str) -> Result<String>;
}

/// Verifier over a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, uid: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), uid.into());
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl<T: Into<String>, U: Into<String>> FromIterator<(T, U)> for StaticTokenVerifier {
    fn from_iter<I: IntoIterator<Item = (T, U)>>(iter: I) -> Self {
        Self {
            tokens: iter
                .into_iter()
                .map(|(token, uid)| (token.into(), uid.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CollabError::AuthFailed("unknown token".into()))
    }
}

/// Takes the token as the uid itself. Only for gateways reachable from a
/// trusted network.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedNetworkVerifier;

#[async_trait]
impl TokenVerifier for TrustedNetworkVerifier {
    async fn verify(&self, token: &str) -> Result<String> {
        if token.is_empty() || token.contains('/') {
            return Err(CollabError::AuthFailed(format!("invalid uid {token:?}")));
        }
        Ok(token.to_string())
    }
}

/// Authenticate and make sure the user's profile document exists.
pub async fn sign_in(
    provider: &dyn IdentityProvider,
    registry: &RoomRegistry,
) -> Result<UserProfile> {
    let identity = provider.authenticate().await?;
    log::info!("Signed in {}", identity.id);
    registry.ensure_user(&identity).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_or_anonymous() {
        assert_eq!(Identity::new("u").name_or_anonymous(), "Anonymous");
        assert_eq!(
            Identity::new("u").with_display_name("  ").name_or_anonymous(),
            "Anonymous"
        );
        assert_eq!(
            Identity::new("u").with_display_name("Ada").name_or_anonymous(),
            "Ada"
        );
    }

    #[tokio::test]
    async fn test_static_provider() {
        let ok = StaticIdentityProvider::new(Identity::new("u1"));
        assert_eq!(ok.authenticate().await.unwrap().id, "u1");

        let err = StaticIdentityProvider::rejecting("popup closed")
            .authenticate()
            .await
            .unwrap_err();
        assert_eq!(err, CollabError::AuthFailed("popup closed".into()));
    }

    #[tokio::test]
    async fn test_static_token_verifier() {
        let verifier: StaticTokenVerifier = [("t-alice", "alice")].into_iter().collect();
        let verifier = verifier.with_token("t-bob", "bob");
        assert_eq!(verifier.len(), 2);
        assert_eq!(verifier.verify("t-bob").await.unwrap(), "bob");
        // A uid is not a token
        assert!(matches!(
            verifier.verify("alice").await,
            Err(CollabError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_trusted_network_verifier() {
        assert_eq!(TrustedNetworkVerifier.verify("alice").await.unwrap(), "alice");
        assert!(TrustedNetworkVerifier.verify("").await.is_err());
        assert!(TrustedNetworkVerifier.verify("users/alice").await.is_err());
    }
}
