//! Connection identity.
//!
//! The orchestrator does not issue credentials. At handshake time the
//! transport hands the presented token to an [`IdentityProvider`], which
//! resolves it to a user id and display name or rejects the connection.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DuelError, Result};
use crate::protocol::UserId;

/// Authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Resolves a handshake token to an identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Result<Identity>;
}

/// Fixed token table.
#[derive(Default)]
pub struct StaticIdentity {
    tokens: DashMap<String, Identity>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    pub fn with(self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn verify(&self, token: &str) -> Result<Identity> {
        self.tokens
            .get(token)
            .map(|r| r.value().clone())
            .ok_or_else(|| DuelError::auth_failed("unknown token"))
    }
}

/// Takes the token at face value as `userId[:username]`.
///
/// Development only: anyone can claim any user id.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedTokenIdentity;

#[async_trait]
impl IdentityProvider for TrustedTokenIdentity {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let (user_id, username) = match token.split_once(':') {
            Some((user_id, username)) => (user_id.trim(), username.trim()),
            None => (token.trim(), token.trim()),
        };
        if user_id.is_empty() {
            return Err(DuelError::auth_failed("empty user id"));
        }
        let username = if username.is_empty() { user_id } else { username };
        Ok(Identity::new(user_id, username))
    }
}
