//! Access tokens consumed by the transport and the REST client.

use async_trait::async_trait;
use thiserror::Error;

/// Token refresh failure.
#[derive(Debug, Clone, Error)]
#[error("token refresh failed: {0}")]
pub struct TokenError(pub String);

/// Supplies bearer tokens. Acquiring them is somebody else's job.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, if any.
    async fn access_token(&self) -> Option<String>;

    /// Called on inbound activity. Implementations decide whether a refresh
    /// is actually due; errors are logged by the caller and never block
    /// message handling.
    async fn refresh(&self) -> Result<(), TokenError> {
        Ok(())
    }
}

/// A fixed token that never refreshes.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}
