//! Auth collaborator interface.
//!
//! The engine never issues or refreshes tokens itself: it asks the provider
//! for the current bearer token at connect time and at each channel rejoin.
//! The provider is expected to serve a valid token or fail, and to coalesce
//! concurrent refreshes on its side.

use async_trait::async_trait;
use thiserror::Error;

/// Token provider failure.
#[derive(Debug, Clone, Error)]
#[error("token unavailable: {0}")]
pub struct TokenError(pub String);

/// Source of the current bearer token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Get the current token, or `None` for unauthenticated endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error when no valid token can be served.
    async fn current_token(&self) -> Result<Option<String>, TokenError>;
}

/// A fixed token (or none at all).
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Provider serving the given token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// Provider for unauthenticated endpoints.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn current_token(&self) -> Result<Option<String>, TokenError> {
        Ok(self.0.clone())
    }
}
