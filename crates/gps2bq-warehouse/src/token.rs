// Bearer-token seam for the warehouse API.
//
// Credential discovery (service accounts, metadata server) lives
// outside this crate; deployments inject a provider.

use async_trait::async_trait;

use gps2bq_core::LoadError;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A bearer token valid for the next request, or `None` when the
    /// endpoint needs no authorization (emulators).
    async fn token(&self) -> Result<Option<String>, LoadError>;
}

/// Fixed token handed in at startup.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Read the token from an environment variable.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var).ok().filter(|t| !t.is_empty()).map(Self)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<Option<String>, LoadError> {
        Ok(Some(self.0.clone()))
    }
}

/// No authorization header at all.
pub struct NoAuth;

#[async_trait]
impl TokenProvider for NoAuth {
    async fn token(&self) -> Result<Option<String>, LoadError> {
        Ok(None)
    }
}
