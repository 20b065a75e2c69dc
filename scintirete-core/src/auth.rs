//! Authentication contract.
//!
//! The credential store itself lives outside the core; the engine only
//! calls [`Authenticator::authenticate`] with the opaque token the
//! gateway extracted and refuses the operation on failure.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validates an opaque credential. `None` means the caller supplied
    /// no token at all.
    async fn authenticate(&self, token: Option<&str>) -> Result<()>;
}

/// Accepts everything. For embedded use and tests.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _token: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Validates tokens against a fixed in-memory set.
pub struct StaticTokenAuthenticator {
    tokens: HashSet<String>,
}

impl StaticTokenAuthenticator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: Option<&str>) -> Result<()> {
        match token {
            None => Err(Error::Unauthenticated("missing credential".into())),
            Some(t) if self.tokens.contains(t) => Ok(()),
            Some(_) => Err(Error::Unauthenticated("invalid credential".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.authenticate(None).await.is_ok());
        assert!(AllowAll.authenticate(Some("anything")).await.is_ok());
    }

    #[tokio::test]
    async fn test_static_tokens() {
        let auth = StaticTokenAuthenticator::new(["secret-1", "secret-2"]);
        assert!(auth.authenticate(Some("secret-1")).await.is_ok());
        assert!(matches!(
            auth.authenticate(Some("wrong")).await,
            Err(Error::Unauthenticated(_))
        ));
        assert!(matches!(
            auth.authenticate(None).await,
            Err(Error::Unauthenticated(_))
        ));
    }
}
