//! Authentication token handling.
//!
//! A token is fetched right before each network call and dropped after it.
//! When the server rejects a token the provider gets one chance to refresh
//! and the call is retried once; a second rejection is returned to the
//! caller, which treats it as fatal for the sync cycle.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;

/// Source of bearer tokens for remote calls.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    /// Current token.
    async fn get_token(&self) -> Result<String>;

    /// Called after the server rejected a token.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// A fixed token, for tests and trusted environments.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Hands out tokens from a list, advancing on each refresh.
///
/// Once the list is exhausted refreshing fails.
#[derive(Debug)]
pub struct RotatingTokenProvider {
    tokens: Vec<String>,
    current: Mutex<usize>,
}

impl RotatingTokenProvider {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            current: Mutex::new(0),
        }
    }

    /// Number of refreshes so far.
    pub fn refreshes(&self) -> usize {
        *self.current.lock()
    }
}

#[async_trait]
impl AuthTokenProvider for RotatingTokenProvider {
    async fn get_token(&self) -> Result<String> {
        let index = *self.current.lock();
        self.tokens
            .get(index)
            .cloned()
            .ok_or_else(|| SyncError::Auth("no token available".into()))
    }

    async fn refresh(&self) -> Result<()> {
        let mut current = self.current.lock();
        if *current + 1 >= self.tokens.len() {
            return Err(SyncError::Auth("token refresh failed".into()));
        }
        *current += 1;
        Ok(())
    }
}

/// Run `call` with a fresh token, refreshing and retrying once on rejection.
pub(crate) async fn with_token<T, F, Fut>(auth: &dyn AuthTokenProvider, mut call: F) -> Result<T>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let token = auth.get_token().await?;
    match call(token).await {
        Err(SyncError::Auth(reason)) => {
            tracing::warn!(reason = %reason, "Token rejected, refreshing");
            auth.refresh().await?;
            let token = auth.get_token().await?;
            call(token).await
        }
        other => other,
    }
}
