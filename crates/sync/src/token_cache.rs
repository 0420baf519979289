// Token validation cache: "is the current credential usable right now?"
//
// Holds a single entry (most recent token wins). The store is consulted only
// when the token value changes or after `invalidate()`, which sync passes call
// whenever they hit an error.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::transport::{SessionTransport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValidityEntry {
    pub token: String,
    pub is_valid: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TokenValidationCache {
    entry: Mutex<Option<TokenValidityEntry>>,
}

impl TokenValidationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Ok(None)` when no token was supplied; callers skip without error.
    pub async fn is_valid(
        &self,
        token: Option<&str>,
        transport: &dyn SessionTransport,
    ) -> Result<Option<bool>, TransportError> {
        let Some(token) = token else {
            return Ok(None);
        };

        if let Some(cached) = self.cached(token) {
            return Ok(Some(cached));
        }

        let is_valid = transport.token_valid().await?;
        debug!(is_valid, "token validity checked against session store");
        if let Ok(mut guard) = self.entry.lock() {
            *guard = Some(TokenValidityEntry {
                token: token.to_string(),
                is_valid,
                checked_at: Utc::now(),
            });
        }
        Ok(Some(is_valid))
    }

    /// Cached result for exactly this token value.
    pub fn cached(&self, token: &str) -> Option<bool> {
        let guard = self.entry.lock().ok()?;
        guard.as_ref().filter(|entry| entry.token == token).map(|entry| entry.is_valid)
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.entry.lock() {
            *guard = None;
        }
    }

    pub fn entry(&self) -> Option<TokenValidityEntry> {
        self.entry.lock().ok().and_then(|guard| guard.clone())
    }
}
