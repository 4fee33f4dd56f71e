//! Single-use, expiring download tokens.
//!
//! A token maps to an archive path. Consuming it deletes it; peeking keeps it
//! but drops it when the file has disappeared. Each token is its own store
//! entry under `token:`, so issuing never rewrites shared state and a sweep
//! finds stale tokens by key prefix.

use crate::clock::Clock;
use crate::transient::TransientStore;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

const TOKEN_PREFIX: &str = "token:";
const TOKEN_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub path: PathBuf,
    pub expires: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn TransientStore>,
    clock: Arc<dyn Clock>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn TransientStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn issue(&self, path: impl Into<PathBuf>, ttl: Duration) -> Result<String> {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();

        let payload = TokenPayload {
            path: path.into(),
            expires: self.clock.now() + ttl,
        };
        self.store.set(
            &token_key(&token),
            &serde_json::to_string(&payload)?,
            payload.expires,
        )?;

        Ok(token)
    }

    /// One-time read. The token is gone afterwards whatever it held.
    pub fn consume(&self, token: &str) -> Result<Option<TokenPayload>> {
        let payload = self.load(token)?;
        if !token.is_empty() {
            self.store.delete(&token_key(token))?;
        }
        Ok(payload)
    }

    pub fn peek(&self, token: &str) -> Result<Option<TokenPayload>> {
        let Some(payload) = self.load(token)? else {
            return Ok(None);
        };
        if !payload.path.exists() {
            self.store.delete(&token_key(token))?;
            return Ok(None);
        }
        Ok(Some(payload))
    }

    /// Delete every token entry that has expired.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let keys = self.store.keys_with_prefix(TOKEN_PREFIX)?;

        let mut purged = 0;
        for key in &keys {
            if self.store.get(key, now)?.is_none() && self.store.delete(key)? {
                purged += 1;
            }
        }

        tracing::info!(purged, remaining = keys.len() - purged, "Purged expired download tokens");
        Ok(purged)
    }

    fn load(&self, token: &str) -> Result<Option<TokenPayload>> {
        if token.is_empty() {
            return Ok(None);
        }
        let raw = self.store.get(&token_key(token), self.clock.now())?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }
}

fn token_key(token: &str) -> String {
    format!("{TOKEN_PREFIX}{token}")
}
