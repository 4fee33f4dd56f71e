//! Exclusive-operation lock.
//!
//! Backup and restore share one exclusion domain: a single marker records
//! which kind of operation holds it, and acquiring any kind fails while a
//! live marker exists. Markers carry a TTL so a crashed process cannot block
//! new operations forever.

use crate::clock::Clock;
use crate::transient::TransientStore;
use crate::{Result, SnapshotError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const LOCK_KEY: &str = "lock:operation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backup" => Ok(OperationKind::Backup),
            "restore" => Ok(OperationKind::Restore),
            other => Err(SnapshotError::InvalidArgument(format!(
                "unknown operation kind '{other}'"
            ))),
        }
    }
}

/// Persisted lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub kind: OperationKind,
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn TransientStore>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(store: Arc<dyn TransientStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Take the lock for `kind`. Fails immediately with `Busy` when any live
    /// marker exists; there is no waiting.
    pub fn acquire(&self, kind: OperationKind, ttl: Duration) -> Result<LockHandle> {
        let now = self.clock.now();
        let marker = LockMarker {
            kind,
            owner: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        let encoded = serde_json::to_string(&marker)?;

        if !self.store.add(LOCK_KEY, &encoded, marker.expires_at, now)? {
            let held_by = self.current()?.map(|m| m.kind).unwrap_or(kind);
            tracing::warn!(
                operation = %kind,
                held_by = %held_by,
                "Lock acquisition failed - operation already in progress"
            );
            return Err(SnapshotError::Busy { held_by });
        }

        tracing::info!(operation = %kind, ttl_seconds = ttl.num_seconds(), "Lock acquired");
        Ok(LockHandle {
            manager: self.clone(),
            kind,
            owner: marker.owner,
            released: false,
        })
    }

    /// Live marker, if any.
    pub fn current(&self) -> Result<Option<LockMarker>> {
        let raw = self.store.get(LOCK_KEY, self.clock.now())?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub fn is_locked(&self, kind: OperationKind) -> Result<bool> {
        Ok(self.current()?.is_some_and(|m| m.kind == kind))
    }

    /// Administrative override. Clears the marker held by `kind` without
    /// checking whether the holder is still running.
    pub fn force_release(&self, kind: OperationKind) -> Result<bool> {
        let cleared = match self.current()? {
            Some(marker) if marker.kind == kind => self.store.delete(LOCK_KEY)?,
            _ => false,
        };
        tracing::warn!(operation = %kind, cleared, "Lock force-released");
        Ok(cleared)
    }

    fn release_owned(&self, kind: OperationKind, owner: Uuid) -> Result<()> {
        match self.current()? {
            Some(marker) if marker.owner == owner => {
                self.store.delete(LOCK_KEY)?;
                tracing::info!(operation = %kind, "Lock released");
            }
            _ => {
                tracing::warn!(operation = %kind, "Lock already expired or cleared before release");
            }
        }
        Ok(())
    }
}

/// Held lock. Released explicitly with [`LockHandle::release`] or on drop.
pub struct LockHandle {
    manager: LockManager,
    kind: OperationKind,
    owner: Uuid,
    released: bool,
}

impl LockHandle {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release_owned(self.kind, self.owner)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release_owned(self.kind, self.owner) {
            tracing::error!(operation = %self.kind, error = %e, "Failed to release lock");
        }
    }
}
