//! Registry of paths in use by the gadget or the writer
//!
//! A `Claim` is an RAII guard: dropping it releases the entry. Paths are
//! compared after canonicalization, so `/dev/disk/by-id/...` and the node it
//! points to are the same resource.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// How a path is being used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimRole {
    /// Backing file of the mass-storage LUN
    Backing,
    /// Image being read by the writer
    WriteSource,
    /// Device being written
    WriteTarget,
}

impl ClaimRole {
    /// Whether a new claim in this role may coexist with `existing`
    ///
    /// Only reading an image that is also exposed to the host is allowed.
    pub fn compatible_with(self, existing: ClaimRole) -> bool {
        matches!((self, existing), (ClaimRole::WriteSource, ClaimRole::Backing))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{} is in use as {existing:?}", path.display())]
pub struct ClaimConflict {
    pub path: PathBuf,
    pub existing: ClaimRole,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    path: PathBuf,
    role: ClaimRole,
}

#[derive(Debug, Default)]
struct Registry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

/// Shared claim registry
#[derive(Debug, Clone, Default)]
pub struct ResourceClaims {
    inner: Arc<Registry>,
}

impl ResourceClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` in `role`, failing if an incompatible claim exists
    pub fn claim(&self, path: &Path, role: ClaimRole) -> Result<Claim, ClaimConflict> {
        let key = canonical(path);
        let mut entries = self.inner.entries.lock();

        if let Some(existing) = entries
            .iter()
            .find(|e| e.path == key && !role.compatible_with(e.role))
        {
            return Err(ClaimConflict {
                path: key,
                existing: existing.role,
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(Entry {
            id,
            path: key.clone(),
            role,
        });
        trace!("Claimed {} as {:?}", key.display(), role);

        Ok(Claim {
            id,
            path: key,
            role,
            registry: self.inner.clone(),
        })
    }

    /// Roles currently held on `path`
    pub fn holders(&self, path: &Path) -> Vec<ClaimRole> {
        let key = canonical(path);
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|e| e.path == key)
            .map(|e| e.role)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}

/// Held claim; released on drop
#[derive(Debug)]
pub struct Claim {
    id: u64,
    path: PathBuf,
    role: ClaimRole,
    registry: Arc<Registry>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.registry.entries.lock().retain(|e| e.id != self.id);
        trace!("Released {} ({:?})", self.path.display(), self.role);
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
