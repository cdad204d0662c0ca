//! Process-wide exclusive claims on device paths
//!
//! Opening a path registers it here; the returned guard releases it on
//! drop. A second open of a claimed path fails with [`Error::Busy`]
//! instead of interleaving two command streams on one authenticator.

use crate::error::{Error, Result};

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

static CLAIMED: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

fn claimed() -> MutexGuard<'static, BTreeSet<String>> {
    CLAIMED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive claim on one device path
#[derive(Debug)]
pub struct PathClaim {
    path: String,
}

impl PathClaim {
    /// Claim `path`, failing if another handle holds it
    pub fn acquire(path: &str) -> Result<Self> {
        if !claimed().insert(path.to_string()) {
            return Err(Error::Busy(path.to_string()));
        }
        tracing::trace!(path, "claimed device path");
        Ok(Self {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// True if some handle in this process currently claims `path`
    pub fn is_claimed(path: &str) -> bool {
        claimed().contains(path)
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        claimed().remove(&self.path);
        tracing::trace!(path = %self.path, "released device path");
    }
}
