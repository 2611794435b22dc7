//! Delegated credentials shared between the daemon and its helpers.
//!
//! A [`Credential`] is a handle to an on-disk delegated credential (a proxy
//! file) whose expiration advances over time as some external tracker
//! renews it. Helpers cache uploaded credentials by numeric id; the engine
//! re-uploads one only when its live expiration has moved past the value
//! recorded at the last upload.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

/// A delegated credential, shared by reference between sessions, the
/// multiplexer's cache, and whatever component renews the underlying file.
#[derive(Debug)]
pub struct Credential {
    path: PathBuf,
    expiration: Mutex<SystemTime>,
}

impl Credential {
    pub fn new(path: impl Into<PathBuf>, expiration: SystemTime) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            expiration: Mutex::new(expiration),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn expiration(&self) -> SystemTime {
        *self.expiration.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a renewed expiration. The next dispatch using this credential
    /// (or the next refresh sweep) re-uploads it to the helper.
    pub fn renew(&self, expiration: SystemTime) {
        *self.expiration.lock().unwrap_or_else(|e| e.into_inner()) = expiration;
    }
}

/// Which of a session's credential slots a command dispatches under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialChoice {
    /// No specific credential: keep whatever the helper has active, after a
    /// staleness check.
    #[default]
    NoCredential,
    /// The session's normal credential.
    Normal,
    /// The session's delegation credential.
    Delegation,
}

/// Cache bookkeeping for one credential uploaded to a helper.
#[derive(Debug)]
pub(crate) struct CachedCredential {
    pub(crate) id: u32,
    pub(crate) credential: Arc<Credential>,
    /// Expiration as of the last upload; a live expiration strictly past
    /// this triggers a re-upload.
    pub(crate) cached_expiration: SystemTime,
    pub(crate) refs: usize,
}

impl CachedCredential {
    pub(crate) fn is_stale(&self) -> bool {
        self.credential.expiration() > self.cached_expiration
    }
}
