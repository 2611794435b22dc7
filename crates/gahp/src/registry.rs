//! Registry of helper processes keyed by identity.
//!
//! Many sessions (one per job, typically) share one helper process. The
//! registry hands out sessions against a refcounted server entry; when the
//! last session is dropped, the helper lingers for a grace period before
//! teardown so bursts of short-lived sessions do not thrash process spawns.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};

use tokio::time;
use tracing::{debug, info};

use crate::{client::GahpClient, config::GahpConfig, server::GahpServer};

/// Owns every helper process the engine talks to. An explicit object rather
/// than process-global state, so independent engine instances (and tests)
/// never share helpers.
pub struct GahpRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    config: GahpConfig,
    servers: StdMutex<HashMap<String, ServerEntry>>,
}

struct ServerEntry {
    server: Arc<GahpServer>,
    refs: usize,
}

impl GahpRegistry {
    pub fn new(config: GahpConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                servers: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Checks out a session against the helper with this identity, creating
    /// (or replacing a defunct) server entry as needed. The caller still has
    /// to run `startup`/`initialize` on the session; those are idempotent
    /// across sessions sharing the helper.
    ///
    /// `identity` distinguishes helpers that must not share a process even
    /// when the binary is the same (e.g. per-user or per-remote-host).
    pub async fn client(
        &self,
        identity: &str,
        binary: impl Into<PathBuf>,
        args: &[&str],
    ) -> GahpClient {
        let server = self
            .inner
            .checkout(identity, binary.into(), args.iter().map(|a| a.to_string()).collect())
            .await;
        GahpClient::new(server, Some(self.inner.clone()), &self.inner.config)
    }

    /// Number of live helper entries, including those in their teardown
    /// grace period.
    pub fn server_count(&self) -> usize {
        self.inner
            .servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Tears down every helper immediately. Sessions still holding servers
    /// get transport errors afterwards.
    pub async fn shutdown(&self) {
        let entries: Vec<ServerEntry> = {
            let mut servers = self
                .inner
                .servers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            servers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.server.shutdown().await;
        }
    }
}

impl RegistryInner {
    async fn checkout(
        self: &Arc<Self>,
        identity: &str,
        binary: PathBuf,
        args: Vec<String>,
    ) -> Arc<GahpServer> {
        let existing = {
            let servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
            servers.get(identity).map(|entry| entry.server.clone())
        };
        // A defunct helper is useless to new sessions; replace it.
        let replace = match &existing {
            Some(server) => server.is_defunct().await,
            None => false,
        };

        let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
        if replace {
            if let Some(entry) = servers.remove(identity) {
                info!(identity, "replacing defunct helper");
                tokio::spawn(async move { entry.server.shutdown().await });
            }
        }
        let entry = servers.entry(identity.to_string()).or_insert_with(|| {
            info!(identity, binary = %binary.display(), "registering helper");
            let server = GahpServer::new(identity, binary, args, self.config.clone());
            server.spawn_timers();
            ServerEntry { server, refs: 0 }
        });
        entry.refs += 1;
        entry.server.clone()
    }

    /// Returns a session's reference. At zero references a grace timer is
    /// armed; the helper is torn down only if still unreferenced when it
    /// fires.
    pub(crate) fn checkin(self: &Arc<Self>, identity: &str) {
        let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = servers.get_mut(identity) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }

        let grace = self.config.teardown_grace;
        let registry = Arc::downgrade(self);
        let identity = identity.to_string();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime left (process teardown); kill_on_drop reaps the
            // child when the entry goes away.
            return;
        };
        handle.spawn(async move {
            time::sleep(grace).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let server = {
                let mut servers = registry.servers.lock().unwrap_or_else(|e| e.into_inner());
                match servers.get(&identity) {
                    Some(entry) if entry.refs == 0 => {
                        servers.remove(&identity).map(|entry| entry.server)
                    }
                    _ => None,
                }
            };
            if let Some(server) = server {
                debug!(identity, "tearing down unreferenced helper");
                server.shutdown().await;
            }
        });
    }
}
