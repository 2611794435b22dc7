//! Request multiplexer: one `GahpServer` per helper process, shared by every
//! session talking to that helper.
//!
//! All mutable state sits behind a single `tokio::sync::Mutex`. Holding the
//! lock across a write/read exchange is what guarantees that no two commands
//! ever interleave on the helper's pipes; the helper itself is strictly
//! line-at-a-time.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::{Instant, SystemTime},
};

use tempfile::TempDir;
use tokio::{sync::Mutex, task::JoinHandle, time};
use tracing::{debug, error, info, warn};

use crate::{
    codec::{self, Decoder, LineClass},
    config::GahpConfig,
    credentials::{CachedCredential, Credential},
    transport::Transport,
    GahpError,
};

/// Prefix negotiated via `RESPONSE_PREFIX` so genuine replies can be told
/// apart from stray library output on the helper's stdout.
pub(crate) const RESPONSE_PREFIX: &str = "GAHP:";

/// Request ids wrap past this bound and are then collision-checked against
/// the live table before reuse.
const REQID_WRAP_BOUND: u32 = 990_000_000;

/// The fixed error text a helper sends when its worker pool is saturated.
/// A textual contract inherited from the protocol; see DESIGN.md.
const OVERLOAD_REPLY: &str = "Threads limit reached";

/// Placeholder for an absent field in reply lines.
pub const NULL_FIELD: &str = "NULL";

const SUCCESS: &str = "S";

/// Scheduling class for a submitted command when admission control has to
/// defer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// A completed command's reply: the fields after the request id, the first
/// of which is the `S`/`F` status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GahpReply {
    fields: Vec<String>,
}

impl GahpReply {
    pub(crate) fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_success(&self) -> bool {
        matches!(self.fields.first(), Some(f) if f == SUCCESS)
    }

    /// Error text of a failed reply: the non-`NULL` fields after the status,
    /// joined. `None` for successful replies.
    pub fn error_text(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        let text = self
            .fields
            .iter()
            .skip(1)
            .filter(|f| *f != NULL_FIELD)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        if text.is_empty() {
            Some("command failed".to_string())
        } else {
            Some(text)
        }
    }
}

/// Where a session's completed result lands. Shared between the session and
/// the server's correlation table; plain mutex, never held across awaits.
pub(crate) type SessionSlot = Arc<StdMutex<SlotState>>;

#[derive(Debug, Default)]
pub(crate) struct SlotState {
    pub(crate) result: Option<GahpReply>,
    /// Set when the request is actually written to the helper. Session
    /// timeouts are measured from here, not from submission.
    pub(crate) dispatched_at: Option<Instant>,
}

enum DispatchOutcome {
    Accepted,
    /// The helper reported overload; the request went back to the front of
    /// the high-priority queue.
    Requeued,
}

struct RequestEntry {
    verb: String,
    line: String,
    credential: Option<Arc<Credential>>,
    dispatched: bool,
    /// `None` marks an abandoned request: the id stays reserved until the
    /// helper's eventual reply reconciles it.
    slot: Option<SessionSlot>,
}

pub(crate) struct GahpServer {
    id: String,
    binary: PathBuf,
    args: Vec<String>,
    config: GahpConfig,
    inner: Mutex<ServerInner>,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
    sweep_task: StdMutex<Option<JoinHandle<()>>>,
}

struct ServerInner {
    transport: Option<Transport>,
    decoder: Decoder,
    prefix: Option<String>,
    version: Option<String>,
    commands: Vec<String>,
    started: bool,
    initialized: bool,
    /// Set on the first fatal error; replayed to every later caller.
    defunct: Option<String>,
    async_mode: bool,
    can_cache: bool,
    poll_requested: bool,
    /// True while draining a `RESULTS` batch, where leftover buffered bytes
    /// are just more batch lines rather than a glued-on marker.
    in_results: bool,
    next_reqid: u32,
    reqid_wrap_bound: u32,
    rotated: bool,
    table: HashMap<u32, RequestEntry>,
    queues: [VecDeque<u32>; 3],
    max_pending: usize,
    num_pending: usize,
    scratch: Option<TempDir>,
    cache: HashMap<PathBuf, CachedCredential>,
    master: Option<Arc<Credential>>,
    master_id: Option<u32>,
    /// Expiration as last pushed via `REFRESH_PROXY_FROM_FILE` when the
    /// helper cannot cache credentials.
    master_uploaded: Option<SystemTime>,
    /// Credential the helper currently has active, by cache id.
    current: Option<u32>,
    next_credential_id: u32,
}

impl ServerInner {
    fn new(config: &GahpConfig) -> Self {
        Self {
            transport: None,
            decoder: Decoder::new(),
            prefix: None,
            version: None,
            commands: Vec::new(),
            started: false,
            initialized: false,
            defunct: None,
            async_mode: false,
            can_cache: false,
            poll_requested: false,
            in_results: false,
            next_reqid: 1,
            reqid_wrap_bound: REQID_WRAP_BOUND,
            rotated: false,
            table: HashMap::new(),
            queues: Default::default(),
            max_pending: config.max_pending_requests,
            num_pending: 0,
            scratch: None,
            cache: HashMap::new(),
            master: None,
            master_id: None,
            master_uploaded: None,
            current: None,
            next_credential_id: 1,
        }
    }

    fn check_live(&self) -> Result<(), GahpError> {
        if let Some(reason) = &self.defunct {
            return Err(GahpError::Defunct {
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    fn require_started(&self) -> Result<(), GahpError> {
        if self.started {
            Ok(())
        } else {
            Err(GahpError::NotStarted)
        }
    }

    fn supports(&self, verb: &str) -> bool {
        self.commands.iter().any(|c| c.eq_ignore_ascii_case(verb))
    }

    fn buffered(&self) -> bool {
        self.transport
            .as_ref()
            .map(|t| t.buffered_bytes() > 0)
            .unwrap_or(false)
    }

    /// Allocates the next request id. Collision checks against the live
    /// table only kick in after the counter has wrapped once.
    fn next_request_id(&mut self) -> Result<u32, GahpError> {
        let start = self.next_reqid;
        loop {
            let candidate = self.next_reqid;
            self.next_reqid = if candidate >= self.reqid_wrap_bound {
                self.rotated = true;
                1
            } else {
                candidate + 1
            };
            if !self.rotated || !self.table.contains_key(&candidate) {
                return Ok(candidate);
            }
            if self.next_reqid == start {
                return Err(GahpError::RequestIdsExhausted);
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), GahpError> {
        match self.transport.as_mut() {
            Some(t) => t.write_line(line).await,
            None => Err(GahpError::NotStarted),
        }
    }

    /// Reads lines until one classifies as a genuine reply. `R` markers set
    /// the poll-requested flag; noise is logged and dropped.
    async fn read_reply(&mut self) -> Result<Vec<String>, GahpError> {
        loop {
            let argv = match self.transport.as_mut() {
                Some(t) => t.read_argv(&mut self.decoder).await?,
                None => return Err(GahpError::NotStarted),
            };
            match codec::classify(argv, self.prefix.as_deref()) {
                LineClass::Reply(argv) => {
                    // A marker glued behind the reply is picked up lazily.
                    if !self.in_results && self.buffered() {
                        self.poll_requested = true;
                    }
                    return Ok(argv);
                }
                LineClass::ResultsReady => {
                    // Always latched, even mid-batch: the marker announces
                    // results beyond the batch currently being drained.
                    // poll_locked clears the flag, so this coalesces at
                    // worst into one extra empty RESULTS exchange.
                    self.poll_requested = true;
                }
                LineClass::Noise => {
                    debug!("discarding unprefixed helper output");
                }
            }
        }
    }

    async fn exchange(&mut self, line: &str) -> Result<Vec<String>, GahpError> {
        self.write_line(line).await?;
        self.read_reply().await
    }

    /// Sends a credential-management command; any non-`S` ack is fatal
    /// because the helper's active-credential state is now unknown.
    async fn cred_exchange(
        &mut self,
        command: &'static str,
        line: &str,
    ) -> Result<(), GahpError> {
        let reply = self.exchange(line).await?;
        if reply.first().map(String::as_str) == Some(SUCCESS) {
            Ok(())
        } else {
            Err(GahpError::CredentialRejected {
                command,
                reason: reply.join(" "),
            })
        }
    }

    /// Uploads `credential` to the helper's cache if it is missing or its
    /// live expiration has advanced past the cached value. Returns its
    /// cache id.
    async fn upload_credential(
        &mut self,
        credential: &Arc<Credential>,
    ) -> Result<u32, GahpError> {
        let key = credential.path().to_path_buf();
        let existing = self
            .cache
            .get(&key)
            .map(|entry| (entry.id, entry.is_stale()));
        let path = credential.path().to_string_lossy().into_owned();
        let expiration = credential.expiration();
        match existing {
            Some((id, false)) => Ok(id),
            Some((id, true)) => {
                debug!(id, path, "re-uploading stale credential");
                let line =
                    codec::request_line("CACHE_PROXY_FROM_FILE", None, &[&id.to_string(), &path]);
                self.cred_exchange("CACHE_PROXY_FROM_FILE", &line).await?;
                if let Some(entry) = self.cache.get_mut(&key) {
                    entry.cached_expiration = expiration;
                }
                Ok(id)
            }
            None => {
                let id = self.next_credential_id;
                self.next_credential_id += 1;
                debug!(id, path, "uploading credential");
                let line =
                    codec::request_line("CACHE_PROXY_FROM_FILE", None, &[&id.to_string(), &path]);
                self.cred_exchange("CACHE_PROXY_FROM_FILE", &line).await?;
                self.cache.insert(
                    key,
                    CachedCredential {
                        id,
                        credential: credential.clone(),
                        cached_expiration: expiration,
                        refs: 0,
                    },
                );
                Ok(id)
            }
        }
    }

    /// Makes sure the helper's active credential matches what the next
    /// command needs, falling back to the master when none is given.
    async fn ensure_active_credential(
        &mut self,
        credential: Option<&Arc<Credential>>,
    ) -> Result<(), GahpError> {
        let Some(master) = self.master.clone() else {
            return Ok(());
        };
        let target = credential.cloned().unwrap_or(master.clone());

        if !self.can_cache {
            if target.path() != master.path() {
                return Err(GahpError::CredentialRejected {
                    command: "USE_CACHED_PROXY",
                    reason: "helper does not support credential caching".to_string(),
                });
            }
            let live = master.expiration();
            let stale = self.master_uploaded.map(|u| live > u).unwrap_or(true);
            if stale && self.supports("REFRESH_PROXY_FROM_FILE") {
                let path = master.path().to_string_lossy().into_owned();
                let line = codec::request_line("REFRESH_PROXY_FROM_FILE", None, &[&path]);
                self.cred_exchange("REFRESH_PROXY_FROM_FILE", &line).await?;
                self.master_uploaded = Some(live);
            }
            return Ok(());
        }

        let id = self.upload_credential(&target).await?;
        if self.current != Some(id) {
            let line = codec::request_line("USE_CACHED_PROXY", None, &[&id.to_string()]);
            self.cred_exchange("USE_CACHED_PROXY", &line).await?;
            self.current = Some(id);
        }
        Ok(())
    }

    /// Routes one buffered result line to its slot, or reconciles an
    /// abandoned id.
    fn deliver(&mut self, mut argv: Vec<String>) {
        let reqid = match argv.first().and_then(|f| f.parse::<u32>().ok()) {
            Some(id) => id,
            None => {
                warn!(line = argv.join(" "), "malformed result line");
                return;
            }
        };
        match self.table.remove(&reqid) {
            None => warn!(reqid, "result for unknown request id"),
            Some(entry) => {
                if entry.dispatched {
                    self.num_pending = self.num_pending.saturating_sub(1);
                }
                let fields = argv.split_off(1);
                match entry.slot {
                    None => {
                        debug!(reqid, verb = entry.verb, "late result for abandoned request");
                    }
                    Some(slot) => {
                        let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
                        state.result = Some(GahpReply::new(fields));
                    }
                }
            }
        }
    }
}

impl GahpServer {
    pub(crate) fn new(
        id: impl Into<String>,
        binary: impl Into<PathBuf>,
        args: Vec<String>,
        config: GahpConfig,
    ) -> Arc<Self> {
        let inner = ServerInner::new(&config);
        Arc::new(Self {
            id: id.into(),
            binary: binary.into(),
            args,
            config,
            inner: Mutex::new(inner),
            poll_task: StdMutex::new(None),
            sweep_task: StdMutex::new(None),
        })
    }

    pub(crate) fn identity(&self) -> &str {
        &self.id
    }

    /// Spawns the helper and runs the startup handshake. Idempotent unless
    /// `force` is set; `force` also retries a helper that died before
    /// finishing initialization.
    pub(crate) async fn startup(&self, force: bool) -> Result<(), GahpError> {
        let mut inner = self.inner.lock().await;
        if inner.defunct.is_some() {
            if inner.initialized || !force {
                return inner.check_live();
            }
        } else if inner.started && !force {
            return Ok(());
        }

        *inner = ServerInner::new(&self.config);
        let transport = self.spawn_transport(&mut inner)?;
        match self.handshake(&mut inner, transport).await {
            Ok(()) => {
                inner.started = true;
                info!(
                    server = %self.id,
                    version = inner.version.as_deref().unwrap_or(""),
                    commands = inner.commands.len(),
                    async_mode = inner.async_mode,
                    can_cache = inner.can_cache,
                    "helper handshake complete"
                );
                Ok(())
            }
            Err(err @ GahpError::Spawn { .. }) => Err(err),
            Err(err) => {
                // Pre-initialization failures are soft: drop the half-born
                // process and let the caller retry with force.
                inner.transport = None;
                Err(GahpError::StartupFailed {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Runs the startup handshake over an externally-provided transport.
    /// Test seam; production code goes through [`GahpServer::startup`].
    pub(crate) async fn startup_with_transport(
        &self,
        transport: Transport,
    ) -> Result<(), GahpError> {
        let mut inner = self.inner.lock().await;
        *inner = ServerInner::new(&self.config);
        self.handshake(&mut inner, transport).await?;
        inner.started = true;
        Ok(())
    }

    fn spawn_transport(&self, inner: &mut ServerInner) -> Result<Transport, GahpError> {
        let scratch_path = match &self.config.scratch_dir {
            Some(dir) => dir.clone(),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("gahp-")
                    .tempdir()
                    .map_err(|err| GahpError::StartupFailed {
                        reason: format!("could not create scratch directory: {err}"),
                    })?;
                let path = dir.path().to_path_buf();
                inner.scratch = Some(dir);
                path
            }
        };

        let mut env: Vec<(String, String)> = Vec::new();
        for name in &self.config.env_passthrough {
            if let Ok(value) = std::env::var(name) {
                env.push((name.clone(), value));
            }
        }
        for (key, value) in &self.config.extra_env {
            env.push((key.clone(), value.clone()));
        }
        env.push((
            "GAHP_TEMP".to_string(),
            scratch_path.to_string_lossy().into_owned(),
        ));

        Transport::spawn(&self.binary, &self.args, &env, self.config.response_timeout)
    }

    async fn handshake(
        &self,
        inner: &mut ServerInner,
        mut transport: Transport,
    ) -> Result<(), GahpError> {
        let banner = transport.read_greeting().await?;
        debug!(server = %self.id, banner, "helper greeting");
        inner.version = Some(banner);
        inner.transport = Some(transport);

        let reply = inner
            .exchange(&codec::request_line("COMMANDS", None, &[]))
            .await?;
        if reply.first().map(String::as_str) != Some(SUCCESS) {
            return Err(GahpError::ProtocolViolation {
                context: "COMMANDS",
                line: reply.join(" "),
            });
        }
        inner.commands = reply[1..].to_vec();

        if self.config.use_response_prefix && inner.supports("RESPONSE_PREFIX") {
            let line = codec::request_line("RESPONSE_PREFIX", None, &[RESPONSE_PREFIX]);
            let reply = inner.exchange(&line).await?;
            if reply.first().map(String::as_str) == Some(SUCCESS) {
                inner.prefix = Some(RESPONSE_PREFIX.to_string());
            }
        }

        if inner.supports("ASYNC_MODE_ON") {
            let line = codec::request_line("ASYNC_MODE_ON", None, &[]);
            let reply = inner.exchange(&line).await?;
            inner.async_mode = reply.first().map(String::as_str) == Some(SUCCESS);
        }

        inner.can_cache = inner.supports("CACHE_PROXY_FROM_FILE")
            && inner.supports("UNCACHE_PROXY")
            && inner.supports("USE_CACHED_PROXY");
        Ok(())
    }

    /// One-time post-startup initialization, optionally priming the helper
    /// with a master credential (the designated fallback).
    pub(crate) async fn initialize(
        &self,
        master: Option<Arc<Credential>>,
    ) -> Result<(), GahpError> {
        let mut inner = self.inner.lock().await;
        inner.check_live()?;
        inner.require_started()?;
        if inner.initialized {
            return Ok(());
        }
        let result = self.initialize_locked(&mut inner, master).await;
        self.note_fatal(&mut inner, result)
    }

    async fn initialize_locked(
        &self,
        inner: &mut ServerInner,
        master: Option<Arc<Credential>>,
    ) -> Result<(), GahpError> {
        if let Some(master) = master {
            if inner.supports("INITIALIZE_FROM_FILE") {
                let path = master.path().to_string_lossy().into_owned();
                let line = codec::request_line("INITIALIZE_FROM_FILE", None, &[&path]);
                inner.cred_exchange("INITIALIZE_FROM_FILE", &line).await?;
            }
            if inner.can_cache {
                let id = inner.upload_credential(&master).await?;
                if let Some(entry) = inner.cache.get_mut(master.path()) {
                    entry.refs += 1;
                }
                inner.master_id = Some(id);
                inner.current = Some(id);
            } else {
                inner.master_uploaded = Some(master.expiration());
            }
            inner.master = Some(master);
        }
        inner.initialized = true;
        Ok(())
    }

    /// Submits a command. Dispatches immediately when under capacity,
    /// otherwise queues the id by priority. Returns the request id.
    pub(crate) async fn submit(
        &self,
        verb: &str,
        args: &[&str],
        priority: Priority,
        credential: Option<Arc<Credential>>,
        slot: SessionSlot,
    ) -> Result<u32, GahpError> {
        let mut inner = self.inner.lock().await;
        inner.check_live()?;
        inner.require_started()?;
        if !inner.supports(verb) {
            return Err(GahpError::UnsupportedCommand {
                verb: verb.to_string(),
            });
        }
        let reqid = inner.next_request_id()?;
        let line = codec::request_line(verb, Some(reqid), args);
        inner.table.insert(
            reqid,
            RequestEntry {
                verb: verb.to_string(),
                line,
                credential,
                dispatched: false,
                slot: Some(slot),
            },
        );
        if inner.num_pending < inner.max_pending {
            let result = self.dispatch(&mut inner, reqid).await.map(|_| ());
            self.note_fatal(&mut inner, result)?;
        } else {
            let index = priority.index();
            inner.queues[index].push_back(reqid);
            debug!(server = %self.id, reqid, verb, "request queued, capacity exhausted");
        }
        Ok(reqid)
    }

    async fn dispatch(
        &self,
        inner: &mut ServerInner,
        reqid: u32,
    ) -> Result<DispatchOutcome, GahpError> {
        let (line, credential) = match inner.table.get(&reqid) {
            Some(entry) => (entry.line.clone(), entry.credential.clone()),
            None => return Ok(DispatchOutcome::Accepted),
        };
        inner.ensure_active_credential(credential.as_ref()).await?;
        inner.write_line(&line).await?;
        let ack = inner.read_reply().await?;

        if ack.first().map(String::as_str) == Some(SUCCESS) {
            if let Some(entry) = inner.table.get_mut(&reqid) {
                entry.dispatched = true;
                if let Some(slot) = &entry.slot {
                    let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
                    state.dispatched_at = Some(Instant::now());
                }
            }
            inner.num_pending += 1;
            return Ok(DispatchOutcome::Accepted);
        }

        if is_overload(&ack) {
            // The helper is saturated. Shrink to what it proved it can
            // handle and retry this request before anything else.
            inner.max_pending = inner.num_pending.max(1);
            inner.queues[Priority::High.index()].push_front(reqid);
            warn!(
                server = %self.id,
                reqid,
                max_pending = inner.max_pending,
                "helper overloaded, lowering request capacity"
            );
            return Ok(DispatchOutcome::Requeued);
        }

        Err(GahpError::ProtocolViolation {
            context: "request ack",
            line: ack.join(" "),
        })
    }

    /// Issues `RESULTS`, buffers the whole batch, routes each line, then
    /// promotes queued requests into freed capacity in priority order.
    pub(crate) async fn poll(&self) -> Result<(), GahpError> {
        let mut inner = self.inner.lock().await;
        inner.check_live()?;
        inner.require_started()?;
        let result = self.poll_locked(&mut inner).await;
        self.note_fatal(&mut inner, result)
    }

    /// Runs a poll only if one was requested by an `R` marker (or data is
    /// already buffered). Cheap to call opportunistically.
    pub(crate) async fn poll_if_requested(&self) -> Result<(), GahpError> {
        let mut inner = self.inner.lock().await;
        inner.check_live()?;
        if !inner.started || !(inner.poll_requested || inner.buffered()) {
            return Ok(());
        }
        let result = self.poll_locked(&mut inner).await;
        self.note_fatal(&mut inner, result)
    }

    async fn poll_locked(&self, inner: &mut ServerInner) -> Result<(), GahpError> {
        inner.poll_requested = false;
        inner
            .write_line(&codec::request_line("RESULTS", None, &[]))
            .await?;
        let header = inner.read_reply().await?;
        if header.first().map(String::as_str) != Some(SUCCESS) {
            return Err(GahpError::ProtocolViolation {
                context: "RESULTS header",
                line: header.join(" "),
            });
        }
        let count: usize = header
            .get(1)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| GahpError::ProtocolViolation {
                context: "RESULTS count",
                line: header.join(" "),
            })?;

        // Buffer the whole batch before touching any session state, so a
        // completion callback submitting a new request cannot observe a
        // half-processed batch.
        inner.in_results = true;
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            match inner.read_reply().await {
                Ok(argv) => batch.push(argv),
                Err(err) => {
                    inner.in_results = false;
                    return Err(err);
                }
            }
        }
        inner.in_results = false;
        if inner.buffered() {
            inner.poll_requested = true;
        }

        for argv in batch {
            inner.deliver(argv);
        }
        self.promote(inner).await
    }

    async fn promote(&self, inner: &mut ServerInner) -> Result<(), GahpError> {
        for priority in [Priority::High, Priority::Medium, Priority::Low] {
            loop {
                if inner.num_pending >= inner.max_pending {
                    return Ok(());
                }
                let Some(reqid) = inner.queues[priority.index()].pop_front() else {
                    break;
                };
                let abandoned = inner
                    .table
                    .get(&reqid)
                    .map(|e| e.slot.is_none())
                    .unwrap_or(true);
                if abandoned {
                    // Purged while queued; never dispatched, so the id can
                    // be freed right away.
                    inner.table.remove(&reqid);
                    debug!(server = %self.id, reqid, "dropping abandoned queued request");
                    continue;
                }
                match self.dispatch(inner, reqid).await? {
                    DispatchOutcome::Accepted => {}
                    DispatchOutcome::Requeued => return Ok(()),
                }
            }
        }
        Ok(())
    }

    /// Detaches a request from its session. A dispatched request's id stays
    /// reserved (sentinel) until the helper's reply arrives; a queued one is
    /// discarded when its turn comes.
    pub(crate) async fn abandon(&self, reqid: u32) {
        let mut inner = self.inner.lock().await;
        let dispatched = match inner.table.get_mut(&reqid) {
            None => return,
            Some(entry) => {
                let was = entry.dispatched;
                entry.dispatched = false;
                entry.slot = None;
                was
            }
        };
        if dispatched {
            inner.num_pending = inner.num_pending.saturating_sub(1);
        }
        debug!(server = %self.id, reqid, dispatched, "request abandoned");
    }

    /// Registers a credential for use by this helper, uploading it on first
    /// registration. No-op for helpers without cache support (they only ever
    /// use the master credential).
    pub(crate) async fn register_credential(
        &self,
        credential: &Arc<Credential>,
    ) -> Result<(), GahpError> {
        let mut inner = self.inner.lock().await;
        inner.check_live()?;
        inner.require_started()?;
        if !inner.can_cache {
            return Ok(());
        }
        let result = inner.upload_credential(credential).await;
        if result.is_ok() {
            if let Some(entry) = inner.cache.get_mut(credential.path()) {
                entry.refs += 1;
            }
        }
        self.note_fatal(&mut inner, result.map(|_| ()))
    }

    /// Drops one reference to a credential; the last release evicts it from
    /// the helper, switching the active credential to the master first when
    /// needed.
    pub(crate) async fn release_credential(
        &self,
        credential: &Arc<Credential>,
    ) -> Result<(), GahpError> {
        let mut inner = self.inner.lock().await;
        inner.check_live()?;
        if !inner.can_cache {
            return Ok(());
        }
        let result = self.release_locked(&mut inner, credential).await;
        self.note_fatal(&mut inner, result)
    }

    async fn release_locked(
        &self,
        inner: &mut ServerInner,
        credential: &Arc<Credential>,
    ) -> Result<(), GahpError> {
        let key = credential.path().to_path_buf();
        let (id, refs) = match inner.cache.get_mut(&key) {
            None => return Ok(()),
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                (entry.id, entry.refs)
            }
        };
        if refs > 0 || inner.master_id == Some(id) {
            return Ok(());
        }
        inner.cache.remove(&key);
        if inner.current == Some(id) {
            if let Some(master_id) = inner.master_id {
                let line = codec::request_line("USE_CACHED_PROXY", None, &[&master_id.to_string()]);
                inner.cred_exchange("USE_CACHED_PROXY", &line).await?;
                inner.current = Some(master_id);
            } else {
                inner.current = None;
            }
        }
        let line = codec::request_line("UNCACHE_PROXY", None, &[&id.to_string()]);
        inner.cred_exchange("UNCACHE_PROXY", &line).await?;
        debug!(server = %self.id, id, "credential evicted");
        Ok(())
    }

    /// Proactive refresh sweep: re-upload every cached credential whose live
    /// expiration has advanced, so long-idle credentials don't go stale in
    /// the helper.
    pub(crate) async fn refresh_credentials(&self) -> Result<(), GahpError> {
        let mut inner = self.inner.lock().await;
        inner.check_live()?;
        if !inner.started || !inner.initialized {
            return Ok(());
        }
        let result = self.refresh_locked(&mut inner).await;
        self.note_fatal(&mut inner, result)
    }

    async fn refresh_locked(&self, inner: &mut ServerInner) -> Result<(), GahpError> {
        if !inner.can_cache {
            let Some(master) = inner.master.clone() else {
                return Ok(());
            };
            let live = master.expiration();
            let stale = inner.master_uploaded.map(|u| live > u).unwrap_or(false);
            if stale && inner.supports("REFRESH_PROXY_FROM_FILE") {
                let path = master.path().to_string_lossy().into_owned();
                let line = codec::request_line("REFRESH_PROXY_FROM_FILE", None, &[&path]);
                inner.cred_exchange("REFRESH_PROXY_FROM_FILE", &line).await?;
                inner.master_uploaded = Some(live);
            }
            return Ok(());
        }
        let stale: Vec<Arc<Credential>> = inner
            .cache
            .values()
            .filter(|entry| entry.is_stale())
            .map(|entry| entry.credential.clone())
            .collect();
        for credential in stale {
            inner.upload_credential(&credential).await?;
        }
        Ok(())
    }

    /// Starts the background poll and credential-sweep timers. Idempotent.
    /// The tasks hold only a weak reference and exit when the server is
    /// dropped.
    pub(crate) fn spawn_timers(self: &Arc<Self>) {
        self.spawn_poll_timer();
        self.spawn_credential_sweep();
    }

    fn spawn_poll_timer(self: &Arc<Self>) {
        let mut guard = self.poll_task.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.poll_interval;
        let stretch = self.config.async_poll_stretch.max(1);
        *guard = Some(tokio::spawn(async move {
            let mut ticks: u32 = 0;
            loop {
                time::sleep(interval).await;
                let Some(server) = weak.upgrade() else { break };
                ticks = ticks.wrapping_add(1);
                if let Err(err) = server.timer_poll(ticks % stretch == 0).await {
                    debug!(server = %server.id, %err, "background poll failed");
                }
            }
        }));
    }

    fn spawn_credential_sweep(self: &Arc<Self>) {
        let mut guard = self.sweep_task.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.credential_check_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                time::sleep(interval).await;
                let Some(server) = weak.upgrade() else { break };
                if let Err(err) = server.refresh_credentials().await {
                    debug!(server = %server.id, %err, "credential sweep failed");
                }
            }
        }));
    }

    async fn timer_poll(&self, stretch_due: bool) -> Result<(), GahpError> {
        let mut inner = self.inner.lock().await;
        if !inner.started || inner.defunct.is_some() {
            return Ok(());
        }
        // With async notification the stretched full poll is only a safety
        // net against a lost marker; every tick still probes the pipe so a
        // marker that arrived while idle is serviced right away.
        let due = if inner.async_mode {
            match self.notification_due(&mut inner, stretch_due).await {
                Ok(due) => due,
                Err(err) => return self.note_fatal(&mut inner, Err(err)),
            }
        } else {
            true
        };
        if !due {
            return Ok(());
        }
        let result = self.poll_locked(&mut inner).await;
        self.note_fatal(&mut inner, result)
    }

    async fn notification_due(
        &self,
        inner: &mut ServerInner,
        stretch_due: bool,
    ) -> Result<bool, GahpError> {
        if inner.poll_requested || inner.buffered() || stretch_due {
            return Ok(true);
        }
        match inner.transport.as_mut() {
            Some(transport) => transport.readable().await,
            None => Ok(false),
        }
    }

    /// Marks the server defunct over a violation detected outside the
    /// multiplexer (e.g. a reply with the wrong shape for its command).
    pub(crate) async fn report_violation(
        &self,
        context: &'static str,
        line: String,
    ) -> GahpError {
        let mut inner = self.inner.lock().await;
        let err = GahpError::ProtocolViolation { context, line };
        let result: Result<(), GahpError> = Err(err);
        match self.note_fatal(&mut inner, result) {
            Err(err) => err,
            Ok(()) => GahpError::NotStarted,
        }
    }

    fn note_fatal<T>(
        &self,
        inner: &mut ServerInner,
        result: Result<T, GahpError>,
    ) -> Result<T, GahpError> {
        if let Err(err) = &result {
            if err.is_fatal() && inner.defunct.is_none() {
                error!(server = %self.id, %err, "fatal helper failure");
                for line in inner
                    .transport
                    .as_mut()
                    .map(|t| {
                        t.drain_stderr();
                        t.recent_stderr()
                    })
                    .unwrap_or_default()
                {
                    warn!(server = %self.id, line, "helper stderr before failure");
                }
                inner.defunct = Some(err.to_string());
                if let Some(mut transport) = inner.transport.take() {
                    transport.shutdown();
                }
            }
        }
        result
    }

    #[cfg(test)]
    pub(crate) async fn seed_request_ids(&self, next: u32, wrap_bound: u32) {
        let mut inner = self.inner.lock().await;
        inner.next_reqid = next;
        inner.reqid_wrap_bound = wrap_bound;
    }

    pub(crate) async fn version(&self) -> Option<String> {
        self.inner.lock().await.version.clone()
    }

    pub(crate) async fn commands(&self) -> Vec<String> {
        self.inner.lock().await.commands.clone()
    }

    pub(crate) async fn supports(&self, verb: &str) -> bool {
        self.inner.lock().await.supports(verb)
    }

    pub(crate) async fn is_started(&self) -> bool {
        self.inner.lock().await.started
    }

    pub(crate) async fn is_initialized(&self) -> bool {
        self.inner.lock().await.initialized
    }

    pub(crate) async fn is_defunct(&self) -> bool {
        self.inner.lock().await.defunct.is_some()
    }

    /// Aborts timers and kills the helper. Called by the registry at
    /// teardown.
    pub(crate) async fn shutdown(&self) {
        for task in [&self.poll_task, &self.sweep_task] {
            let handle = task.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        let mut inner = self.inner.lock().await;
        if let Some(mut transport) = inner.transport.take() {
            transport.shutdown();
        }
        inner.started = false;
    }
}

fn is_overload(ack: &[String]) -> bool {
    if ack.first().map(String::as_str) == Some(SUCCESS) {
        return false;
    }
    let tail = &ack[ack.len().min(1)..];
    tail.iter().any(|f| f == OVERLOAD_REPLY) || tail.join(" ") == OVERLOAD_REPLY
}
