//! Per-caller sessions over a shared helper.
//!
//! A [`GahpClient`] carries at most one outstanding command. Callers that
//! run off a scheduler tick can re-invoke the same logical call every tick;
//! [`GahpClient::submit`] recognizes the still-pending verb and turns the
//! duplicate into a no-op.

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::time;
use tracing::debug;

use crate::{
    credentials::{Credential, CredentialChoice},
    registry::RegistryInner,
    server::{GahpServer, Priority, SessionSlot, SlotState},
    GahpConfig, GahpError, GahpReply,
};

/// How a session waits for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GahpClientMode {
    /// Submit and return; results arrive on later `poll_result` calls.
    #[default]
    Normal,
    /// Never submit; only check for results of a command submitted by a
    /// previous incarnation of this session.
    ResultsOnly,
    /// `poll_result` spins (poll + sleep) until completion or timeout.
    Blocking,
}

/// Progress of the session's current command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandProgress {
    /// Submitted (or queued) and not yet completed.
    Pending,
    /// The per-session deadline passed; the request was abandoned.
    TimedOut,
    /// Nothing is in flight (results-only mode, or no submission yet).
    NotSubmitted,
    Completed(GahpReply),
}

/// Outcome of a `submit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// The same verb is already pending; the existing request stands.
    AlreadyPending,
    /// The session's mode forbids submission.
    NotSubmitted,
}

/// A backend command described as data: verb plus the expected reply shape.
/// Command wrappers are thin values of this type interpreted by
/// [`GahpClient::run`].
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub verb: &'static str,
    /// Expected number of reply fields including the status, or `None` when
    /// the reply is variable-length.
    pub result_arity: Option<usize>,
}

struct PendingCommand {
    verb: String,
    reqid: u32,
    slot: SessionSlot,
}

/// One logical caller's session with a helper process.
pub struct GahpClient {
    registry: Option<Arc<RegistryInner>>,
    server: Arc<GahpServer>,
    mode: GahpClientMode,
    timeout: Option<Duration>,
    blocking_poll_interval: Duration,
    pending: Option<PendingCommand>,
    last_error: Option<String>,
    normal_credential: Option<Arc<Credential>>,
    deleg_credential: Option<Arc<Credential>>,
}

impl GahpClient {
    pub(crate) fn new(
        server: Arc<GahpServer>,
        registry: Option<Arc<RegistryInner>>,
        config: &GahpConfig,
    ) -> Self {
        Self {
            registry,
            server,
            mode: GahpClientMode::default(),
            timeout: None,
            blocking_poll_interval: config.blocking_poll_interval,
            pending: None,
            last_error: None,
            normal_credential: None,
            deleg_credential: None,
        }
    }

    /// Spawns and handshakes the helper if that has not happened yet.
    pub async fn startup(&self) -> Result<(), GahpError> {
        self.server.startup(false).await
    }

    /// Force-restarts a helper that failed before initialization.
    pub async fn restart(&self) -> Result<(), GahpError> {
        self.server.startup(true).await
    }

    /// One-time initialization, optionally priming the helper with the
    /// master credential.
    pub async fn initialize(&self, master: Option<Arc<Credential>>) -> Result<(), GahpError> {
        self.server.initialize(master).await
    }

    pub fn mode(&self) -> GahpClientMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: GahpClientMode) {
        self.mode = mode;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Per-command deadline, measured from dispatch (time spent queued does
    /// not count). `None` disables the deadline.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Credential used when a command is submitted with
    /// [`CredentialChoice::Normal`].
    pub fn set_normal_credential(&mut self, credential: Option<Arc<Credential>>) {
        self.normal_credential = credential;
    }

    /// Credential used when a command is submitted with
    /// [`CredentialChoice::Delegation`].
    pub fn set_deleg_credential(&mut self, credential: Option<Arc<Credential>>) {
        self.deleg_credential = credential;
    }

    /// Whether a command with this verb is currently pending. Deliberately
    /// ignores arguments: a caller re-issuing its call each tick is asking
    /// about the logical command, and purges explicitly when the arguments
    /// genuinely change.
    pub fn is_pending(&self, verb: &str) -> bool {
        self.pending
            .as_ref()
            .map(|p| p.verb == verb)
            .unwrap_or(false)
    }

    /// Submits a command under the session's chosen credential slot.
    ///
    /// A submit of the verb already pending is a no-op. A different verb
    /// purges the old pending command first.
    pub async fn submit(
        &mut self,
        verb: &str,
        args: &[&str],
        priority: Priority,
        credential: CredentialChoice,
    ) -> Result<SubmitOutcome, GahpError> {
        if let Some(pending) = &self.pending {
            if pending.verb == verb {
                return Ok(SubmitOutcome::AlreadyPending);
            }
            debug!(
                old = pending.verb,
                new = verb,
                "purging pending command for new submission"
            );
            self.purge_pending().await;
        }
        if self.mode == GahpClientMode::ResultsOnly {
            return Ok(SubmitOutcome::NotSubmitted);
        }

        let credential = match credential {
            CredentialChoice::NoCredential => None,
            CredentialChoice::Normal => self.normal_credential.clone(),
            CredentialChoice::Delegation => self.deleg_credential.clone(),
        };
        let slot: SessionSlot = Arc::new(StdMutex::new(SlotState::default()));
        let reqid = self
            .server
            .submit(verb, args, priority, credential, slot.clone())
            .await?;
        self.pending = Some(PendingCommand {
            verb: verb.to_string(),
            reqid,
            slot,
        });
        self.last_error = None;
        Ok(SubmitOutcome::Submitted)
    }

    /// Checks the current command for completion. In blocking mode this
    /// spins (poll, sleep) until the command completes or times out; in the
    /// other modes it returns immediately.
    pub async fn poll_result(&mut self) -> Result<CommandProgress, GahpError> {
        let (verb, reqid, slot) = match &self.pending {
            None => return Ok(CommandProgress::NotSubmitted),
            Some(p) => (p.verb.clone(), p.reqid, p.slot.clone()),
        };
        self.server.poll_if_requested().await?;

        loop {
            let (result, dispatched_at) = {
                let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
                (state.result.take(), state.dispatched_at)
            };
            if let Some(reply) = result {
                self.pending = None;
                self.last_error = reply.error_text();
                return Ok(CommandProgress::Completed(reply));
            }
            if let (Some(timeout), Some(at)) = (self.timeout, dispatched_at) {
                if at.elapsed() >= timeout {
                    self.pending = None;
                    self.server.abandon(reqid).await;
                    self.last_error = Some(format!("{verb} timed out"));
                    return Ok(CommandProgress::TimedOut);
                }
            }
            if self.mode != GahpClientMode::Blocking {
                return Ok(CommandProgress::Pending);
            }
            time::sleep(self.blocking_poll_interval).await;
            self.server.poll().await?;
        }
    }

    /// Submit-and-check in one call: the generic routine command wrappers
    /// are built on. Validates the reply shape against `command`.
    pub async fn run(
        &mut self,
        command: &CommandSpec,
        args: &[&str],
        priority: Priority,
        credential: CredentialChoice,
    ) -> Result<CommandProgress, GahpError> {
        if self.submit(command.verb, args, priority, credential).await?
            == SubmitOutcome::NotSubmitted
            && self.pending.is_none()
        {
            return Ok(CommandProgress::NotSubmitted);
        }
        let progress = self.poll_result().await?;
        if let CommandProgress::Completed(reply) = &progress {
            if let Some(arity) = command.result_arity {
                if reply.fields().len() != arity {
                    return Err(self
                        .server
                        .report_violation("reply arity", reply.fields().join(" "))
                        .await);
                }
            }
        }
        Ok(progress)
    }

    /// Abandons the pending command, if any. Its request id stays reserved
    /// in the multiplexer until the helper's reply reconciles it.
    pub async fn purge_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.server.abandon(pending.reqid).await;
        }
    }

    /// Error text of the most recent failed or timed-out command, with
    /// embedded newlines escaped so it is safe in single-line records.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .as_ref()
            .map(|e| e.replace('\r', "\\r").replace('\n', "\\n"))
    }

    /// Registers a credential with the helper for use by this or other
    /// sessions. Balance with [`GahpClient::release_credential`].
    pub async fn register_credential(
        &self,
        credential: &Arc<Credential>,
    ) -> Result<(), GahpError> {
        self.server.register_credential(credential).await
    }

    pub async fn release_credential(
        &self,
        credential: &Arc<Credential>,
    ) -> Result<(), GahpError> {
        self.server.release_credential(credential).await
    }

    /// The helper's greeting banner, once started.
    pub async fn version(&self) -> Option<String> {
        self.server.version().await
    }

    /// Verbs the helper advertised during the handshake.
    pub async fn commands(&self) -> Vec<String> {
        self.server.commands().await
    }

    pub async fn supports(&self, verb: &str) -> bool {
        self.server.supports(verb).await
    }

    pub async fn is_started(&self) -> bool {
        self.server.is_started().await
    }

    pub async fn is_initialized(&self) -> bool {
        self.server.is_initialized().await
    }
}

impl Drop for GahpClient {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            let server = self.server.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    server.abandon(pending.reqid).await;
                });
            }
        }
        if let Some(registry) = self.registry.take() {
            registry.checkin(self.server.identity());
        }
    }
}
