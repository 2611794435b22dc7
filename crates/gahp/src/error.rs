use std::{io, path::PathBuf, process::ExitStatus, time::Duration};

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Per-command failures (a helper replying `F` to a request) are not errors;
/// they come back through [`crate::GahpReply`] and
/// [`crate::GahpClient::last_error`]. This enum covers the transport and
/// protocol layer, where most variants mean the helper process itself can no
/// longer be trusted.
#[derive(Debug, Error)]
pub enum GahpError {
    #[error("helper binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The helper died or misbehaved before finishing its startup handshake.
    /// Recoverable: a later `startup(force)` may spawn a fresh process.
    #[error("helper startup failed: {reason}")]
    StartupFailed { reason: String },
    #[error("helper was not started")]
    NotStarted,
    #[error("helper does not support command `{verb}`")]
    UnsupportedCommand { verb: String },
    #[error("failed to write to helper stdin: {source}")]
    WriteFailed {
        #[source]
        source: io::Error,
    },
    #[error("failed to read from helper stdout: {source}")]
    ReadFailed {
        #[source]
        source: io::Error,
    },
    /// No byte arrived within the response timeout. Distinct from a
    /// per-command timeout: the transport itself is stuck.
    #[error("no response from helper within {timeout:?}")]
    UnresponsiveHelper { timeout: Duration },
    #[error("helper process exited unexpectedly (status: {status:?})")]
    HelperExited { status: Option<ExitStatus> },
    #[error("helper protocol violation in {context}: `{line}`")]
    ProtocolViolation { context: &'static str, line: String },
    #[error("helper rejected credential command {command}: {reason}")]
    CredentialRejected {
        command: &'static str,
        reason: String,
    },
    #[error("request id space exhausted")]
    RequestIdsExhausted,
    /// A previous fatal error already tore this helper down; the stored
    /// reason is replayed for every later call.
    #[error("helper is defunct: {reason}")]
    Defunct { reason: String },
}

impl GahpError {
    /// True for errors after which the helper's pipes and in-flight state can
    /// no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GahpError::WriteFailed { .. }
                | GahpError::ReadFailed { .. }
                | GahpError::UnresponsiveHelper { .. }
                | GahpError::HelperExited { .. }
                | GahpError::ProtocolViolation { .. }
                | GahpError::CredentialRejected { .. }
                | GahpError::RequestIdsExhausted
        )
    }
}
