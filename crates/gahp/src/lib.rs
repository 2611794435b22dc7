//! Async engine for driving GAHP grid helper processes over stdio pipes.
//!
//! A GAHP helper is an external binary that performs remote grid operations
//! on behalf of a daemon, speaking a line-oriented escaped-text protocol on
//! stdin/stdout. This crate owns the helper process end to end: spawn and
//! handshake, request multiplexing with admission control and priority
//! queues, batched `RESULTS` polling, delegated-credential caching, and a
//! registry that shares one helper between many sessions.
//!
//! ```rust,no_run
//! use gahp::{CredentialChoice, GahpConfig, GahpRegistry, Priority};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = GahpRegistry::new(GahpConfig::builder().build());
//! let mut session = registry
//!     .client("batch/alice", "/usr/libexec/batch_gahp", &[])
//!     .await;
//! session.startup().await?;
//! session.initialize(None).await?;
//!
//! session
//!     .submit(
//!         "CONDOR_JOB_STATUS",
//!         &["cluster.proc"],
//!         Priority::Medium,
//!         CredentialChoice::NoCredential,
//!     )
//!     .await?;
//! // Later, e.g. on the next scheduler tick:
//! let progress = session.poll_result().await?;
//! println!("{progress:?}");
//! # Ok(()) }
//! ```
//!
//! Sessions are cheap: each caller (typically one per managed job) holds its
//! own [`GahpClient`] with at most one outstanding command, while the
//! registry multiplexes them all onto a shared helper. Submitting the same
//! verb again while it is pending is a no-op, so callers may safely re-issue
//! their current command every tick.
//!
//! The engine is fully asynchronous; [`GahpClientMode::Blocking`] is an
//! explicit opt-in wrapper that spins poll/sleep and is the only place a
//! caller's task blocks.

pub mod codec;
mod client;
mod config;
mod credentials;
mod error;
mod registry;
mod server;
mod transport;

pub use client::{CommandProgress, CommandSpec, GahpClient, GahpClientMode, SubmitOutcome};
pub use config::{GahpConfig, GahpConfigBuilder};
pub use credentials::{Credential, CredentialChoice};
pub use error::GahpError;
pub use registry::GahpRegistry;
pub use server::{GahpReply, Priority, NULL_FIELD};

#[cfg(test)]
mod tests;
