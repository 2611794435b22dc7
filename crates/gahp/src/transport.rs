//! Process transport: the helper subprocess and its three pipes.

use std::{
    collections::VecDeque,
    io,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
    time,
};
use tracing::{debug, trace, warn};

use crate::{codec::Decoder, GahpError};

/// How many recent stderr lines to keep for diagnostics.
const STDERR_RING_CAPACITY: usize = 64;
/// Longest greeting banner we are willing to scan for.
const MAX_GREETING_LEN: usize = 256;

pub(crate) struct Transport {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    child: Option<Child>,
    pid: Option<u32>,
    stderr_rx: Option<mpsc::UnboundedReceiver<String>>,
    stderr_ring: VecDeque<String>,
    response_timeout: Duration,
}

impl Transport {
    /// Spawns the helper with scrubbed environment and piped stdio.
    pub(crate) fn spawn(
        binary: &Path,
        args: &[String],
        env: &[(String, String)],
        response_timeout: Duration,
    ) -> Result<Self, GahpError> {
        let mut command = Command::new(binary);
        command
            .args(args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = spawn_with_retry(&mut command, binary)?;
        let pid = child.id();
        debug!(binary = %binary.display(), pid, "spawned helper");

        let stdin = child.stdin.take().ok_or_else(|| GahpError::Spawn {
            binary: binary.to_path_buf(),
            source: io::Error::other("helper stdin unavailable"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GahpError::Spawn {
            binary: binary.to_path_buf(),
            source: io::Error::other("helper stdout unavailable"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| GahpError::Spawn {
            binary: binary.to_path_buf(),
            source: io::Error::other("helper stderr unavailable"),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(capture_stderr(stderr, tx, pid));

        Ok(Self {
            writer: Box::new(stdin),
            reader: BufReader::new(Box::new(stdout)),
            child: Some(child),
            pid,
            stderr_rx: Some(rx),
            stderr_ring: VecDeque::new(),
            response_timeout,
        })
    }

    /// Wires the transport over arbitrary streams instead of a child
    /// process. Used by in-process helpers in tests.
    pub(crate) fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        response_timeout: Duration,
    ) -> Self {
        Self {
            writer: Box::new(writer),
            reader: BufReader::new(Box::new(reader)),
            child: None,
            pid: None,
            stderr_rx: None,
            stderr_ring: VecDeque::new(),
            response_timeout,
        }
    }

    /// Writes one fully-encoded line. A short or failed write is fatal.
    pub(crate) async fn write_line(&mut self, line: &str) -> Result<(), GahpError> {
        trace!(pid = self.pid, line = line.trim_end(), "helper <-");
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|source| GahpError::WriteFailed { source })?;
        self.writer
            .flush()
            .await
            .map_err(|source| GahpError::WriteFailed { source })
    }

    /// Reads bytes into `decoder` until it yields one complete argument
    /// vector. Drains pending stderr first so a helper blocked writing
    /// diagnostics cannot deadlock against us.
    pub(crate) async fn read_argv(
        &mut self,
        decoder: &mut Decoder,
    ) -> Result<Vec<String>, GahpError> {
        self.drain_stderr();
        loop {
            let byte = self.read_byte().await?;
            if let Some(argv) = decoder.feed(byte) {
                trace!(pid = self.pid, argv = ?argv, "helper ->");
                self.drain_stderr();
                return Ok(argv);
            }
        }
    }

    /// Reads the `$...$` version banner the helper prints on startup.
    /// Leading noise before the `$` is skipped; backslashes are dropped.
    pub(crate) async fn read_greeting(&mut self) -> Result<String, GahpError> {
        let mut banner: Vec<u8> = Vec::new();
        loop {
            let byte = self.read_byte().await?;
            if banner.is_empty() && byte != b'$' {
                continue;
            }
            match byte {
                b'\\' | b'\r' => continue,
                b'\n' => break,
                other => banner.push(other),
            }
            if banner.len() > MAX_GREETING_LEN {
                return Err(GahpError::ProtocolViolation {
                    context: "greeting",
                    line: String::from_utf8_lossy(&banner).into_owned(),
                });
            }
        }
        Ok(String::from_utf8_lossy(&banner).into_owned())
    }

    async fn read_byte(&mut self) -> Result<u8, GahpError> {
        match time::timeout(self.response_timeout, self.reader.read_u8()).await {
            Err(_) => Err(GahpError::UnresponsiveHelper {
                timeout: self.response_timeout,
            }),
            Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(GahpError::HelperExited {
                    status: self.try_exit_status(),
                })
            }
            Ok(Err(source)) => Err(GahpError::ReadFailed { source }),
            Ok(Ok(byte)) => Ok(byte),
        }
    }

    /// Bytes already buffered from the read pipe. A non-empty buffer right
    /// after a reply usually means a pending `R` marker.
    pub(crate) fn buffered_bytes(&self) -> usize {
        self.reader.buffer().len()
    }

    /// Non-blocking probe for unread bytes on the read pipe. The poll timer
    /// uses this to notice a results marker that arrived while the engine
    /// was idle, without committing to a blocking read.
    pub(crate) async fn readable(&mut self) -> Result<bool, GahpError> {
        if !self.reader.buffer().is_empty() {
            return Ok(true);
        }
        let got_bytes = match time::timeout(Duration::ZERO, self.reader.fill_buf()).await {
            Err(_) => return Ok(false),
            Ok(Err(source)) => return Err(GahpError::ReadFailed { source }),
            Ok(Ok(buf)) => !buf.is_empty(),
        };
        if got_bytes {
            Ok(true)
        } else {
            Err(GahpError::HelperExited {
                status: self.try_exit_status(),
            })
        }
    }

    pub(crate) fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    /// Moves captured stderr lines into the diagnostic ring, logging each.
    pub(crate) fn drain_stderr(&mut self) {
        let Some(rx) = self.stderr_rx.as_mut() else {
            return;
        };
        while let Ok(line) = rx.try_recv() {
            debug!(pid = self.pid, line, "helper stderr");
            if self.stderr_ring.len() == STDERR_RING_CAPACITY {
                self.stderr_ring.pop_front();
            }
            self.stderr_ring.push_back(line);
        }
    }

    /// The most recent stderr lines, oldest first.
    pub(crate) fn recent_stderr(&self) -> Vec<String> {
        self.stderr_ring.iter().cloned().collect()
    }

    /// Kills the child if it is still running.
    pub(crate) fn shutdown(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.start_kill() {
                warn!(pid = self.pid, %err, "failed to kill helper");
            }
        }
    }
}

async fn capture_stderr(
    stderr: impl AsyncRead + Unpin,
    tx: mpsc::UnboundedSender<String>,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(pid, %err, "error reading helper stderr");
                break;
            }
        }
    }
}

fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, GahpError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(GahpError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn_with_retry should return before exhausting retries")
}
