use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    sync::{mpsc, oneshot},
};

use crate::{
    client::GahpClient, codec, config::GahpConfig, server::GahpServer, transport::Transport,
};

const GREETING: &str = "$GahpVersion: 2.0.1 Mar 31 2026 fake-gahp $\r\n";

const DEFAULT_COMMANDS: &[&str] = &[
    "COMMANDS",
    "RESPONSE_PREFIX",
    "ASYNC_MODE_ON",
    "RESULTS",
    "INITIALIZE_FROM_FILE",
    "CACHE_PROXY_FROM_FILE",
    "UNCACHE_PROXY",
    "USE_CACHED_PROXY",
    "REFRESH_PROXY_FROM_FILE",
    "TEST_PING",
    "TEST_SUBMIT",
    "TEST_STATUS",
    "TEST_CANCEL",
    "TEST_OVER",
];

pub(super) enum Control {
    Complete {
        reqid: u32,
        fields: Vec<String>,
        notify: bool,
        done: oneshot::Sender<()>,
    },
    SendRaw {
        line: String,
        done: oneshot::Sender<()>,
    },
}

#[derive(Default)]
pub(super) struct HelperState {
    /// Every decoded line received, in order.
    pub(super) log: Vec<Vec<String>>,
    /// Requests acknowledged `S`, in dispatch order.
    pub(super) dispatched: Vec<(u32, String)>,
    /// Scripted non-default acks, consumed per verb in FIFO order.
    acks: HashMap<String, VecDeque<Vec<String>>>,
    /// Results queued for the next `RESULTS` fetch.
    results: VecDeque<Vec<String>>,
    prefix: bool,
}

/// An in-process helper speaking the wire protocol over a duplex pipe.
/// Scripted by the test through control messages and inspected through its
/// shared state.
#[derive(Clone)]
pub(super) struct FakeHelper {
    control: mpsc::UnboundedSender<Control>,
    state: Arc<StdMutex<HelperState>>,
}

impl FakeHelper {
    /// Queues a result line for the next `RESULTS` fetch.
    pub(super) async fn complete(&self, reqid: u32, fields: &[&str]) {
        self.push(reqid, fields, false).await;
    }

    /// Queues a result line and sends the async `R` marker.
    pub(super) async fn complete_notify(&self, reqid: u32, fields: &[&str]) {
        self.push(reqid, fields, true).await;
    }

    /// Writes raw bytes to the engine, bypassing the protocol.
    pub(super) async fn send_raw(&self, line: &str) {
        let (done, ack) = oneshot::channel();
        self.control
            .send(Control::SendRaw {
                line: line.to_string(),
                done,
            })
            .expect("helper task alive");
        ack.await.expect("helper task alive");
    }

    /// Slips the async marker into the middle of the next `RESULTS` batch;
    /// it is not counted in the batch header.
    pub(super) fn notify_in_batch(&self) {
        self.state
            .lock()
            .unwrap()
            .results
            .push_back(vec!["R".to_string()]);
    }

    /// Makes the next ack for `verb` be `fields` instead of a plain `S`.
    pub(super) fn script_ack(&self, verb: &str, fields: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .acks
            .entry(verb.to_string())
            .or_default()
            .push_back(fields.iter().map(|f| f.to_string()).collect());
    }

    pub(super) fn log(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().log.clone()
    }

    pub(super) fn dispatched(&self) -> Vec<(u32, String)> {
        self.state.lock().unwrap().dispatched.clone()
    }

    /// How many received lines start with `verb`.
    pub(super) fn calls(&self, verb: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(verb))
            .count()
    }

    /// The received lines starting with `verb`.
    pub(super) fn lines_with(&self, verb: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(verb))
            .cloned()
            .collect()
    }

    async fn push(&self, reqid: u32, fields: &[&str], notify: bool) {
        let (done, ack) = oneshot::channel();
        self.control
            .send(Control::Complete {
                reqid,
                fields: fields.iter().map(|f| f.to_string()).collect(),
                notify,
                done,
            })
            .expect("helper task alive");
        ack.await.expect("helper task alive");
    }
}

/// Spawns the fake helper task and returns the engine-side transport for it.
pub(super) fn fake_helper() -> (Transport, FakeHelper) {
    let (engine_side, helper_side) = tokio::io::duplex(64 * 1024);
    let (read_half, write_half) = tokio::io::split(engine_side);
    let transport = Transport::from_streams(read_half, write_half, Duration::from_secs(5));

    let (control, control_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StdMutex::new(HelperState::default()));
    tokio::spawn(run_helper(helper_side, control_rx, state.clone()));

    (transport, FakeHelper { control, state })
}

pub(super) fn test_config() -> GahpConfig {
    GahpConfig::builder()
        .response_timeout(Duration::from_secs(5))
        .blocking_poll_interval(Duration::from_millis(10))
        .build()
}

/// A server already past its startup handshake with a fresh fake helper.
pub(super) async fn started_server(config: &GahpConfig) -> (Arc<GahpServer>, FakeHelper) {
    let (transport, helper) = fake_helper();
    let server = GahpServer::new("fake", "/bin/false", Vec::new(), config.clone());
    server
        .startup_with_transport(transport)
        .await
        .expect("handshake");
    (server, helper)
}

pub(super) fn session(server: &Arc<GahpServer>, config: &GahpConfig) -> GahpClient {
    GahpClient::new(server.clone(), None, config)
}

async fn run_helper(
    io: DuplexStream,
    mut control: mpsc::UnboundedReceiver<Control>,
    state: Arc<StdMutex<HelperState>>,
) {
    let (mut read, mut write) = tokio::io::split(io);
    if write.write_all(GREETING.as_bytes()).await.is_err() {
        return;
    }

    let mut decoder = codec::Decoder::new();
    let mut buf = [0u8; 1];
    loop {
        tokio::select! {
            message = control.recv() => {
                let Some(message) = message else { break };
                match message {
                    Control::Complete { reqid, fields, notify, done } => {
                        let mut line = vec![reqid.to_string()];
                        line.extend(fields);
                        state.lock().unwrap().results.push_back(line);
                        if notify {
                            send_fields(&mut write, &state, &["R".to_string()]).await;
                        }
                        let _ = done.send(());
                    }
                    Control::SendRaw { line, done } => {
                        let _ = write.write_all(line.as_bytes()).await;
                        let _ = done.send(());
                    }
                }
            }
            n = read.read(&mut buf) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                if let Some(argv) = decoder.feed(buf[0]) {
                    handle_line(&mut write, &state, argv).await;
                }
            }
        }
    }
}

async fn handle_line(
    write: &mut (impl AsyncWrite + Unpin),
    state: &Arc<StdMutex<HelperState>>,
    argv: Vec<String>,
) {
    state.lock().unwrap().log.push(argv.clone());
    let verb = argv.first().cloned().unwrap_or_default();
    match verb.as_str() {
        "COMMANDS" => {
            let mut fields = vec!["S".to_string()];
            fields.extend(DEFAULT_COMMANDS.iter().map(|c| c.to_string()));
            send_fields(write, state, &fields).await;
        }
        "RESPONSE_PREFIX" => {
            send_fields(write, state, &["S".to_string()]).await;
            state.lock().unwrap().prefix = true;
        }
        "ASYNC_MODE_ON"
        | "INITIALIZE_FROM_FILE"
        | "CACHE_PROXY_FROM_FILE"
        | "UNCACHE_PROXY"
        | "USE_CACHED_PROXY"
        | "REFRESH_PROXY_FROM_FILE" => {
            send_fields(write, state, &["S".to_string()]).await;
        }
        "RESULTS" => {
            let results: Vec<Vec<String>> = {
                let mut state = state.lock().unwrap();
                state.results.drain(..).collect()
            };
            let count = results
                .iter()
                .filter(|r| !(r.len() == 1 && r[0] == "R"))
                .count();
            send_fields(write, state, &["S".to_string(), count.to_string()]).await;
            for result in results {
                send_fields(write, state, &result).await;
            }
        }
        _ => {
            let reqid = argv.get(1).and_then(|f| f.parse::<u32>().ok());
            let scripted = state
                .lock()
                .unwrap()
                .acks
                .get_mut(&verb)
                .and_then(|queue| queue.pop_front());
            match (reqid, scripted) {
                (_, Some(fields)) => send_fields(write, state, &fields).await,
                (Some(reqid), None) => {
                    state.lock().unwrap().dispatched.push((reqid, verb));
                    send_fields(write, state, &["S".to_string()]).await;
                }
                (None, None) => {
                    send_fields(
                        write,
                        state,
                        &["F".to_string(), "unknown command".to_string()],
                    )
                    .await;
                }
            }
        }
    }
}

async fn send_fields(
    write: &mut (impl AsyncWrite + Unpin),
    state: &Arc<StdMutex<HelperState>>,
    fields: &[String],
) {
    let prefixed = state.lock().unwrap().prefix;
    let mut line = fields
        .iter()
        .map(|f| codec::escape(f))
        .collect::<Vec<_>>()
        .join(" ");
    if prefixed {
        line = format!("GAHP:{line}");
    }
    line.push_str("\r\n");
    let _ = write.write_all(line.as_bytes()).await;
}
