//! Reconnecting async KV client.
//!
//! One spawned task owns each connection: it dials, authenticates, then
//! shuttles commands from an mpsc queue onto the wire and matches replies
//! FIFO against the pending commands. A disconnect completes every pending
//! command with a null reply exactly once; commands still sitting in the
//! queue survive the reconnect and are written afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

/// Depth of the per-connection command queue.
const COMMAND_QUEUE: usize = 1024;

const RECONNECT_MIN: Duration = Duration::from_millis(50);
const RECONNECT_MAX: Duration = Duration::from_secs(2);

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type KvFramed = Framed<Box<dyn AsyncStream>, Resp2>;

/// Where and how to reach one KV endpoint.
#[derive(Clone)]
pub struct KvTarget {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub tls: Option<Arc<ClientConfig>>,
}

impl KvTarget {
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection lifecycle. Reconnection resets the state to `Down` and walks
/// it forward again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Down,
    Connecting,
    Authenticating,
    Ready,
}

struct Command {
    args: Vec<String>,
    reply: Option<oneshot::Sender<Option<BytesFrame>>>,
}

/// Cheap handle to one connection task.
#[derive(Clone)]
pub struct KvClient {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnState>,
    label: String,
}

impl KvClient {
    /// Spawn the connection task. Every state transition pings
    /// `state_notify` so the fleet can re-aggregate health.
    pub fn spawn(target: KvTarget, state_notify: Arc<Notify>) -> KvClient {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnState::Down);
        let label = target.label();
        tokio::spawn(connection_loop(target, cmd_rx, state_tx, state_notify));
        KvClient {
            cmd_tx,
            state_rx,
            label,
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait until the connection is authenticated and usable.
    pub async fn ready(&self) {
        let mut rx = self.state_rx.clone();
        // Err here means the connection task is gone, i.e. process teardown.
        let _ = rx.wait_for(|s| *s == ConnState::Ready).await;
    }

    /// Send a command and await its reply. `None` is the null reply: the
    /// connection dropped before the command was acknowledged.
    pub async fn call(&self, args: Vec<String>) -> Option<BytesFrame> {
        let (tx, rx) = oneshot::channel();
        let cmd = Command {
            args,
            reply: Some(tx),
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Send and await, retrying through disconnects until the KV answers.
    pub async fn call_retry(&self, args: Vec<String>) -> BytesFrame {
        loop {
            self.ready().await;
            if let Some(reply) = self.call(args.clone()).await {
                return reply;
            }
        }
    }

    /// Fire-and-forget: the reply is consumed and dropped by the
    /// connection task.
    pub async fn send_nowait(&self, args: Vec<String>) {
        let _ = self.cmd_tx.send(Command { args, reply: None }).await;
    }
}

enum SessionEnd {
    ChannelClosed,
    Disconnected,
}

async fn connection_loop(
    target: KvTarget,
    mut cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnState>,
    state_notify: Arc<Notify>,
) {
    let label = target.label();
    let mut backoff = RECONNECT_MIN;
    loop {
        set_state(&state_tx, &state_notify, ConnState::Connecting);
        let mut framed = match open_framed(&target).await {
            Ok(framed) => framed,
            Err(err) => {
                tracing::warn!(endpoint = %label, error = %err, "kv connect failed");
                set_state(&state_tx, &state_notify, ConnState::Down);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
                continue;
            }
        };

        set_state(&state_tx, &state_notify, ConnState::Authenticating);
        if let Err(err) = handshake(&mut framed, &target).await {
            tracing::warn!(endpoint = %label, error = %err, "kv handshake failed");
            set_state(&state_tx, &state_notify, ConnState::Down);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
            continue;
        }

        backoff = RECONNECT_MIN;
        set_state(&state_tx, &state_notify, ConnState::Ready);
        tracing::debug!(endpoint = %label, "kv connection ready");

        match session(&mut framed, &mut cmd_rx, &label).await {
            SessionEnd::ChannelClosed => {
                set_state(&state_tx, &state_notify, ConnState::Down);
                return;
            }
            SessionEnd::Disconnected => {
                tracing::warn!(endpoint = %label, "kv connection lost; reconnecting");
                set_state(&state_tx, &state_notify, ConnState::Down);
            }
        }
    }
}

/// Pump commands out and replies in until the socket or the handle side
/// goes away. Completes every unacknowledged command with a null reply.
async fn session(
    framed: &mut KvFramed,
    cmd_rx: &mut mpsc::Receiver<Command>,
    label: &str,
) -> SessionEnd {
    let mut pending: VecDeque<Option<oneshot::Sender<Option<BytesFrame>>>> = VecDeque::new();
    let end = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command { args, reply }) => {
                    pending.push_back(reply);
                    if let Err(err) = framed.send(command_frame(&args)).await {
                        tracing::debug!(endpoint = %label, error = %err, "kv write failed");
                        break SessionEnd::Disconnected;
                    }
                }
                None => break SessionEnd::ChannelClosed,
            },
            frame = framed.next() => match frame {
                Some(Ok(frame)) => match pending.pop_front() {
                    Some(Some(tx)) => {
                        let _ = tx.send(Some(frame));
                    }
                    Some(None) => {}
                    None => {
                        tracing::warn!(endpoint = %label, "kv reply without a pending command");
                    }
                },
                Some(Err(err)) => {
                    tracing::warn!(endpoint = %label, error = %err, "kv protocol error");
                    break SessionEnd::Disconnected;
                }
                None => break SessionEnd::Disconnected,
            },
        }
    };
    for slot in pending.drain(..) {
        if let Some(tx) = slot {
            let _ = tx.send(None);
        }
    }
    end
}

fn set_state(state_tx: &watch::Sender<ConnState>, notify: &Notify, state: ConnState) {
    let _ = state_tx.send(state);
    notify.notify_waiters();
}

async fn open_stream(target: &KvTarget) -> anyhow::Result<Box<dyn AsyncStream>> {
    let tcp = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .context("tcp connect")?;
    tcp.set_nodelay(true).ok();
    match &target.tls {
        Some(config) => {
            let name = ServerName::try_from(target.host.clone()).context("tls server name")?;
            let stream = TlsConnector::from(config.clone())
                .connect(name, tcp)
                .await
                .context("tls handshake")?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(tcp)),
    }
}

async fn open_framed(target: &KvTarget) -> anyhow::Result<KvFramed> {
    Ok(Framed::new(open_stream(target).await?, Resp2::default()))
}

/// `AUTH` when a password is configured, `PING` otherwise. An error reply
/// is fatal for the socket.
async fn handshake(framed: &mut KvFramed, target: &KvTarget) -> anyhow::Result<()> {
    let args = match &target.password {
        Some(password) => vec!["AUTH".to_string(), password.clone()],
        None => vec!["PING".to_string()],
    };
    framed
        .send(command_frame(&args))
        .await
        .context("send handshake")?;
    match framed.next().await {
        Some(Ok(BytesFrame::Error(err))) => anyhow::bail!("kv auth rejected: {}", &*err),
        Some(Ok(_)) => Ok(()),
        Some(Err(err)) => Err(err).context("handshake reply"),
        None => anyhow::bail!("kv connection closed during handshake"),
    }
}

/// Encode a command as an array of bulk strings.
pub(crate) fn command_frame(args: &[String]) -> BytesFrame {
    BytesFrame::Array(
        args.iter()
            .map(|a| BytesFrame::BulkString(Bytes::copy_from_slice(a.as_bytes())))
            .collect(),
    )
}

/// String payload of a bulk or simple string reply.
pub(crate) fn frame_string(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
            Some(String::from_utf8_lossy(b).into_owned())
        }
        _ => None,
    }
}

/// Decode a flat key/value array reply (HGETALL shape) into a map.
pub(crate) fn frame_map(frame: &BytesFrame) -> Option<HashMap<String, String>> {
    let BytesFrame::Array(items) = frame else {
        return None;
    };
    let mut map = HashMap::with_capacity(items.len() / 2);
    for pair in items.chunks_exact(2) {
        map.insert(frame_string(&pair[0])?, frame_string(&pair[1])?);
    }
    Some(map)
}

/// Error text of an error reply, if that is what this is.
pub(crate) fn frame_error(frame: &BytesFrame) -> Option<&str> {
    match frame {
        BytesFrame::Error(err) => Some(&**err),
        _ => None,
    }
}

/// Ephemeral connection for one-shot request/response exchanges outside the
/// pooled fleet (admission reads, error reporting). Dropped when done.
pub(crate) struct EphemeralKv {
    framed: KvFramed,
}

impl EphemeralKv {
    pub async fn connect(target: &KvTarget) -> anyhow::Result<Self> {
        let mut framed = open_framed(target).await?;
        handshake(&mut framed, target).await?;
        Ok(Self { framed })
    }

    pub async fn command(&mut self, args: Vec<String>) -> anyhow::Result<BytesFrame> {
        self.framed
            .send(command_frame(&args))
            .await
            .context("kv send")?;
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(err)) => Err(err).context("kv reply"),
            None => anyhow::bail!("kv connection closed"),
        }
    }
}
