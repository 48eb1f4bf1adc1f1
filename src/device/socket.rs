//! Network socket audit device.
//!
//! Streams newline-delimited JSON over TCP, UDP, or a unix stream socket.
//! The connection is opened lazily. After any failure it is dropped, and
//! the next attempt is held back by a jittered exponential backoff, during
//! which writes fail fast with [`DeviceErrorKind::NotConnected`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::SocketConfig;
use crate::error::DeviceErrorKind;
use crate::mount::{SocketOptions, SocketType};

use super::backoff::Backoff;

enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
}

struct State {
    conn: Option<Conn>,
    backoff: Backoff,
    /// Earliest time the next connect may be attempted.
    retry_at: Option<Instant>,
}

struct Inner {
    options: SocketOptions,
    state: Mutex<State>,
}

/// Socket sink.
#[derive(Clone)]
pub struct SocketDevice {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SocketDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketDevice")
            .field("options", &self.inner.options)
            .finish()
    }
}

impl SocketDevice {
    pub fn new(options: &SocketOptions, reconnect: &SocketConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                options: options.clone(),
                state: Mutex::new(State {
                    conn: None,
                    backoff: Backoff::new(reconnect.reconnect_base_ms, reconnect.reconnect_max_ms),
                    retry_at: None,
                }),
            }),
        }
    }

    /// Send one entry.
    ///
    /// The send runs in its own task bounded by `write_timeout`, so a caller
    /// that stops waiting can never leave half a line on the stream.
    pub async fn log(&self, payload: Vec<u8>) -> Result<(), DeviceErrorKind> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.send(payload).await })
            .await
            .map_err(|e| DeviceErrorKind::Io {
                message: format!("send task failed: {}", e),
            })?
    }
}

impl Inner {
    async fn send(&self, mut payload: Vec<u8>) -> Result<(), DeviceErrorKind> {
        payload.push(b'\n');
        let mut state = self.state.lock().await;

        if state.conn.is_none() {
            if let Some(at) = state.retry_at {
                if Instant::now() < at {
                    return Err(DeviceErrorKind::NotConnected);
                }
            }
            match self.connect().await {
                Ok(conn) => {
                    state.conn = Some(conn);
                    state.backoff.reset();
                    state.retry_at = None;
                    debug!(address = %self.options.address, "Audit socket connected");
                }
                Err(kind) => {
                    self.schedule_retry(&mut state, &kind);
                    return Err(kind);
                }
            }
        }

        let write_timeout = self.options.write_timeout;
        let result = match state.conn.as_mut() {
            Some(conn) => match timeout(write_timeout, write(conn, &payload)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DeviceErrorKind::from(e)),
                Err(_) => Err(timeout_kind(write_timeout)),
            },
            None => Err(DeviceErrorKind::NotConnected),
        };

        if let Err(kind) = &result {
            state.conn = None;
            self.schedule_retry(&mut state, kind);
        }
        result
    }

    async fn connect(&self) -> Result<Conn, DeviceErrorKind> {
        let addr = self.options.address.as_str();
        let connect = async {
            Ok::<_, std::io::Error>(match self.options.socket_type {
                SocketType::Tcp => Conn::Tcp(TcpStream::connect(addr).await?),
                SocketType::Unix => Conn::Unix(UnixStream::connect(addr).await?),
                SocketType::Udp => {
                    let sock = UdpSocket::bind("0.0.0.0:0").await?;
                    sock.connect(addr).await?;
                    Conn::Udp(sock)
                }
            })
        };

        match timeout(self.options.write_timeout, connect).await {
            Ok(result) => result.map_err(DeviceErrorKind::from),
            Err(_) => Err(timeout_kind(self.options.write_timeout)),
        }
    }

    fn schedule_retry(&self, state: &mut State, kind: &DeviceErrorKind) {
        let delay = state.backoff.next_delay();
        state.retry_at = Some(Instant::now() + delay);
        warn!(
            address = %self.options.address,
            error = %kind,
            retry_in_ms = delay.as_millis() as u64,
            "Audit socket connection dropped"
        );
    }
}

async fn write(conn: &mut Conn, payload: &[u8]) -> std::io::Result<()> {
    match conn {
        Conn::Tcp(stream) => stream.write_all(payload).await,
        Conn::Unix(stream) => stream.write_all(payload).await,
        Conn::Udp(sock) => sock.send(payload).await.map(|_| ()),
    }
}

fn timeout_kind(d: Duration) -> DeviceErrorKind {
    DeviceErrorKind::Timeout {
        timeout_ms: d.as_millis() as u64,
    }
}
