//! Syslog audit device.
//!
//! Frames each entry as an RFC 5424 message and sends it as one datagram,
//! either to a local unix socket or to a UDP collector.

use chrono::{SecondsFormat, Utc};
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::DeviceErrorKind;
use crate::mount::{SyslogAddress, SyslogOptions};

/// Informational severity.
const SEVERITY_INFO: u8 = 6;

enum Conn {
    Unix(UnixDatagram),
    Udp(UdpSocket),
}

/// Syslog sink. The socket is created on first use and discarded after a
/// failed send.
pub struct SyslogDevice {
    options: SyslogOptions,
    hostname: String,
    conn: Mutex<Option<Conn>>,
}

impl std::fmt::Debug for SyslogDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyslogDevice")
            .field("options", &self.options)
            .field("hostname", &self.hostname)
            .finish()
    }
}

impl SyslogDevice {
    pub fn new(options: &SyslogOptions) -> Self {
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "-".to_string());

        Self {
            options: options.clone(),
            hostname,
            conn: Mutex::new(None),
        }
    }

    pub async fn log(&self, payload: Vec<u8>) -> Result<(), DeviceErrorKind> {
        let frame = self.frame(&payload);
        let mut conn = self.conn.lock().await;

        if conn.is_none() {
            *conn = Some(self.connect().await?);
        }

        let sent = match conn.as_ref() {
            Some(Conn::Unix(sock)) => sock.send(&frame).await,
            Some(Conn::Udp(sock)) => sock.send(&frame).await,
            None => return Err(DeviceErrorKind::NotConnected),
        };

        if let Err(e) = sent {
            *conn = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn connect(&self) -> Result<Conn, DeviceErrorKind> {
        let conn = match &self.options.address {
            SyslogAddress::Unix(path) => {
                let sock = UnixDatagram::unbound()?;
                sock.connect(path)?;
                Conn::Unix(sock)
            }
            SyslogAddress::Udp(addr) => {
                let sock = UdpSocket::bind("0.0.0.0:0").await?;
                sock.connect(addr.as_str()).await?;
                Conn::Udp(sock)
            }
        };
        debug!(address = ?self.options.address, "Syslog connection established");
        Ok(conn)
    }

    /// `<PRI>1 TIMESTAMP HOSTNAME APP-NAME PROCID - - MSG`
    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let pri = u16::from(self.options.facility) * 8 + u16::from(SEVERITY_INFO);
        let header = format!(
            "<{}>1 {} {} {} {} - - ",
            pri,
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            self.hostname,
            self.options.tag,
            std::process::id()
        );
        let mut frame = Vec::with_capacity(header.len() + payload.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(payload);
        frame
    }
}
