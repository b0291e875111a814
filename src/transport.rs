//! Byte sources the capture loop can drain: a bound UDP socket or an open
//! serial port. Both hand out raw bytes with a per-read timeout so the loop
//! upstairs owns all pacing decisions.

use std::env;
use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;

use anyhow::{Context, Result};

/// Override for [`list_ports`] so tests and CI run without hardware.
const TEST_PORTS_ENV: &str = "WAVETAP_TEST_PORTS";

/// Outcome of one bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRead {
    /// `n` bytes landed at the front of the buffer.
    Data(usize),
    /// Nothing arrived within the timeout.
    Idle,
    /// The source reached end-of-stream and will not produce again.
    Closed,
}

/// A transport the capture loop can read from. Implementations block for at
/// most `timeout` per call.
pub trait ByteSource: Send {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<SourceRead>;
    fn describe(&self) -> String;
}

/// Datagram source bound to a local address. The board broadcasts sample
/// words, so this never connects; it remembers the most recent peer for
/// reporting only.
pub struct UdpSource {
    socket: UdpSocket,
    last_peer: Option<SocketAddr>,
    applied_timeout: Option<Duration>,
}

impl UdpSource {
    /// Bind the listen address. Port 0 asks the OS for a free port, which
    /// [`UdpSource::local_addr`] then reveals.
    pub fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let addr = SocketAddr::new(ip, port);
        let socket = UdpSocket::bind(addr)
            .with_context(|| format!("failed to bind UDP listener on {addr}"))?;
        Ok(Self {
            socket,
            last_peer: None,
            applied_timeout: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("failed to read bound UDP address")
    }

    pub fn last_peer(&self) -> Option<SocketAddr> {
        self.last_peer
    }

    fn apply_timeout(&mut self, timeout: Duration) -> Result<()> {
        // set_read_timeout is a syscall; skip it when nothing changed.
        if self.applied_timeout == Some(timeout) {
            return Ok(());
        }
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .context("failed to set UDP read timeout")?;
        self.applied_timeout = Some(timeout);
        Ok(())
    }
}

impl ByteSource for UdpSource {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<SourceRead> {
        self.apply_timeout(timeout)?;
        match self.socket.recv_from(buf) {
            Ok((0, _)) => Ok(SourceRead::Idle),
            Ok((n, peer)) => {
                self.last_peer = Some(peer);
                Ok(SourceRead::Data(n))
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(SourceRead::Idle)
            }
            Err(err) => Err(err).context("UDP receive failed"),
        }
    }

    fn describe(&self) -> String {
        match self.socket.local_addr() {
            Ok(addr) => format!("udp://{addr}"),
            Err(_) => "udp://<unbound>".to_string(),
        }
    }
}

/// Serial source talking to the board's USB CDC endpoint.
pub struct SerialSource {
    port: Box<dyn serialport::SerialPort>,
    path: String,
}

impl SerialSource {
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| format!("failed to open serial port '{path}' at {baud} baud"))?;
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }
}

impl ByteSource for SerialSource {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<SourceRead> {
        self.port
            .set_timeout(timeout.max(Duration::from_millis(1)))
            .with_context(|| format!("failed to set timeout on '{}'", self.path))?;
        match self.port.read(buf) {
            // EOF: the device detached or the driver tore the stream down.
            Ok(0) => Ok(SourceRead::Closed),
            Ok(n) => Ok(SourceRead::Data(n)),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(SourceRead::Idle)
            }
            Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(SourceRead::Closed),
            Err(err) => Err(err).with_context(|| format!("serial read from '{}' failed", self.path)),
        }
    }

    fn describe(&self) -> String {
        format!("serial://{}", self.path)
    }
}

/// Names of serial ports present on this machine. `WAVETAP_TEST_PORTS`
/// (comma separated) bypasses the hardware probe.
pub fn list_ports() -> Result<Vec<String>> {
    if let Ok(raw) = env::var(TEST_PORTS_ENV) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(trimmed
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect());
    }

    let ports = serialport::available_ports().context("failed to enumerate serial ports")?;
    Ok(ports.into_iter().map(|info| info.port_name).collect())
}
