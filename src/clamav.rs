//! Antivirus daemon client (clamd INSTREAM protocol).
//!
//! Each scan opens a fresh connection, writes the literal `zINSTREAM\0`,
//! streams the body as 4-byte big-endian length-prefixed frames of at
//! most 16 KiB, terminates with a zero-length frame, and reads one
//! response line. A circuit breaker short-circuits scans while the daemon
//! is known to be down.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

/// Body bytes per INSTREAM frame.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Bound on the daemon's response line.
const RESPONSE_CAP: usize = 1024;

/// Per-direction socket deadline.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive failures before the breaker opens.
const CB_FAILURE_THRESHOLD: u32 = 5;

/// Cooldown before an open breaker allows a probe.
const CB_RECOVERY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    /// The daemon's response line naming the threat.
    Infected(String),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scanner circuit breaker open")]
    CircuitOpen,
    #[error("scanner I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected scanner reply: {0}")]
    Protocol(String),
}

/// Where the daemon listens.
#[derive(Debug, Clone)]
pub enum ClamdEndpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ClamdEndpoint {
    pub fn from_config(cfg: &Config) -> Self {
        match &cfg.clamd_socket {
            Some(path) => ClamdEndpoint::Unix(path.clone()),
            None => ClamdEndpoint::Tcp {
                host: cfg.clamd_host.clone(),
                port: cfg.clamd_port,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            last_failure: None,
        }
    }

    fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(CB_RECOVERY);
                if elapsed >= CB_RECOVERY {
                    debug!("scanner circuit breaker half-open, allowing probe");
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            debug!("scanner circuit breaker closed");
        }
        self.failures = 0;
        self.state = BreakerState::Closed;
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        if self.failures >= CB_FAILURE_THRESHOLD && self.state != BreakerState::Open {
            warn!(failures = self.failures, "scanner circuit breaker open");
            self.state = BreakerState::Open;
        } else if self.state == BreakerState::HalfOpen {
            // Probe failed: straight back to open.
            self.state = BreakerState::Open;
        }
    }
}

pub struct ClamdClient {
    endpoint: ClamdEndpoint,
    breaker: Mutex<Breaker>,
}

impl ClamdClient {
    pub fn new(endpoint: ClamdEndpoint) -> Self {
        Self {
            endpoint,
            breaker: Mutex::new(Breaker::new()),
        }
    }

    /// Scan `body`, short-circuiting while the breaker is open. A verdict
    /// (clean or infected) counts as breaker success; connection,
    /// deadline, and protocol failures count against it.
    pub fn scan(&self, body: &[u8]) -> Result<ScanVerdict, ScanError> {
        {
            let mut breaker = self.breaker.lock().map_err(|_| ScanError::CircuitOpen)?;
            if !breaker.allow() {
                return Err(ScanError::CircuitOpen);
            }
        }

        let result = self.scan_once(body);
        let mut breaker = self.breaker.lock().map_err(|_| ScanError::CircuitOpen)?;
        match &result {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        result
    }

    fn scan_once(&self, body: &[u8]) -> Result<ScanVerdict, ScanError> {
        match &self.endpoint {
            ClamdEndpoint::Tcp { host, port } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        ScanError::Io(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("cannot resolve scanner host {host}"),
                        ))
                    })?;
                let mut stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT)?;
                stream.set_read_timeout(Some(IO_TIMEOUT))?;
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                instream_exchange(&mut stream, body)
            }
            ClamdEndpoint::Unix(path) => {
                let mut stream = UnixStream::connect(path)?;
                stream.set_read_timeout(Some(IO_TIMEOUT))?;
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                instream_exchange(&mut stream, body)
            }
        }
    }
}

/// Run one INSTREAM exchange over an established stream.
fn instream_exchange<S: Read + Write>(
    stream: &mut S,
    body: &[u8],
) -> Result<ScanVerdict, ScanError> {
    stream.write_all(b"zINSTREAM\0")?;

    for chunk in body.chunks(CHUNK_SIZE) {
        stream.write_all(&(chunk.len() as u32).to_be_bytes())?;
        stream.write_all(chunk)?;
    }
    stream.write_all(&0u32.to_be_bytes())?;
    stream.flush()?;

    let line = read_response_line(stream)?;
    debug!(reply = %line, "scanner reply");

    if line.contains("FOUND") {
        Ok(ScanVerdict::Infected(line))
    } else if line.contains("OK") {
        Ok(ScanVerdict::Clean)
    } else {
        Err(ScanError::Protocol(line))
    }
}

/// Read one response line, bounded, ending at newline, NUL, or EOF.
fn read_response_line<S: Read>(stream: &mut S) -> Result<String, ScanError> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    while line.len() < RESPONSE_CAP {
        let n = stream.read(&mut byte)?;
        if n == 0 || byte[0] == b'\n' || byte[0] == 0 {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

// ── Tests ───────────────────────────────────────────────────────
