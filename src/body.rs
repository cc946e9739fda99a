//! Per-request body accumulation.
//!
//! Bodies arrive in arbitrary-size chunks through the ICAP I/O callback.
//! Three sinks run in parallel:
//!
//! - a capped scan buffer used for regex inspection (1 MiB for requests,
//!   2 MiB for responses);
//! - a rolling tail window holding the last 10 KiB of the stream, so a
//!   credential pushed past the scan cap by padding is still seen;
//! - a passthrough store capturing the full stream for replay outbound,
//!   spilling from memory to a temporary file past a threshold.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Scan buffer cap for outbound request bodies.
pub const REQMOD_SCAN_CAP: usize = 1024 * 1024;

/// Scan buffer cap for inbound response bodies.
pub const RESPMOD_SCAN_CAP: usize = 2 * 1024 * 1024;

/// Size of the rolling tail window.
pub const TAIL_WINDOW: usize = 10 * 1024;

/// Passthrough bytes kept in memory before spilling to disk.
const SPILL_THRESHOLD: usize = 128 * 1024;

/// Rolling window over the last `cap` bytes of a byte stream.
pub struct TailWindow {
    buf: Vec<u8>,
    cap: usize,
}

impl TailWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(4096)),
            cap,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            // The chunk alone fills the window.
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.cap..]);
        } else if self.buf.len() + chunk.len() <= self.cap {
            self.buf.extend_from_slice(chunk);
        } else {
            // Shift old data left to make room.
            let keep = self.cap - chunk.len();
            let start = self.buf.len() - keep;
            self.buf.copy_within(start.., 0);
            self.buf.truncate(keep);
            self.buf.extend_from_slice(chunk);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

enum Backing {
    Mem(Vec<u8>),
    Disk(File),
}

/// Full-body capture for outbound replay. Writes complete before the
/// first read; `replace` swaps in a modified body.
pub struct PassthroughStore {
    backing: Backing,
    len: usize,
    read_started: bool,
    read_pos: usize,
}

impl PassthroughStore {
    pub fn new() -> Self {
        Self {
            backing: Backing::Mem(Vec::new()),
            len: 0,
            read_started: false,
            read_pos: 0,
        }
    }

    pub fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match &mut self.backing {
            Backing::Mem(mem) => {
                if mem.len() + chunk.len() > SPILL_THRESHOLD {
                    let mut file = tempfile::tempfile()?;
                    file.write_all(mem)?;
                    file.write_all(chunk)?;
                    self.backing = Backing::Disk(file);
                } else {
                    mem.extend_from_slice(chunk);
                }
            }
            Backing::Disk(file) => file.write_all(chunk)?,
        }
        self.len += chunk.len();
        Ok(())
    }

    /// Sequential read of the captured body. The first call rewinds a
    /// disk backing to the start.
    pub fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match &mut self.backing {
            Backing::Mem(mem) => {
                let remaining = &mem[self.read_pos.min(mem.len())..];
                let n = remaining.len().min(out.len());
                out[..n].copy_from_slice(&remaining[..n]);
                self.read_pos += n;
                Ok(n)
            }
            Backing::Disk(file) => {
                if !self.read_started {
                    file.seek(SeekFrom::Start(0))?;
                    self.read_started = true;
                }
                file.read(out)
            }
        }
    }

    /// Discard the captured stream and substitute `body` as the bytes to
    /// replay outbound.
    pub fn replace(&mut self, body: Vec<u8>) {
        self.len = body.len();
        self.backing = Backing::Mem(body);
        self.read_started = false;
        self.read_pos = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for PassthroughStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The combined per-request sinks.
pub struct BodyAccumulator {
    scan_cap: usize,
    scan_buf: Vec<u8>,
    tail: TailWindow,
    total: usize,
    store: PassthroughStore,
}

impl BodyAccumulator {
    pub fn new(scan_cap: usize) -> Self {
        Self {
            scan_cap,
            scan_buf: Vec::new(),
            tail: TailWindow::new(TAIL_WINDOW),
            total: 0,
            store: PassthroughStore::new(),
        }
    }

    /// Feed one inbound chunk to all three sinks.
    pub fn push(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.scan_buf.len() < self.scan_cap {
            let space = self.scan_cap - self.scan_buf.len();
            let take = chunk.len().min(space);
            self.scan_buf.extend_from_slice(&chunk[..take]);
        }
        self.tail.push(chunk);
        self.store.write(chunk)?;
        self.total += chunk.len();
        Ok(())
    }

    /// Total bytes observed on the stream, including bytes past the cap.
    pub fn total_len(&self) -> usize {
        self.total
    }

    /// True when the stream ran past the scan cap and the tail window is
    /// the only view of its end.
    pub fn overflowed(&self) -> bool {
        self.total > self.scan_cap
    }

    pub fn scan_buf(&self) -> &[u8] {
        &self.scan_buf
    }

    pub fn scan_buf_mut(&mut self) -> &mut [u8] {
        &mut self.scan_buf
    }

    pub fn tail(&self) -> &[u8] {
        self.tail.as_slice()
    }

    pub fn store_mut(&mut self) -> &mut PassthroughStore {
        &mut self.store
    }
}

// ── Tests ───────────────────────────────────────────────────────
