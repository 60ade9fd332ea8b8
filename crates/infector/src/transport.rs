//! Byte-addressable I/O against target physical memory.
//!
//! `Transport` is the narrow interface the rest of the crate depends on.
//! The scanner treats [`TransportError::BadCompletion`] as "skip this
//! region"; every other error propagates to the operator.

use crate::addr::PAGE_SIZE;
use crate::error::TransportError;

pub trait Transport {
    /// Reads `n` bytes starting at `addr`. Callers never request more than
    /// one page at a time.
    fn read(&mut self, addr: u64, n: usize) -> Result<Vec<u8>, TransportError>;

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError>;

    fn read_u64(&mut self, addr: u64) -> Result<u64, TransportError> {
        let bytes = self.read(addr, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("read(8) returns 8 bytes")))
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), TransportError> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// Userspace transport over a PCIe DMA character device (e.g. an XDMA-style
/// `/dev/xdma0_user` bridge exposing the target's physical address space as
/// a seekable file). The actual transaction-layer driver is an external
/// collaborator; this wrapper only adapts its I/O errors onto
/// [`TransportError`].
pub struct PcieTransport {
    file: std::fs::File,
}

impl PcieTransport {
    pub fn open(device_path: &str) -> Result<Self, TransportError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|e| classify_open_error(&e))?;
        Ok(Self { file })
    }
}

fn classify_open_error(e: &std::io::Error) -> TransportError {
    use std::io::ErrorKind::*;
    match e.kind() {
        NotFound | PermissionDenied => TransportError::LinkNotReady,
        TimedOut => TransportError::Timeout,
        _ => TransportError::LinkNotReady,
    }
}

impl Transport for PcieTransport {
    fn read(&mut self, addr: u64, n: usize) -> Result<Vec<u8>, TransportError> {
        use std::io::{Read, Seek, SeekFrom};
        self.file
            .seek(SeekFrom::Start(addr))
            .map_err(|_| TransportError::BadCompletion { addr, len: n })?;
        let mut buf = vec![0u8; n];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| classify_io_error(&e, addr, n))?;
        Ok(buf)
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        use std::io::{Seek, SeekFrom, Write};
        self.file
            .seek(SeekFrom::Start(addr))
            .map_err(|_| TransportError::BadCompletion { addr, len: data.len() })?;
        self.file
            .write_all(data)
            .map_err(|e| classify_io_error(&e, addr, data.len()))
    }
}

fn classify_io_error(e: &std::io::Error, addr: u64, len: usize) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::TimedOut => TransportError::Timeout,
        _ => TransportError::BadCompletion { addr, len },
    }
}

/// Simple in-memory transport used by tests and by the end-to-end
/// end-to-end scenarios. Reads outside any populated region return zeros;
/// addresses registered via [`MockTransport::mark_bad`] raise
/// `BadCompletion` instead, modeling SMRAM/TSEG holes and deliberately
/// corrupt regions.
#[derive(Default)]
pub struct MockTransport {
    mem: std::collections::BTreeMap<u64, u8>,
    bad_ranges: Vec<(u64, u64)>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.mem.insert(addr + i as u64, *b);
        }
    }

    pub fn write_u64_at(&mut self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// Any read/write touching `[start, start+len)` raises `BadCompletion`.
    pub fn mark_bad(&mut self, start: u64, len: u64) {
        self.bad_ranges.push((start, start + len));
    }

    fn is_bad(&self, addr: u64, n: usize) -> bool {
        let end = addr + n as u64;
        self.bad_ranges.iter().any(|(s, e)| addr < *e && end > *s)
    }
}

impl Transport for MockTransport {
    fn read(&mut self, addr: u64, n: usize) -> Result<Vec<u8>, TransportError> {
        if n as u64 > PAGE_SIZE {
            return Err(TransportError::BadCompletion { addr, len: n });
        }
        if self.is_bad(addr, n) {
            return Err(TransportError::BadCompletion { addr, len: n });
        }
        Ok((0..n as u64).map(|i| *self.mem.get(&(addr + i)).unwrap_or(&0)).collect())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        if self.is_bad(addr, data.len()) {
            return Err(TransportError::BadCompletion { addr, len: data.len() });
        }
        self.write_bytes(addr, data);
        Ok(())
    }
}
