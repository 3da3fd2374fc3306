//! The byte-addressable storage contract the filesystem is built on.
//!
//! Grounded in the teacher's own std-facing `example/fat32-fs-std` demo
//! (`BlockFile(RwLock<std::fs::File>)`), generalized from block-index +
//! block-count addressing to plain byte offsets so the block cache (not the
//! device) owns the notion of a "block".

use std::io;
use std::sync::Mutex;

/// A block device backing a mounted filesystem.
///
/// Implementations must be safe to share across threads: the block cache
/// may issue concurrent reads from multiple worker threads, serialized only
/// by its own internal locking, not by this trait.
pub trait BlockDevice: Send + Sync {
    /// Reads `buf.len()` bytes starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Writes `buf` starting at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Total addressable size of the device in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Flushes and releases any device-level resources. Called once, when
    /// the filesystem that owns this device is dropped after a sync.
    fn close(&self) -> io::Result<()>;
}

/// An in-memory block device for tests: a fixed-size byte buffer guarded by
/// a single mutex, matching the teacher's own preference for the simplest
/// primitive that gets the job done in its std example.
#[cfg(any(test, feature = "test-utils"))]
pub struct MemoryDevice {
    data: Mutex<Vec<u8>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryDevice {
    pub fn new(size: usize) -> Self {
        MemoryDevice {
            data: Mutex::new(vec![0u8; size]),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        MemoryDevice {
            data: Mutex::new(data),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl BlockDevice for MemoryDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end"));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "write past end"));
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
