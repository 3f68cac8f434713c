//! Positioned-read device abstraction and an optional trace sink.
//!
//! Every parse step in this crate goes through `BlockDevice` rather than
//! holding its own `Read + Seek` cursor, so a host can share one backing
//! file handle across a `Container` and every `Volume` it opens without the
//! core needing to know whether that handle is thread-safe.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

/// Absolute, positioned reads against the underlying container image.
pub trait BlockDevice: Send + Sync {
    fn size(&self) -> std::io::Result<u64>;
    fn read_exact_at(&self, offset: u64, out: &mut [u8]) -> std::io::Result<()>;
}

/// Adapts any single-threaded `Read + Seek` into a `BlockDevice` by
/// serializing access through a mutex. This is the common case: opening a
/// disk image file or a `Cursor<Vec<u8>>` in tests.
pub struct ReaderDevice<T> {
    inner: Mutex<T>,
}

impl<T> ReaderDevice<T> {
    pub fn new(inner: T) -> Self {
        ReaderDevice { inner: Mutex::new(inner) }
    }
}

impl<T: Read + Seek + Send> BlockDevice for ReaderDevice<T> {
    fn size(&self) -> std::io::Result<u64> {
        let mut guard = self.inner.lock().unwrap();
        guard.seek(SeekFrom::End(0))
    }

    fn read_exact_at(&self, offset: u64, out: &mut [u8]) -> std::io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.seek(SeekFrom::Start(offset))?;
        guard.read_exact(out)
    }
}

// Send + Sync for ReaderDevice<T: Send> holds because all access to `inner`
// is serialized by the Mutex; no two threads ever touch `T` concurrently.
unsafe impl<T: Send> Sync for ReaderDevice<T> {}

/// Injected observer for internal decisions (checkpoint candidate selection,
/// OMAP fallback scans, volume unlock attempts). Never required; costs
/// nothing when absent. Never receives credential material.
pub trait TraceSink: Send + Sync {
    fn trace(&self, message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reader_device_positioned_read() {
        let data = (0u8..64).collect::<Vec<u8>>();
        let device = ReaderDevice::new(Cursor::new(data));

        let mut buf = [0u8; 8];
        device.read_exact_at(16, &mut buf).unwrap();
        assert_eq!(buf, [16, 17, 18, 19, 20, 21, 22, 23]);

        assert_eq!(device.size().unwrap(), 64);
    }
}
