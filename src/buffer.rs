use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

/// Refcounted, drainable byte buffer handed from the transport into the codec.
///
/// Clones share one read cursor: when the consumer drains bytes, every holder
/// of the frame observes the shorter remainder. The transport re-offers the
/// same frame until it is empty, so draining is the consumption acknowledgement.
#[derive(Debug, Clone)]
pub struct ByteFrame {
    inner: Arc<Mutex<BytesMut>>,
}

impl ByteFrame {
    pub fn new(data: impl Into<BytesMut>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data.into())),
        }
    }

    /// Number of readable bytes remaining.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Advance the shared read cursor by up to `n` bytes.
    pub fn drain(&self, n: usize) {
        let mut buf = self.inner.lock();
        let n = n.min(buf.len());
        buf.advance(n);
    }

    /// Copy up to `dst.len()` readable bytes into `dst` and drain them.
    /// Returns the number of bytes copied.
    pub fn copy_into(&self, dst: &mut [u8]) -> usize {
        let mut buf = self.inner.lock();
        let n = dst.len().min(buf.len());
        dst[..n].copy_from_slice(&buf[..n]);
        buf.advance(n);
        n
    }

    /// Snapshot of the readable bytes.
    pub fn bytes(&self) -> Bytes {
        self.inner.lock().clone().freeze()
    }
}

impl From<&[u8]> for ByteFrame {
    fn from(data: &[u8]) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for ByteFrame {
    fn from(data: Vec<u8>) -> Self {
        Self::new(&data[..])
    }
}
