//! Single-slot byte hand-off between the transport's receive task and the
//! codec's parser task.
//!
//! The transport dispatches frames from its own task; the parser wants a
//! blocking read. The rendezvous bridges the two: `dispatch` does not return
//! until the parser has drained the frame, which is also the per-connection
//! backpressure the codec applies to the peer.

use crate::buffer::ByteFrame;
use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct BufferRendezvous {
    frame_tx: mpsc::Sender<ByteFrame>,
    frame_rx: Mutex<mpsc::Receiver<ByteFrame>>,
    ack_tx: mpsc::Sender<()>,
    ack_rx: Mutex<mpsc::Receiver<()>>,
    shutdown: CancellationToken,
}

impl BufferRendezvous {
    pub fn new() -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::channel(1);
        Self {
            frame_tx,
            frame_rx: Mutex::new(frame_rx),
            ack_tx,
            ack_rx: Mutex::new(ack_rx),
            shutdown: CancellationToken::new(),
        }
    }

    /// Producer side. Offers the frame to the consumer and waits for the
    /// drain acknowledgement, repeating while the frame still has bytes.
    pub async fn dispatch(&self, frame: ByteFrame) -> Result<()> {
        while !frame.is_empty() {
            if self.shutdown.is_cancelled() {
                return Err(anyhow!("rendezvous closed"));
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(anyhow!("rendezvous closed")),
                sent = self.frame_tx.send(frame.clone()) => {
                    sent.map_err(|_| anyhow!("rendezvous closed"))?;
                }
            }

            let mut ack_rx = self.ack_rx.lock().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(anyhow!("rendezvous closed")),
                ack = ack_rx.recv() => {
                    if ack.is_none() {
                        return Err(anyhow!("rendezvous closed"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Consumer side. Copies up to `dst.len()` bytes out of the current frame,
    /// acknowledges the drain, and returns the count. Returns 0 at
    /// end-of-stream.
    pub async fn read(&self, dst: &mut [u8]) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }
        let mut frame_rx = self.frame_rx.lock().await;
        let frame = tokio::select! {
            _ = self.shutdown.cancelled() => return 0,
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => return 0,
            },
        };
        drop(frame_rx);

        let n = frame.copy_into(dst);
        let _ = self.ack_tx.send(()).await;
        n
    }

    /// Terminate the hand-off: an in-flight `read` observes end-of-stream and
    /// later `dispatch` calls are rejected. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Default for BufferRendezvous {
    fn default() -> Self {
        Self::new()
    }
}
