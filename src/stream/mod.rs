//! Stream-connection state shared by the client and server roles: the
//! transport below, the rendezvous feeding the parser task, and the pieces
//! of per-stream state both roles carry.

pub mod client;
pub mod server;

use crate::buffer::ByteFrame;
use crate::config::CodecConfig;
use crate::message::MessageReader;
use crate::rendezvous::BufferRendezvous;
use crate::types::{StreamContext, StreamEventListener, StreamResetReason, Transport};
use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

pub use client::{ClientStream, Http1ClientConnection};
pub use server::{Http1ServerConnection, ServerStream};

/// Per-connection plumbing owned by both roles.
pub(crate) struct ConnectionBase {
    pub conn: Arc<dyn Transport>,
    pub rendezvous: Arc<BufferRendezvous>,
    pub config: CodecConfig,
}

impl ConnectionBase {
    pub fn new(conn: Arc<dyn Transport>, config: CodecConfig) -> Self {
        Self {
            conn,
            rendezvous: Arc::new(BufferRendezvous::new()),
            config,
        }
    }

    pub async fn dispatch(&self, frame: ByteFrame) -> Result<()> {
        self.rendezvous.dispatch(frame).await
    }

    /// One encoded message, one transport write.
    pub async fn write(&self, bytes: Bytes) -> Result<()> {
        self.conn.write(bytes).await
    }

    pub fn reader(&self) -> MessageReader {
        MessageReader::new(self.rendezvous.clone(), &self.config)
    }

    /// Close the rendezvous; the parser task exits through its blocking read.
    pub fn reset(&self) {
        self.rendezvous.close();
    }
}

/// Per-stream state shared by both roles: identity, context, the
/// read-disable counter and the lifecycle listeners.
pub(crate) struct StreamCore {
    pub id: u64,
    pub ctx: StreamContext,
    read_disable_count: AtomicI32,
    event_listeners: Mutex<Vec<Arc<dyn StreamEventListener>>>,
}

impl StreamCore {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            id: ctx.stream_id,
            ctx,
            read_disable_count: AtomicI32::new(0),
            event_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StreamEventListener>) {
        self.event_listeners.lock().push(listener);
    }

    pub fn read_disabled(&self) -> bool {
        self.read_disable_count.load(Ordering::SeqCst) > 0
    }

    pub fn disable_read(&self) {
        self.read_disable_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the counter; true when it transitioned to non-positive and a
    /// deferred message should be delivered.
    pub fn enable_read(&self) -> bool {
        self.read_disable_count.fetch_sub(1, Ordering::SeqCst) - 1 <= 0
    }

    pub async fn notify_reset(&self, reason: StreamResetReason) {
        let listeners: Vec<_> = self.event_listeners.lock().iter().cloned().collect();
        for listener in listeners {
            listener.on_reset_stream(reason).await;
        }
    }

    pub async fn notify_destroy(&self) {
        let listeners: Vec<_> = self.event_listeners.lock().iter().cloned().collect();
        for listener in listeners {
            listener.on_destroy_stream().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::headers::StreamHeaders;
    use crate::types::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use http::HeaderMap;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Transport double recording writes and close calls, with an optional
    /// shared event log for cross-component ordering assertions.
    pub struct MockTransport {
        pub written: Mutex<BytesMut>,
        pub closed: Mutex<Option<(FlushPolicy, CloseSource)>>,
        pub log: Option<Arc<EventLog>>,
        notify: Notify,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                written: Mutex::new(BytesMut::new()),
                closed: Mutex::new(None),
                log: None,
                notify: Notify::new(),
            })
        }

        pub fn with_log(log: Arc<EventLog>) -> Arc<Self> {
            Arc::new(Self {
                written: Mutex::new(BytesMut::new()),
                closed: Mutex::new(None),
                log: Some(log),
                notify: Notify::new(),
            })
        }

        pub fn written_text(&self) -> String {
            String::from_utf8_lossy(&self.written.lock()).into_owned()
        }

        /// Wait until at least `n` bytes have been written.
        pub async fn wait_written(&self, n: usize) {
            loop {
                let notified = self.notify.notified();
                if self.written.lock().len() >= n {
                    return;
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn write(&self, buf: Bytes) -> Result<()> {
            self.written.lock().extend_from_slice(&buf);
            if let Some(log) = &self.log {
                log.push("transport-write");
            }
            self.notify.notify_waiters();
            Ok(())
        }

        async fn close(&self, flush: FlushPolicy, source: CloseSource) {
            *self.closed.lock() = Some((flush, source));
            self.notify.notify_waiters();
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            Some("127.0.0.1:18080".parse().unwrap())
        }
    }

    /// Append-only log shared between mocks to assert event ordering.
    pub struct EventLog {
        entries: Mutex<Vec<String>>,
        notify: Notify,
    }

    impl EventLog {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                entries: Mutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }

        pub fn push(&self, entry: impl Into<String>) {
            self.entries.lock().push(entry.into());
            self.notify.notify_waiters();
        }

        pub fn snapshot(&self) -> Vec<String> {
            self.entries.lock().clone()
        }

        pub async fn wait_for(&self, entry: &str) {
            loop {
                let notified = self.notify.notified();
                if self.entries.lock().iter().any(|e| e == entry) {
                    return;
                }
                notified.await;
            }
        }
    }

    #[derive(Debug)]
    pub enum ReceiveEvent {
        Headers {
            headers: StreamHeaders,
            end_stream: bool,
        },
        Data {
            data: Bytes,
            end_stream: bool,
        },
        Trailers(HeaderMap),
    }

    /// Receiver double recording every callback in order.
    pub struct RecordingReceiver {
        pub events: Mutex<Vec<ReceiveEvent>>,
        pub log: Option<(Arc<EventLog>, String)>,
        notify: Notify,
    }

    impl RecordingReceiver {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                log: None,
                notify: Notify::new(),
            })
        }

        pub fn with_log(log: Arc<EventLog>, tag: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                log: Some((log, tag.into())),
                notify: Notify::new(),
            })
        }

        pub fn event_count(&self) -> usize {
            self.events.lock().len()
        }

        pub async fn wait_events(&self, n: usize) {
            loop {
                let notified = self.notify.notified();
                if self.events.lock().len() >= n {
                    return;
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl StreamReceiveListener for RecordingReceiver {
        async fn on_receive_headers(
            &self,
            _ctx: &StreamContext,
            headers: StreamHeaders,
            end_stream: bool,
        ) {
            self.events.lock().push(ReceiveEvent::Headers {
                headers,
                end_stream,
            });
            if let Some((log, tag)) = &self.log {
                log.push(format!("{tag}-headers"));
            }
            self.notify.notify_waiters();
        }

        async fn on_receive_data(&self, _ctx: &StreamContext, data: Bytes, end_stream: bool) {
            self.events.lock().push(ReceiveEvent::Data { data, end_stream });
            if let Some((log, tag)) = &self.log {
                log.push(format!("{tag}-data"));
            }
            self.notify.notify_waiters();
        }

        async fn on_receive_trailers(&self, _ctx: &StreamContext, trailers: HeaderMap) {
            self.events.lock().push(ReceiveEvent::Trailers(trailers));
            self.notify.notify_waiters();
        }
    }
}
