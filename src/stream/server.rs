//! Server role: the parser task reads requests off the connection, announces
//! each one to the proxy through `new_stream_detect`, and blocks until the
//! response has been written back before touching the next request. That
//! blocking wait is what enforces HTTP/1 half-duplex ordering.

use super::{ConnectionBase, StreamCore};
use crate::buffer::ByteFrame;
use crate::config::CodecConfig;
use crate::headers::{
    extract_request_line, inject_request_line, RequestHeaders, StreamHeaders, MOSN_STATUS,
};
use crate::message::{encode_response, RequestMessage, ResponseMessage};
use crate::types::{
    next_stream_id, CloseSource, FlushPolicy, ProtocolId, ServerStreamConnection,
    ServerStreamListener, Stream, StreamConnection, StreamContext, StreamEventListener,
    StreamReceiveListener, StreamResetReason, StreamSender, Transport, HTTP1,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use http::header::CONNECTION;
use http::{HeaderMap, HeaderValue};
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;
use tracing::{error, info_span};

pub struct Http1ServerConnection {
    base: ConnectionBase,
    active: RwLock<Option<Arc<ServerStream>>>,
    listener: Arc<dyn ServerStreamListener>,
    weak: Weak<Self>,
}

impl Http1ServerConnection {
    pub fn new(
        conn: Arc<dyn Transport>,
        listener: Arc<dyn ServerStreamListener>,
        config: CodecConfig,
    ) -> Arc<Self> {
        let this = Arc::new_cyclic(|weak| Self {
            base: ConnectionBase::new(conn, config),
            active: RwLock::new(None),
            listener,
            weak: weak.clone(),
        });

        let serving = this.clone();
        tokio::spawn(async move {
            if AssertUnwindSafe(serving.serve()).catch_unwind().await.is_err() {
                error!("http1 server serve task panicked, restarting once");
                let _ = AssertUnwindSafe(serving.serve()).catch_unwind().await;
            }
        });

        this
    }

    fn active_stream(&self) -> Option<Arc<ServerStream>> {
        self.active.read().clone()
    }

    pub(crate) fn clear_active(&self) {
        *self.active.write() = None;
    }

    async fn serve(&self) {
        let mut reader = self.base.reader();
        loop {
            let request = match reader.read_request().await {
                Ok(request) => request,
                Err(err) => {
                    if let Some(stream) = self.active_stream() {
                        stream.reset_stream(StreamResetReason::RemoteReset).await;
                        error!(error = %err, "http1 server codec task error");
                    }
                    return;
                }
            };

            let id = next_stream_id();
            let ctx = StreamContext::new(id, HTTP1);
            let span = info_span!("http1_server_stream", stream_id = id);
            let (done_tx, mut done_rx) = mpsc::channel(1);

            let stream = Arc::new(ServerStream {
                core: StreamCore::new(ctx.clone()),
                connection: self.weak.clone(),
                request,
                response: Mutex::new(ResponseMessage::default()),
                receiver: OnceLock::new(),
                response_done: done_tx,
                delivered: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            });

            let receiver = self
                .listener
                .new_stream_detect(ctx, stream.clone(), span)
                .await;
            let _ = stream.receiver.set(receiver);

            *self.active.write() = Some(stream.clone());

            if !stream.core.read_disabled() {
                stream.handle_request().await;
            }

            // Half-duplex: the next request is not parsed until this one's
            // response has hit the wire.
            if done_rx.recv().await.is_none() {
                return;
            }
        }
    }
}

#[async_trait]
impl StreamConnection for Http1ServerConnection {
    async fn dispatch(&self, frame: ByteFrame) -> Result<()> {
        self.base.dispatch(frame).await
    }

    fn protocol(&self) -> ProtocolId {
        HTTP1
    }

    fn active_streams_num(&self) -> usize {
        if self.active.read().is_some() {
            1
        } else {
            0
        }
    }

    fn reset(&self, _reason: StreamResetReason) {
        self.base.reset();
    }
}

impl ServerStreamConnection for Http1ServerConnection {}

/// One inbound request/response pair on a server connection.
pub struct ServerStream {
    pub(crate) core: StreamCore,
    connection: Weak<Http1ServerConnection>,
    request: RequestMessage,
    response: Mutex<ResponseMessage>,
    receiver: OnceLock<Arc<dyn StreamReceiveListener>>,
    response_done: mpsc::Sender<()>,
    /// Request delivery happens once, whether at publish time or deferred
    /// through read-disable.
    delivered: AtomicBool,
    finished: AtomicBool,
}

impl ServerStream {
    fn connection(&self) -> Result<Arc<Http1ServerConnection>> {
        self.connection.upgrade().context("stream connection dropped")
    }

    pub(crate) async fn handle_request(&self) {
        if self.delivered.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(receiver) = self.receiver.get() else {
            return;
        };

        let mut headers = RequestHeaders(self.request.headers.clone());
        let host = self.request.host().unwrap_or_default().to_string();
        inject_request_line(
            &mut headers,
            &self.request.method,
            &self.request.path,
            self.request.query.as_deref(),
            &host,
        );

        let has_body = !self.request.body.is_empty();
        receiver
            .on_receive_headers(&self.core.ctx, StreamHeaders::Request(headers), !has_body)
            .await;
        if has_body {
            receiver
                .on_receive_data(&self.core.ctx, self.request.body.clone(), true)
                .await;
        }
    }

    /// Write the response, release the serve loop, and tear the connection
    /// down if this exchange asked for it.
    async fn finish(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.connection()?;
        let close_conn = self.request.connection_close();

        let bytes = {
            let mut response = self.response.lock();
            if close_conn {
                response.set_connection_close();
            } else if !self.request.is_http11() {
                // keep-alive is the default for HTTP/1.1 only
                response
                    .headers
                    .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
            }
            encode_response(&response)
        };

        if let Err(err) = conn.base.write(bytes).await {
            error!(error = %err, "http1 server stream send error");
        }

        // Clear before signalling: once the serve loop wakes it may publish
        // the next stream immediately.
        conn.clear_active();
        let _ = self.response_done.send(()).await;

        self.destroy_stream().await;

        if close_conn {
            conn.base
                .conn
                .close(FlushPolicy::FlushWrite, CloseSource::LocalClose)
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl Stream for ServerStream {
    fn id(&self) -> u64 {
        self.core.id
    }

    fn add_event_listener(&self, listener: Arc<dyn StreamEventListener>) {
        self.core.add_listener(listener);
    }

    async fn reset_stream(&self, reason: StreamResetReason) {
        self.core.notify_reset(reason).await;
    }

    async fn destroy_stream(&self) {
        self.core.notify_destroy().await;
    }
}

#[async_trait]
impl StreamSender for ServerStream {
    async fn append_headers(
        &self,
        _ctx: &StreamContext,
        headers: StreamHeaders,
        end_stream: bool,
    ) -> Result<()> {
        match headers {
            StreamHeaders::Request(mut headers) => {
                // Hijack: the proxy answers straight from the request
                // headers, so echo them onto the response after pulling out
                // the status and stripping the internal keys.
                if let Some(status) = headers.take(MOSN_STATUS) {
                    let remote_addr = self.connection()?.base.conn.remote_addr();
                    let _ = extract_request_line(&mut headers, remote_addr);

                    let mut response = self.response.lock();
                    response.status = status.parse().unwrap_or(0);
                    for (name, value) in headers.0.iter() {
                        response.headers.insert(name.clone(), value.clone());
                    }
                }
            }
            StreamHeaders::Response(mut headers) => {
                let status = headers.take(MOSN_STATUS);
                let mut response = self.response.lock();
                if let Some(status) = status {
                    response.status = status.parse().unwrap_or(0);
                }
                response.headers = headers.0;
            }
        }

        if end_stream {
            self.finish().await?;
        }
        Ok(())
    }

    async fn append_data(&self, _ctx: &StreamContext, data: Bytes, end_stream: bool) -> Result<()> {
        self.response.lock().body = data;
        if end_stream {
            self.finish().await?;
        }
        Ok(())
    }

    async fn append_trailers(&self, _ctx: &StreamContext, _trailers: HeaderMap) -> Result<()> {
        self.finish().await
    }

    async fn read_disable(&self, disable: bool) {
        if disable {
            self.core.disable_read();
        } else if self.core.enable_read() {
            self.handle_request().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{ResponseHeaders, ISTIO_AUTHORITY, MOSN_HOST, MOSN_METHOD, MOSN_PATH};
    use crate::stream::testing::{EventLog, MockTransport, ReceiveEvent, RecordingReceiver};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Listener double handing out recording receivers and capturing senders
    /// so tests can drive the response side.
    struct CapturingListener {
        streams: Mutex<Vec<(Arc<dyn StreamSender>, Arc<RecordingReceiver>)>>,
        defer_delivery: bool,
        notify: Notify,
    }

    impl CapturingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(Vec::new()),
                defer_delivery: false,
                notify: Notify::new(),
            })
        }

        /// Variant that read-disables every stream before it is published, so
        /// delivery is deferred until the test re-enables it.
        fn deferring() -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(Vec::new()),
                defer_delivery: true,
                notify: Notify::new(),
            })
        }

        fn stream(&self, index: usize) -> (Arc<dyn StreamSender>, Arc<RecordingReceiver>) {
            let streams = self.streams.lock();
            (streams[index].0.clone(), streams[index].1.clone())
        }

        async fn wait_streams(&self, n: usize) {
            loop {
                let notified = self.notify.notified();
                if self.streams.lock().len() >= n {
                    return;
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl ServerStreamListener for CapturingListener {
        async fn new_stream_detect(
            &self,
            _ctx: StreamContext,
            sender: Arc<dyn StreamSender>,
            _span: tracing::Span,
        ) -> Arc<dyn StreamReceiveListener> {
            if self.defer_delivery {
                sender.read_disable(true).await;
            }
            let receiver = RecordingReceiver::new();
            self.streams.lock().push((sender, receiver.clone()));
            self.notify.notify_waiters();
            receiver
        }
    }

    /// Listener double that responds 200 to every request after a delay,
    /// tagging receiver callbacks in the shared event log.
    struct AutoResponder {
        log: Arc<EventLog>,
        delay: Duration,
        count: AtomicUsize,
    }

    impl AutoResponder {
        fn new(log: Arc<EventLog>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                log,
                delay,
                count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ServerStreamListener for AutoResponder {
        async fn new_stream_detect(
            &self,
            _ctx: StreamContext,
            sender: Arc<dyn StreamSender>,
            _span: tracing::Span,
        ) -> Arc<dyn StreamReceiveListener> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            let receiver = RecordingReceiver::with_log(self.log.clone(), format!("req{n}"));
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let ctx = StreamContext::new(sender.id(), HTTP1);
                let mut headers = ResponseHeaders::default();
                headers.set(MOSN_STATUS, "200");
                sender
                    .append_headers(&ctx, StreamHeaders::Response(headers), true)
                    .await
                    .unwrap();
            });
            receiver
        }
    }

    fn ctx_for(sender: &Arc<dyn StreamSender>) -> StreamContext {
        StreamContext::new(sender.id(), HTTP1)
    }

    #[tokio::test]
    async fn test_simple_get_delivers_headers_with_end_stream() {
        let transport = MockTransport::new();
        let listener = CapturingListener::new();
        let conn =
            Http1ServerConnection::new(transport, listener.clone(), CodecConfig::default());

        conn.dispatch(ByteFrame::from(&b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n"[..]))
            .await
            .unwrap();
        listener.wait_streams(1).await;
        let (_, receiver) = listener.stream(0);
        receiver.wait_events(1).await;

        let events = receiver.events.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ReceiveEvent::Headers {
                headers: StreamHeaders::Request(headers),
                end_stream,
            } => {
                assert_eq!(headers.get(MOSN_METHOD), Some("GET"));
                assert_eq!(headers.get(MOSN_PATH), Some("/x"));
                assert_eq!(headers.get(MOSN_HOST), Some("h"));
                assert_eq!(headers.get(ISTIO_AUTHORITY), Some("h"));
                assert!(*end_stream);
            }
            other => panic!("expected request headers, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_post_body_delivered_after_headers() {
        let transport = MockTransport::new();
        let listener = CapturingListener::new();
        let conn =
            Http1ServerConnection::new(transport, listener.clone(), CodecConfig::default());

        conn.dispatch(ByteFrame::from(
            &b"POST /p HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello"[..],
        ))
        .await
        .unwrap();
        listener.wait_streams(1).await;
        let (_, receiver) = listener.stream(0);
        receiver.wait_events(2).await;

        let events = receiver.events.lock();
        match &events[0] {
            ReceiveEvent::Headers { end_stream, .. } => assert!(!*end_stream),
            other => panic!("expected headers, got {other:?}"),
        }
        match &events[1] {
            ReceiveEvent::Data { data, end_stream } => {
                assert_eq!(data.as_ref(), b"hello");
                assert!(*end_stream);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_written_and_slot_cleared_on_keep_alive() {
        let transport = MockTransport::new();
        let listener = CapturingListener::new();
        let conn = Http1ServerConnection::new(
            transport.clone(),
            listener.clone(),
            CodecConfig::default(),
        );

        conn.dispatch(ByteFrame::from(&b"GET / HTTP/1.1\r\nHost: h\r\n\r\n"[..]))
            .await
            .unwrap();
        listener.wait_streams(1).await;
        assert_eq!(conn.active_streams_num(), 1);

        let (sender, _) = listener.stream(0);
        let mut headers = ResponseHeaders::default();
        headers.set(MOSN_STATUS, "200");
        headers.set("x-app", "ok");
        sender
            .append_headers(&ctx_for(&sender), StreamHeaders::Response(headers), true)
            .await
            .unwrap();

        let wire = transport.written_text();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"), "{wire}");
        assert!(wire.contains("x-app: ok\r\n"));
        assert!(!wire.contains(MOSN_STATUS), "internal key on the wire: {wire}");
        assert_eq!(conn.active_streams_num(), 0);
        assert!(transport.closed.lock().is_none(), "keep-alive must not close");
    }

    #[tokio::test]
    async fn test_connection_close_is_echoed_and_transport_closed() {
        let transport = MockTransport::new();
        let listener = CapturingListener::new();
        let conn = Http1ServerConnection::new(
            transport.clone(),
            listener.clone(),
            CodecConfig::default(),
        );

        conn.dispatch(ByteFrame::from(
            &b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n"[..],
        ))
        .await
        .unwrap();
        listener.wait_streams(1).await;

        let (sender, _) = listener.stream(0);
        let mut headers = ResponseHeaders::default();
        headers.set(MOSN_STATUS, "200");
        sender
            .append_headers(&ctx_for(&sender), StreamHeaders::Response(headers), true)
            .await
            .unwrap();

        let wire = transport.written_text();
        assert!(wire.contains("connection: close\r\n"), "{wire}");
        assert_eq!(
            *transport.closed.lock(),
            Some((FlushPolicy::FlushWrite, CloseSource::LocalClose))
        );
    }

    #[tokio::test]
    async fn test_http10_keep_alive_is_made_explicit() {
        let transport = MockTransport::new();
        let listener = CapturingListener::new();
        let conn = Http1ServerConnection::new(
            transport.clone(),
            listener.clone(),
            CodecConfig::default(),
        );

        conn.dispatch(ByteFrame::from(
            &b"GET / HTTP/1.0\r\nHost: h\r\nConnection: keep-alive\r\n\r\n"[..],
        ))
        .await
        .unwrap();
        listener.wait_streams(1).await;

        let (sender, _) = listener.stream(0);
        let mut headers = ResponseHeaders::default();
        headers.set(MOSN_STATUS, "200");
        sender
            .append_headers(&ctx_for(&sender), StreamHeaders::Response(headers), true)
            .await
            .unwrap();

        let wire = transport.written_text();
        assert!(wire.contains("connection: keep-alive\r\n"), "{wire}");
        assert!(transport.closed.lock().is_none());
    }

    #[tokio::test]
    async fn test_hijack_echoes_request_headers_with_status() {
        let transport = MockTransport::new();
        let listener = CapturingListener::new();
        let conn = Http1ServerConnection::new(
            transport.clone(),
            listener.clone(),
            CodecConfig::default(),
        );

        conn.dispatch(ByteFrame::from(
            &b"GET /denied HTTP/1.1\r\nHost: h\r\nx-trace: t1\r\n\r\n"[..],
        ))
        .await
        .unwrap();
        listener.wait_streams(1).await;
        let (sender, receiver) = listener.stream(0);
        receiver.wait_events(1).await;

        let mut headers = match &receiver.events.lock()[0] {
            ReceiveEvent::Headers {
                headers: StreamHeaders::Request(headers),
                ..
            } => headers.clone(),
            other => panic!("expected request headers, got {other:?}"),
        };
        headers.set(MOSN_STATUS, "403");

        sender
            .append_headers(&ctx_for(&sender), StreamHeaders::Request(headers), true)
            .await
            .unwrap();

        let wire = transport.written_text();
        assert!(wire.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{wire}");
        assert!(wire.contains("x-trace: t1\r\n"), "request headers must be echoed");
        assert!(!wire.contains("mosn-"), "internal keys on the wire: {wire}");
    }

    #[tokio::test]
    async fn test_second_request_waits_for_first_response() {
        let log = EventLog::new();
        let transport = MockTransport::with_log(log.clone());
        let listener = AutoResponder::new(log.clone(), Duration::from_millis(10));
        let conn = Http1ServerConnection::new(transport, listener, CodecConfig::default());

        conn.dispatch(ByteFrame::from(
            &b"GET /one HTTP/1.1\r\nHost: h\r\n\r\nGET /two HTTP/1.1\r\nHost: h\r\n\r\n"[..],
        ))
        .await
        .unwrap();

        log.wait_for("req2-headers").await;
        let entries = log.snapshot();
        let first_headers = entries.iter().position(|e| e == "req1-headers").unwrap();
        let first_write = entries.iter().position(|e| e == "transport-write").unwrap();
        let second_headers = entries.iter().position(|e| e == "req2-headers").unwrap();

        assert!(first_headers < first_write, "{entries:?}");
        assert!(
            first_write < second_headers,
            "second request delivered before first response was written: {entries:?}"
        );
    }

    #[tokio::test]
    async fn test_read_disable_defers_request_delivery() {
        let transport = MockTransport::new();
        let listener = CapturingListener::deferring();
        let conn =
            Http1ServerConnection::new(transport, listener.clone(), CodecConfig::default());

        conn.dispatch(ByteFrame::from(
            &b"POST /p HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello"[..],
        ))
        .await
        .unwrap();
        listener.wait_streams(1).await;
        let (sender, receiver) = listener.stream(0);

        tokio::task::yield_now().await;
        assert_eq!(receiver.event_count(), 0, "delivery must be deferred");

        sender.read_disable(false).await;
        receiver.wait_events(2).await;

        let events = receiver.events.lock();
        assert!(matches!(events[0], ReceiveEvent::Headers { .. }));
        assert!(matches!(
            &events[1],
            ReceiveEvent::Data { data, .. } if data.as_ref() == b"hello"
        ));
    }

    #[tokio::test]
    async fn test_balanced_read_disable_delivers_exactly_once() {
        let transport = MockTransport::new();
        let listener = CapturingListener::deferring();
        let conn =
            Http1ServerConnection::new(transport, listener.clone(), CodecConfig::default());

        conn.dispatch(ByteFrame::from(&b"GET / HTTP/1.1\r\nHost: h\r\n\r\n"[..]))
            .await
            .unwrap();
        listener.wait_streams(1).await;
        let (sender, receiver) = listener.stream(0);

        // Nested disable: only the final enable may deliver.
        sender.read_disable(true).await;
        sender.read_disable(false).await;
        tokio::task::yield_now().await;
        assert_eq!(receiver.event_count(), 0);

        sender.read_disable(false).await;
        receiver.wait_events(1).await;

        // Further toggles must not re-deliver.
        sender.read_disable(true).await;
        sender.read_disable(false).await;
        tokio::task::yield_now().await;
        assert_eq!(receiver.event_count(), 1);
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let transport = MockTransport::new();
        let listener = CapturingListener::new();
        let conn = Http1ServerConnection::new(
            transport.clone(),
            listener.clone(),
            CodecConfig::default(),
        );

        conn.dispatch(ByteFrame::from(&b"GET / HTTP/1.1\r\nHost: h\r\n\r\n"[..]))
            .await
            .unwrap();
        listener.wait_streams(1).await;
        let (sender, _) = listener.stream(0);

        let mut headers = ResponseHeaders::default();
        headers.set(MOSN_STATUS, "200");
        sender
            .append_headers(&ctx_for(&sender), StreamHeaders::Response(headers), true)
            .await
            .unwrap();
        let written = transport.written.lock().len();

        sender
            .append_data(&ctx_for(&sender), Bytes::from_static(b"late"), true)
            .await
            .unwrap();
        assert_eq!(transport.written.lock().len(), written, "no double send");
    }
}
