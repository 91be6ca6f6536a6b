//! Contracts between the codec and the layers above and below it: the
//! transport connection underneath, and the proxy's uniform stream layer on
//! top. Every wire protocol the data plane speaks implements these.

use crate::buffer::ByteFrame;
use crate::headers::StreamHeaders;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Wire-protocol identifier used by the protocol registry.
pub type ProtocolId = &'static str;

/// Identifier the HTTP/1 codec registers under.
pub const HTTP1: ProtocolId = "Http1";

static STREAM_ID: AtomicU64 = AtomicU64::new(0);

/// Process-local monotonic stream id.
pub fn next_stream_id() -> u64 {
    STREAM_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Per-stream context propagated across async boundaries and handed to every
/// receiver callback.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub stream_id: u64,
    pub protocol: ProtocolId,
}

impl StreamContext {
    pub fn new(stream_id: u64, protocol: ProtocolId) -> Self {
        Self { stream_id, protocol }
    }
}

/// Why a stream was torn down before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetReason {
    LocalReset,
    RemoteReset,
    ConnectionTermination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    NoFlush,
    FlushWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSource {
    LocalClose,
    RemoteClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    LocalClose,
    RemoteClose,
}

/// The bidirectional byte connection below the codec.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write(&self, buf: Bytes) -> Result<()>;
    async fn close(&self, flush: FlushPolicy, source: CloseSource);
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// One request/response pair, uniform across wire protocols.
#[async_trait]
pub trait Stream: Send + Sync {
    fn id(&self) -> u64;
    fn add_event_listener(&self, listener: Arc<dyn StreamEventListener>);
    async fn reset_stream(&self, reason: StreamResetReason);
    async fn destroy_stream(&self);
}

/// Lifecycle callbacks registered on a stream.
#[async_trait]
pub trait StreamEventListener: Send + Sync {
    async fn on_reset_stream(&self, reason: StreamResetReason);
    async fn on_destroy_stream(&self) {}
}

/// Proxy → codec send half of a stream.
#[async_trait]
pub trait StreamSender: Stream {
    async fn append_headers(
        &self,
        ctx: &StreamContext,
        headers: StreamHeaders,
        end_stream: bool,
    ) -> Result<()>;
    async fn append_data(&self, ctx: &StreamContext, data: Bytes, end_stream: bool) -> Result<()>;
    async fn append_trailers(&self, ctx: &StreamContext, trailers: HeaderMap) -> Result<()>;
    /// Application-level pause. `true` increments the disable count, `false`
    /// decrements it; a transition to non-positive delivers any message that
    /// was parsed while delivery was paused.
    async fn read_disable(&self, disable: bool);
}

/// Codec → proxy receive half of a stream. Callbacks for one stream are
/// strictly ordered; end-of-stream is signalled on the last callback only.
#[async_trait]
pub trait StreamReceiveListener: Send + Sync {
    async fn on_receive_headers(&self, ctx: &StreamContext, headers: StreamHeaders, end_stream: bool);
    async fn on_receive_data(&self, ctx: &StreamContext, data: Bytes, end_stream: bool);
    async fn on_receive_trailers(&self, ctx: &StreamContext, trailers: HeaderMap);
}

/// Connection-level events the codec reports upward.
#[async_trait]
pub trait ConnectionEventListener: Send + Sync {
    async fn on_connection_event(&self, event: ConnectionEvent);
}

/// Server-side connection listener. The codec calls `new_stream_detect` for
/// every inbound request; the returned receiver gets that stream's events.
#[async_trait]
pub trait ServerStreamListener: Send + Sync {
    async fn new_stream_detect(
        &self,
        ctx: StreamContext,
        sender: Arc<dyn StreamSender>,
        span: tracing::Span,
    ) -> Arc<dyn StreamReceiveListener>;
}

/// The codec endpoint attached to one transport connection. Hosts the parser
/// task and at most one active stream.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    /// Feed bytes received from the transport into the codec. Returns once
    /// the parser has drained the frame.
    async fn dispatch(&self, frame: ByteFrame) -> Result<()>;

    fn protocol(&self) -> ProtocolId;

    /// 0 or 1 — HTTP/1 carries at most one in-flight exchange per connection.
    fn active_streams_num(&self) -> usize;

    /// Tear the codec down; the parser task exits through its blocking read.
    fn reset(&self, reason: StreamResetReason);

    /// HTTP/1 has no GOAWAY equivalent.
    fn go_away(&self) {}
}

/// Client-side stream connection: the proxy opens streams toward the peer.
#[async_trait]
pub trait ClientStreamConnection: StreamConnection {
    async fn new_stream(&self, receiver: Arc<dyn StreamReceiveListener>) -> Arc<dyn StreamSender>;
}

/// Server-side stream connection: streams are created by inbound requests.
pub trait ServerStreamConnection: StreamConnection {}
