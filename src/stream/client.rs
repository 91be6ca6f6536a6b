//! Client role: the proxy opens one stream at a time toward an upstream
//! peer, writes the request, and the parser task reads the response.

use super::{ConnectionBase, StreamCore};
use crate::buffer::ByteFrame;
use crate::config::CodecConfig;
use crate::headers::{extract_request_line, ResponseHeaders, StreamHeaders, MOSN_STATUS};
use crate::message::{encode_request, RequestMessage, ResponseMessage};
use crate::types::{
    next_stream_id, ClientStreamConnection, ConnectionEvent, ConnectionEventListener, CloseSource,
    FlushPolicy, ProtocolId, Stream, StreamConnection, StreamContext, StreamEventListener,
    StreamReceiveListener, StreamResetReason, StreamSender, Transport, HTTP1,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use http::{HeaderMap, HeaderValue, Method};
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tracing::{debug, error};

pub struct Http1ClientConnection {
    base: ConnectionBase,
    active: RwLock<Option<Arc<ClientStream>>>,
    conn_listener: Option<Arc<dyn ConnectionEventListener>>,
    weak: Weak<Self>,
}

impl Http1ClientConnection {
    pub fn new(
        conn: Arc<dyn Transport>,
        conn_listener: Option<Arc<dyn ConnectionEventListener>>,
        config: CodecConfig,
    ) -> Arc<Self> {
        let this = Arc::new_cyclic(|weak| Self {
            base: ConnectionBase::new(conn, config),
            active: RwLock::new(None),
            conn_listener,
            weak: weak.clone(),
        });

        let serving = this.clone();
        tokio::spawn(async move {
            if AssertUnwindSafe(serving.serve()).catch_unwind().await.is_err() {
                error!("http1 client serve task panicked, restarting once");
                let _ = AssertUnwindSafe(serving.serve()).catch_unwind().await;
            }
        });

        this
    }

    fn active_stream(&self) -> Option<Arc<ClientStream>> {
        self.active.read().clone()
    }

    pub(crate) fn clear_active(&self) {
        *self.active.write() = None;
    }

    async fn serve(&self) {
        let mut reader = self.base.reader();
        loop {
            let response = match reader.read_response().await {
                Ok(response) => response,
                Err(err) => {
                    if let Some(stream) = self.active_stream() {
                        stream.reset_stream(StreamResetReason::RemoteReset).await;
                        error!(error = %err, "http1 client codec task error");
                    }
                    return;
                }
            };

            let stream = match self.active_stream() {
                Some(stream) => stream,
                None => {
                    error!("http1 response arrived with no active stream");
                    return;
                }
            };

            // Evaluated before the response is handed off: delivery may be
            // deferred by read-disable, but the close decision is not.
            let close_conn = response.connection_close();
            stream.bind_response(response);

            if !stream.core.read_disabled() {
                stream.handle_response().await;
            }

            if close_conn {
                self.base
                    .conn
                    .close(FlushPolicy::NoFlush, CloseSource::LocalClose)
                    .await;
                if let Some(listener) = &self.conn_listener {
                    listener
                        .on_connection_event(ConnectionEvent::LocalClose)
                        .await;
                }
                return;
            }
        }
    }
}

#[async_trait]
impl StreamConnection for Http1ClientConnection {
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

#[async_trait]
impl ClientStreamConnection for Http1ClientConnection {
    async fn new_stream(&self, receiver: Arc<dyn StreamReceiveListener>) -> Arc<dyn StreamSender> {
        let id = next_stream_id();
        let stream = Arc::new(ClientStream {
            core: StreamCore::new(StreamContext::new(id, HTTP1)),
            connection: self.weak.clone(),
            receiver,
            request: Mutex::new(RequestMessage::default()),
            response: Mutex::new(None),
        });

        *self.active.write() = Some(stream.clone());
        stream
    }
}

/// One outbound request/response pair on a client connection.
pub struct ClientStream {
    pub(crate) core: StreamCore,
    connection: Weak<Http1ClientConnection>,
    receiver: Arc<dyn StreamReceiveListener>,
    request: Mutex<RequestMessage>,
    /// Parsed response pending delivery; `take` makes delivery idempotent.
    response: Mutex<Option<ResponseMessage>>,
}

impl ClientStream {
    fn connection(&self) -> Result<Arc<Http1ClientConnection>> {
        self.connection.upgrade().context("stream connection dropped")
    }

    pub(crate) fn bind_response(&self, response: ResponseMessage) {
        *self.response.lock() = Some(response);
    }

    async fn send_request(&self) -> Result<()> {
        let bytes = {
            let request = self.request.lock();
            encode_request(&request)
        };
        if let Err(err) = self.connection()?.base.write(bytes).await {
            error!(error = %err, "http1 client stream send error");
        }
        Ok(())
    }

    pub(crate) async fn handle_response(&self) {
        let response = match self.response.lock().take() {
            Some(response) => response,
            None => return,
        };

        let mut headers = ResponseHeaders(response.headers);
        headers.set(MOSN_STATUS, &response.status.to_string());
        debug!(stream_id = self.core.id, status = response.status, "http1 response ready");

        if let Ok(conn) = self.connection() {
            conn.clear_active();
        }

        let has_body = !response.body.is_empty();
        self.receiver
            .on_receive_headers(&self.core.ctx, StreamHeaders::Response(headers), !has_body)
            .await;
        if has_body {
            self.receiver
                .on_receive_data(&self.core.ctx, response.body, true)
                .await;
        }
    }
}

#[async_trait]
impl Stream for ClientStream {
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
impl StreamSender for ClientStream {
    async fn append_headers(
        &self,
        _ctx: &StreamContext,
        headers: StreamHeaders,
        end_stream: bool,
    ) -> Result<()> {
        let mut headers = match headers {
            StreamHeaders::Request(headers) => headers,
            StreamHeaders::Response(_) => {
                bail!("client stream expects request-shaped headers")
            }
        };

        // A bodyless request defaults to GET, one with a body to POST; the
        // internal method key overrides either.
        let default_method = if end_stream { Method::GET } else { Method::POST };

        let remote_addr = self.connection()?.base.conn.remote_addr();
        let line = extract_request_line(&mut headers, remote_addr);
        {
            let mut request = self.request.lock();
            request.method = line
                .method
                .as_deref()
                .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                .unwrap_or(default_method);
            request.path = line.path;
            request.query = line.query;
            request.headers = headers.0;
            if !line.host.is_empty() {
                if let Ok(host) = HeaderValue::from_str(&line.host) {
                    request.headers.insert(http::header::HOST, host);
                }
            }
        }

        if end_stream {
            self.send_request().await?;
        }
        Ok(())
    }

    async fn append_data(&self, _ctx: &StreamContext, data: Bytes, end_stream: bool) -> Result<()> {
        self.request.lock().body = data;
        if end_stream {
            self.send_request().await?;
        }
        Ok(())
    }

    async fn append_trailers(&self, _ctx: &StreamContext, _trailers: HeaderMap) -> Result<()> {
        self.send_request().await
    }

    async fn read_disable(&self, disable: bool) {
        if disable {
            self.core.disable_read();
        } else if self.core.enable_read() {
            self.handle_response().await;
        }
    }
}
