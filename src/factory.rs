use crate::config::CodecConfig;
use crate::detect::{protocol_match, MatchResult};
use crate::registry::{self, StreamConnFactory};
use crate::stream::{Http1ClientConnection, Http1ServerConnection};
use crate::types::{
    ClientStreamConnection, ConnectionEventListener, ServerStreamConnection, ServerStreamListener,
    Transport, HTTP1,
};
use anyhow::{anyhow, Result};
use std::sync::Arc;

/// Builds HTTP/1 stream connections over a transport connection.
pub struct Http1StreamFactory {
    config: CodecConfig,
}

impl Http1StreamFactory {
    pub fn new() -> Self {
        Self {
            config: CodecConfig::default(),
        }
    }

    pub fn with_config(config: CodecConfig) -> Self {
        Self { config }
    }
}

impl Default for Http1StreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConnFactory for Http1StreamFactory {
    fn create_client_stream(
        &self,
        conn: Arc<dyn Transport>,
        conn_listener: Option<Arc<dyn ConnectionEventListener>>,
    ) -> Arc<dyn ClientStreamConnection> {
        Http1ClientConnection::new(conn, conn_listener, self.config.clone())
    }

    fn create_server_stream(
        &self,
        conn: Arc<dyn Transport>,
        listener: Arc<dyn ServerStreamListener>,
    ) -> Arc<dyn ServerStreamConnection> {
        Http1ServerConnection::new(conn, listener, self.config.clone())
    }

    fn create_bidirect_stream(
        &self,
        _conn: Arc<dyn Transport>,
        _conn_listener: Option<Arc<dyn ConnectionEventListener>>,
        _listener: Arc<dyn ServerStreamListener>,
    ) -> Result<Arc<dyn ClientStreamConnection>> {
        // HTTP/1 framing carries one request/response pair at a time.
        Err(anyhow!(
            "http1 has no multiplexed bidirectional streaming"
        ))
    }

    fn protocol_match(&self, magic: &[u8]) -> MatchResult {
        protocol_match(magic)
    }
}

/// Register the HTTP/1 codec with the protocol registry. The proxy calls
/// this once at startup; re-registration is harmless.
pub fn register_http1() {
    registry::register(HTTP1, Arc::new(Http1StreamFactory::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::MockTransport;
    use crate::types::StreamConnection;

    #[tokio::test]
    async fn test_bidirectional_is_rejected() {
        struct NoopListener;

        #[async_trait::async_trait]
        impl ServerStreamListener for NoopListener {
            async fn new_stream_detect(
                &self,
                _ctx: crate::types::StreamContext,
                _sender: Arc<dyn crate::types::StreamSender>,
                _span: tracing::Span,
            ) -> Arc<dyn crate::types::StreamReceiveListener> {
                unreachable!("no streams expected")
            }
        }

        let factory = Http1StreamFactory::new();
        let result = factory.create_bidirect_stream(
            MockTransport::new(),
            None,
            Arc::new(NoopListener),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_factory_builds_both_roles() {
        let factory = Http1StreamFactory::new();

        let client = factory.create_client_stream(MockTransport::new(), None);
        assert_eq!(client.protocol(), HTTP1);
        assert_eq!(client.active_streams_num(), 0);

        struct IdleListener;

        #[async_trait::async_trait]
        impl ServerStreamListener for IdleListener {
            async fn new_stream_detect(
                &self,
                _ctx: crate::types::StreamContext,
                _sender: Arc<dyn crate::types::StreamSender>,
                _span: tracing::Span,
            ) -> Arc<dyn crate::types::StreamReceiveListener> {
                unreachable!("no streams expected")
            }
        }

        let server = factory.create_server_stream(MockTransport::new(), Arc::new(IdleListener));
        assert_eq!(server.protocol(), HTTP1);
        assert_eq!(server.active_streams_num(), 0);
    }
}
