//! HTTP/1.x stream-connection codec for the proxy data plane.
//!
//! Sits between a raw byte transport and the proxy's uniform stream layer:
//! a detector classifies new connections, a per-connection parser task turns
//! wire framing into stream events, and a single-slot rendezvous bridges the
//! transport's dispatch model with the parser's blocking reads while
//! backpressuring the peer.

pub mod buffer;
pub mod config;
pub mod detect;
pub mod factory;
pub mod headers;
pub mod message;
pub mod registry;
pub mod rendezvous;
pub mod stream;
pub mod types;

// Re-exports
pub use buffer::ByteFrame;
pub use config::CodecConfig;
pub use detect::{protocol_match, MatchResult};
pub use factory::{register_http1, Http1StreamFactory};
pub use headers::{RequestHeaders, ResponseHeaders, StreamHeaders};
pub use message::{RequestMessage, ResponseMessage};
pub use registry::{factory_for, match_protocol, register, ProtocolGuess, StreamConnFactory};
pub use rendezvous::BufferRendezvous;
pub use stream::{Http1ClientConnection, Http1ServerConnection};
pub use types::{
    next_stream_id, ClientStreamConnection, CloseSource, ConnectionEvent,
    ConnectionEventListener, FlushPolicy, ProtocolId, ServerStreamConnection,
    ServerStreamListener, Stream, StreamConnection, StreamContext, StreamEventListener,
    StreamReceiveListener, StreamResetReason, StreamSender, Transport, HTTP1,
};
