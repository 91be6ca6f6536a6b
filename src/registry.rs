//! Process-wide protocol registry. Codecs register a factory under their
//! protocol identifier; the listener layer sniffs initial bytes against every
//! registered codec to pick one.

use crate::detect::MatchResult;
use crate::types::{
    ClientStreamConnection, ConnectionEventListener, ProtocolId, ServerStreamConnection,
    ServerStreamListener, Transport,
};
use anyhow::Result;
use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::Arc;

/// Builds stream connections for one wire protocol.
pub trait StreamConnFactory: Send + Sync {
    fn create_client_stream(
        &self,
        conn: Arc<dyn Transport>,
        conn_listener: Option<Arc<dyn ConnectionEventListener>>,
    ) -> Arc<dyn ClientStreamConnection>;

    fn create_server_stream(
        &self,
        conn: Arc<dyn Transport>,
        listener: Arc<dyn ServerStreamListener>,
    ) -> Arc<dyn ServerStreamConnection>;

    /// Protocols without multiplexed bidirectional semantics must refuse
    /// loudly instead of handing back a dead connection.
    fn create_bidirect_stream(
        &self,
        conn: Arc<dyn Transport>,
        conn_listener: Option<Arc<dyn ConnectionEventListener>>,
        listener: Arc<dyn ServerStreamListener>,
    ) -> Result<Arc<dyn ClientStreamConnection>>;

    /// Sniff the initial bytes of a new connection.
    fn protocol_match(&self, magic: &[u8]) -> MatchResult;
}

lazy_static! {
    static ref FACTORIES: DashMap<ProtocolId, Arc<dyn StreamConnFactory>> = DashMap::new();
}

/// Register a codec factory under its protocol identifier. Re-registering
/// replaces the previous factory.
pub fn register(protocol: ProtocolId, factory: Arc<dyn StreamConnFactory>) {
    FACTORIES.insert(protocol, factory);
}

pub fn factory_for(protocol: ProtocolId) -> Option<Arc<dyn StreamConnFactory>> {
    FACTORIES.get(protocol).map(|entry| entry.value().clone())
}

/// Outcome of sniffing a connection against all registered codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolGuess {
    Matched(ProtocolId),
    /// At least one codec needs more bytes; keep reading and retry.
    Again,
    /// No registered codec recognises the bytes.
    Failed,
}

pub fn match_protocol(magic: &[u8]) -> ProtocolGuess {
    let mut undecided = false;
    for entry in FACTORIES.iter() {
        match entry.value().protocol_match(magic) {
            MatchResult::Matched => return ProtocolGuess::Matched(*entry.key()),
            MatchResult::Again => undecided = true,
            MatchResult::Failed => {}
        }
    }
    if undecided {
        ProtocolGuess::Again
    } else {
        ProtocolGuess::Failed
    }
}
