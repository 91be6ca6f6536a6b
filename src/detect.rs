/// Outcome of sniffing the initial bytes of a freshly accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The bytes open an exchange of this protocol.
    Matched,
    /// Too few bytes to decide; feed more and retry.
    Again,
    /// Definitely not this protocol.
    Failed,
}

const MIN_METHOD_LEN: usize = 3; // GET
const MAX_METHOD_LEN: usize = 7; // OPTIONS, CONNECT

const METHODS: [&[u8]; 8] = [
    b"OPTIONS", b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"TRACE", b"CONNECT",
];

/// Decide whether `magic` opens an HTTP/1 exchange by matching the method
/// token at every prefix length from 3 to 7 bytes. Case-sensitive: method
/// tokens are uppercase on the wire. Allocation-free.
pub fn protocol_match(magic: &[u8]) -> MatchResult {
    if magic.len() < MIN_METHOD_LEN {
        return MatchResult::Again;
    }
    let size = magic.len().min(MAX_METHOD_LEN);
    for len in MIN_METHOD_LEN..=size {
        if METHODS.contains(&&magic[..len]) {
            return MatchResult::Matched;
        }
    }
    if size < MAX_METHOD_LEN {
        MatchResult::Again
    } else {
        MatchResult::Failed
    }
}
