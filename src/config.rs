use serde::{Deserialize, Serialize};

/// HTTP/1 codec buffer sizes and parse limits.
/// Nests under the proxy's `codec.http1` section in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Bytes pulled from the rendezvous per parser fill. Default: 4096.
    pub read_chunk_size: usize,
    /// Maximum accumulated message head size before the connection is torn
    /// down (bytes). Default: 8192.
    pub max_header_bytes: usize,
    /// Maximum number of headers in a message head. Default: 64.
    pub max_headers: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 4096,
            max_header_bytes: 8192,
            max_headers: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CodecConfig::default();
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.max_header_bytes, 8192);
        assert_eq!(config.max_headers, 64);
    }
}
