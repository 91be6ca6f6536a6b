//! Parsed HTTP/1 messages, the blocking message reader that drives the
//! off-the-shelf head parser over the rendezvous, and the wire encoders.
//!
//! Bodies are fully buffered: the codec delivers a message's body as one
//! piece, so chunked input is decoded here and every outbound message is
//! framed with `Content-Length`.

use crate::config::CodecConfig;
use crate::headers::INTERNAL_KEYS;
use crate::rendezvous::BufferRendezvous;
use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::sync::Arc;

/// Parsed HTTP/1 request: head fields plus a fully buffered body.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for RequestMessage {
    fn default() -> Self {
        Self {
            method: Method::GET,
            path: "/".to_string(),
            query: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl RequestMessage {
    pub fn host(&self) -> Option<&str> {
        self.headers.get(HOST).and_then(|v| v.to_str().ok())
    }

    pub fn is_http11(&self) -> bool {
        self.version == Version::HTTP_11
    }

    /// Whether the peer asked for the connection to be torn down after this
    /// exchange: explicit `Connection: close`, or HTTP/1.0 without
    /// `Connection: keep-alive`.
    pub fn connection_close(&self) -> bool {
        connection_close(&self.headers, self.version)
    }
}

/// Parsed HTTP/1 response. The status is kept as a raw `u16` so an
/// unparseable internal status key can flow through as 0; the upper layer
/// validates.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub status: u16,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for ResponseMessage {
    fn default() -> Self {
        Self {
            status: 200,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl ResponseMessage {
    pub fn connection_close(&self) -> bool {
        connection_close(&self.headers, self.version)
    }

    pub fn set_connection_close(&mut self) {
        self.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
}

fn connection_close(headers: &HeaderMap, version: Version) -> bool {
    if let Some(tokens) = headers.get(CONNECTION).and_then(|v| v.to_str().ok()) {
        for token in tokens.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                return true;
            }
            if token.eq_ignore_ascii_case("keep-alive") {
                return false;
            }
        }
    }
    // HTTP/1.0 closes by default.
    version == Version::HTTP_10
}

enum BodyFraming {
    Length(usize),
    Chunked,
    Unframed,
}

fn body_framing(headers: &HeaderMap) -> Result<BodyFraming> {
    if let Some(te) = headers.get(TRANSFER_ENCODING).and_then(|v| v.to_str().ok()) {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
    }
    if let Some(cl) = headers.get(CONTENT_LENGTH) {
        let n = cl
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .context("invalid content-length")?;
        return Ok(BodyFraming::Length(n));
    }
    Ok(BodyFraming::Unframed)
}

/// 1xx, 204 and 304 responses never carry a body.
fn bodyless_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

struct Head {
    head_len: usize,
    headers: HeaderMap,
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for h in parsed {
        let entry = (
            HeaderName::from_bytes(h.name.as_bytes()),
            HeaderValue::from_bytes(h.value),
        );
        if let (Ok(name), Ok(value)) = entry {
            headers.append(name, value);
        }
    }
    headers
}

/// Buffered message reader over the rendezvous — the parser side of the
/// codec. One instance per serve loop; leftover bytes after a message stay
/// buffered for the next call, which is how back-to-back keep-alive requests
/// on one connection are handled.
pub struct MessageReader {
    rendezvous: Arc<BufferRendezvous>,
    buf: BytesMut,
    chunk: Vec<u8>,
    max_header_bytes: usize,
    max_headers: usize,
    eof: bool,
}

impl MessageReader {
    pub fn new(rendezvous: Arc<BufferRendezvous>, config: &CodecConfig) -> Self {
        Self {
            rendezvous,
            buf: BytesMut::new(),
            chunk: vec![0u8; config.read_chunk_size],
            max_header_bytes: config.max_header_bytes,
            max_headers: config.max_headers,
            eof: false,
        }
    }

    /// Pull one chunk from the rendezvous into the accumulation buffer.
    /// Returns false at end-of-stream.
    async fn fill(&mut self) -> bool {
        if self.eof {
            return false;
        }
        let n = self.rendezvous.read(&mut self.chunk).await;
        if n == 0 {
            self.eof = true;
            return false;
        }
        self.buf.extend_from_slice(&self.chunk[..n]);
        true
    }

    /// Blocking-read one complete request.
    pub async fn read_request(&mut self) -> Result<RequestMessage> {
        loop {
            if let Some(message) = self.try_parse_request()? {
                return Ok(message);
            }
            if !self.fill().await {
                bail!("connection closed");
            }
        }
    }

    /// Blocking-read one complete response. A response without explicit
    /// framing is delimited by connection close (RFC 7230 §3.3.3), so
    /// end-of-stream can complete a message here.
    pub async fn read_response(&mut self) -> Result<ResponseMessage> {
        loop {
            if let Some(message) = self.try_parse_response()? {
                return Ok(message);
            }
            if !self.fill().await {
                // One more attempt: EOF finalizes a read-to-close body.
                if let Some(message) = self.try_parse_response()? {
                    return Ok(message);
                }
                bail!("connection closed");
            }
        }
    }

    fn check_head_limit(&self) -> Result<()> {
        if self.buf.len() > self.max_header_bytes {
            bail!(
                "message head exceeds {} bytes before completing",
                self.max_header_bytes
            );
        }
        Ok(())
    }

    fn try_parse_request(&mut self) -> Result<Option<RequestMessage>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let (head, method, path, query, version) = {
            let mut storage = vec![httparse::EMPTY_HEADER; self.max_headers];
            let mut parsed = httparse::Request::new(&mut storage);
            match parsed.parse(&self.buf).context("malformed request head")? {
                httparse::Status::Partial => {
                    self.check_head_limit()?;
                    return Ok(None);
                }
                httparse::Status::Complete(head_len) => {
                    let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
                        .context("malformed request method")?;
                    let (path, query) = split_target(parsed.path.unwrap_or("/"));
                    let version = match parsed.version {
                        Some(0) => Version::HTTP_10,
                        _ => Version::HTTP_11,
                    };
                    let head = Head {
                        head_len,
                        headers: collect_headers(parsed.headers),
                    };
                    (head, method, path, query, version)
                }
            }
        };

        let (body, consumed) = match body_framing(&head.headers)? {
            BodyFraming::Length(n) => {
                if self.buf.len() < head.head_len + n {
                    return Ok(None);
                }
                (
                    Bytes::copy_from_slice(&self.buf[head.head_len..head.head_len + n]),
                    head.head_len + n,
                )
            }
            BodyFraming::Chunked => match decode_chunked(&self.buf[head.head_len..])? {
                Some((body, after_head)) => (body, head.head_len + after_head),
                None => return Ok(None),
            },
            // Requests carry no body unless framed.
            BodyFraming::Unframed => (Bytes::new(), head.head_len),
        };

        self.buf.advance(consumed);
        Ok(Some(RequestMessage {
            method,
            path,
            query,
            version,
            headers: head.headers,
            body,
        }))
    }

    fn try_parse_response(&mut self) -> Result<Option<ResponseMessage>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let (head, status, version) = {
            let mut storage = vec![httparse::EMPTY_HEADER; self.max_headers];
            let mut parsed = httparse::Response::new(&mut storage);
            match parsed.parse(&self.buf).context("malformed response head")? {
                httparse::Status::Partial => {
                    self.check_head_limit()?;
                    return Ok(None);
                }
                httparse::Status::Complete(head_len) => {
                    let status = parsed.code.unwrap_or(0);
                    let version = match parsed.version {
                        Some(0) => Version::HTTP_10,
                        _ => Version::HTTP_11,
                    };
                    let head = Head {
                        head_len,
                        headers: collect_headers(parsed.headers),
                    };
                    (head, status, version)
                }
            }
        };

        let (body, consumed) = match body_framing(&head.headers)? {
            BodyFraming::Length(n) => {
                if self.buf.len() < head.head_len + n {
                    return Ok(None);
                }
                (
                    Bytes::copy_from_slice(&self.buf[head.head_len..head.head_len + n]),
                    head.head_len + n,
                )
            }
            BodyFraming::Chunked => match decode_chunked(&self.buf[head.head_len..])? {
                Some((body, after_head)) => (body, head.head_len + after_head),
                None => return Ok(None),
            },
            BodyFraming::Unframed => {
                if bodyless_status(status) {
                    (Bytes::new(), head.head_len)
                } else if self.eof {
                    // Delimited by connection close: the rest is the body.
                    (
                        Bytes::copy_from_slice(&self.buf[head.head_len..]),
                        self.buf.len(),
                    )
                } else {
                    return Ok(None);
                }
            }
        };

        self.buf.advance(consumed);
        Ok(Some(ResponseMessage {
            status,
            version,
            headers: head.headers,
            body,
        }))
    }
}

/// Split a request target into path and optional query.
fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) if !query.is_empty() => (path.to_string(), Some(query.to_string())),
        Some((path, _)) => (path.to_string(), None),
        None => (target.to_string(), None),
    }
}

/// Decode a chunked body. Returns `Ok(None)` when more bytes are needed,
/// otherwise the decoded body and the number of input bytes consumed
/// (terminal chunk and trailer section included — trailers are skipped, not
/// reinjected).
fn decode_chunked(data: &[u8]) -> Result<Option<(Bytes, usize)>> {
    let mut decoded = BytesMut::new();
    let mut pos = 0;

    loop {
        let line_end = match find_crlf(data, pos) {
            Some(idx) => idx,
            None => return Ok(None),
        };

        let size_bytes = &data[pos..line_end];
        let size_part = match size_bytes.iter().position(|&b| b == b';') {
            Some(semi) => &size_bytes[..semi],
            None => size_bytes,
        };
        let size_str = std::str::from_utf8(size_part).context("malformed chunk size")?;
        let chunk_size =
            usize::from_str_radix(size_str.trim(), 16).context("malformed chunk size")?;

        pos = line_end + 2;

        if chunk_size == 0 {
            if pos + 2 > data.len() {
                return Ok(None);
            }
            if &data[pos..pos + 2] == b"\r\n" {
                return Ok(Some((decoded.freeze(), pos + 2)));
            }
            // Trailer section: skip to the blank line that ends it.
            return match find_crlf_crlf(data, pos) {
                Some(idx) => Ok(Some((decoded.freeze(), idx + 4))),
                None => Ok(None),
            };
        }

        if pos + chunk_size + 2 > data.len() {
            return Ok(None);
        }
        decoded.extend_from_slice(&data[pos..pos + chunk_size]);
        pos += chunk_size;
        if &data[pos..pos + 2] != b"\r\n" {
            bail!("malformed chunk boundary");
        }
        pos += 2;
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

fn find_crlf_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| from + p)
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Headers the encoders never emit: internal keys stay in-process, and the
/// framing headers are replaced because bodies are re-framed with
/// `Content-Length` after buffering.
fn skip_on_wire(name: &HeaderName) -> bool {
    INTERNAL_KEYS.contains(&name.as_str())
        || name == CONTENT_LENGTH
        || name == TRANSFER_ENCODING
}

/// Serialize a request for the wire.
pub fn encode_request(request: &RequestMessage) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + request.body.len());
    out.put_slice(request.method.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(request.path.as_bytes());
    if let Some(query) = &request.query {
        out.put_u8(b'?');
        out.put_slice(query.as_bytes());
    }
    out.put_u8(b' ');
    out.put_slice(version_str(request.version).as_bytes());
    out.put_slice(b"\r\n");

    for (name, value) in request.headers.iter() {
        if skip_on_wire(name) {
            continue;
        }
        put_header(&mut out, name, value);
    }
    if !request.body.is_empty() {
        put_content_length(&mut out, request.body.len());
    }
    out.put_slice(b"\r\n");
    out.put_slice(&request.body);
    out.freeze()
}

/// Serialize a response for the wire. A zero status (unparseable internal
/// status key) falls back to 200.
pub fn encode_response(response: &ResponseMessage) -> Bytes {
    let status = if response.status == 0 {
        200
    } else {
        response.status
    };
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("OK");

    let mut out = BytesMut::with_capacity(256 + response.body.len());
    out.put_slice(version_str(response.version).as_bytes());
    out.put_u8(b' ');
    out.put_slice(status.to_string().as_bytes());
    out.put_u8(b' ');
    out.put_slice(reason.as_bytes());
    out.put_slice(b"\r\n");

    for (name, value) in response.headers.iter() {
        if skip_on_wire(name) {
            continue;
        }
        put_header(&mut out, name, value);
    }
    // 1xx/204/304 responses must carry neither Content-Length nor a body
    // (RFC 7230 §3.3.2).
    if !bodyless_status(status) {
        put_content_length(&mut out, response.body.len());
    }
    out.put_slice(b"\r\n");
    if !bodyless_status(status) {
        out.put_slice(&response.body);
    }
    out.freeze()
}

fn put_header(out: &mut BytesMut, name: &HeaderName, value: &HeaderValue) {
    out.put_slice(name.as_str().as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

fn put_content_length(out: &mut BytesMut, len: usize) {
    out.put_slice(b"content-length: ");
    out.put_slice(len.to_string().as_bytes());
    out.put_slice(b"\r\n");
}
