//! SIP message model and wire codec.
//!
//! Messages keep their headers as an ordered multimap with case-insensitive
//! lookup; OCS cares about both header multiplicity (multiple `Contact` or
//! `Supported` lines) and, for some auth headers, about position.

use super::types::MESSAGE_SIZE_LIMIT;
use bytes::{Buf, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed start line: {0}")]
    StartLine(String),
    #[error("malformed header line: {0}")]
    HeaderLine(String),
    #[error("message is not valid UTF-8")]
    Encoding,
    #[error("declared body length {0} exceeds limit")]
    BodyTooLarge(usize),
    #[error("unterminated message exceeds buffer limit")]
    Oversized,
    #[error("datagram truncated: body shorter than Content-Length")]
    Truncated,
}

/// Ordered, case-insensitive header multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn add(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    /// Insert at a fixed position, clamped to the current length. The auth
    /// engine places `Proxy-Authorization` near the top of the header block
    /// the way OCS expects.
    pub fn insert(&mut self, pos: usize, name: &str, value: &str) {
        let pos = pos.min(self.0.len());
        self.0.insert(pos, (name.to_string(), value.to_string()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `idx`-th instance of `name` (0-based).
    pub fn get_instance<'a>(&'a self, name: &'a str, idx: usize) -> Option<&'a str> {
        self.all(name).nth(idx)
    }

    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remove every instance of `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Remove every instance of `name`, then add one with `value`.
    pub fn replace(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.add(name, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A parsed SIP request or response.
///
/// `response == 0` means request. Responses carry the method recovered from
/// their `CSeq` header so per-method handling works on both kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SipMessage {
    pub response: u16,
    pub reason: String,
    pub method: String,
    /// Request-URI for requests; empty for responses.
    pub target: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        self.response == 0
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// CSeq header value, e.g. `"12 REGISTER"`.
    pub fn cseq_token(&self) -> Option<&str> {
        self.headers.get("CSeq")
    }

    /// Numeric part of the CSeq header.
    pub fn cseq_number(&self) -> Option<u32> {
        self.cseq_token()?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }

    /// Serialize for transmission. `Content-Length` is rewritten to the
    /// actual body length on the way out.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        if self.is_request() {
            out.push_str(&format!("{} {} SIP/2.0\r\n", self.method, self.target));
        } else {
            out.push_str(&format!("SIP/2.0 {} {}\r\n", self.response, self.reason));
        }
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn parse_start_line(line: &str, msg: &mut SipMessage) -> Result<(), ParseError> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut it = rest.splitn(2, ' ');
        let code = it
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| ParseError::StartLine(line.to_string()))?;
        msg.response = code;
        msg.reason = it.next().unwrap_or("").to_string();
        return Ok(());
    }

    let mut it = line.split(' ');
    let method = it.next().unwrap_or("");
    let target = it.next().unwrap_or("");
    let version = it.next().unwrap_or("");
    if method.is_empty()
        || target.is_empty()
        || version != "SIP/2.0"
        || !method.bytes().all(|b| b.is_ascii_uppercase() || b == b'_')
    {
        return Err(ParseError::StartLine(line.to_string()));
    }
    msg.method = method.to_string();
    msg.target = target.to_string();
    Ok(())
}

fn parse_header_block(block: &str) -> Result<SipMessage, ParseError> {
    let mut msg = SipMessage::default();
    let mut lines = block.split("\r\n");

    let start = lines
        .next()
        .ok_or_else(|| ParseError::StartLine(String::new()))?;
    parse_start_line(start, &mut msg)?;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header value.
            match msg.headers.0.last_mut() {
                Some((_, v)) => {
                    v.push(' ');
                    v.push_str(line.trim_start());
                }
                None => return Err(ParseError::HeaderLine(line.to_string())),
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::HeaderLine(line.to_string()))?;
        if name.is_empty() || name.contains(' ') {
            return Err(ParseError::HeaderLine(line.to_string()));
        }
        msg.headers.add(name, value.trim());
    }

    // Responses inherit their method from CSeq for per-method dispatch.
    if !msg.is_request() {
        if let Some(cseq) = msg.headers.get("CSeq") {
            if let Some(m) = cseq.split_whitespace().nth(1) {
                msg.method = m.to_string();
            }
        }
    }
    Ok(msg)
}

fn declared_body_len(msg: &SipMessage) -> usize {
    msg.headers
        .get("Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Incrementally parse one message out of a stream buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete message
/// (the caller awaits more bytes). Leading CR/LF between messages — including
/// the `\r\n\r\n` keep-alive — is consumed silently.
pub fn parse_message(buf: &mut BytesMut) -> Result<Option<SipMessage>, ParseError> {
    // Strip inter-message CRLF noise.
    while !buf.is_empty() && (buf[0] == b'\r' || buf[0] == b'\n') {
        buf.advance(1);
    }
    if buf.is_empty() {
        return Ok(None);
    }

    let header_end = match find_subsequence(buf, b"\r\n\r\n") {
        Some(idx) => idx,
        None => {
            if buf.len() > MESSAGE_SIZE_LIMIT {
                return Err(ParseError::Oversized);
            }
            return Ok(None);
        }
    };

    let block =
        std::str::from_utf8(&buf[..header_end]).map_err(|_| ParseError::Encoding)?;
    let mut msg = parse_header_block(block)?;

    let body_len = declared_body_len(&msg);
    if body_len > MESSAGE_SIZE_LIMIT {
        return Err(ParseError::BodyTooLarge(body_len));
    }
    let total = header_end + 4 + body_len;
    if buf.len() < total {
        // Body not fully buffered yet; wait for more input.
        return Ok(None);
    }

    msg.body = buf[header_end + 4..total].to_vec();
    buf.advance(total);
    Ok(Some(msg))
}

/// Parse one complete message from a datagram. A body shorter than the
/// declared `Content-Length` is a hard error: nothing more is coming.
pub fn parse_datagram(data: &[u8]) -> Result<SipMessage, ParseError> {
    let mut skip = 0;
    while skip < data.len() && (data[skip] == b'\r' || data[skip] == b'\n') {
        skip += 1;
    }
    let data = &data[skip..];

    let header_end = find_subsequence(data, b"\r\n\r\n")
        .ok_or_else(|| ParseError::StartLine(String::new()))?;
    let block =
        std::str::from_utf8(&data[..header_end]).map_err(|_| ParseError::Encoding)?;
    let mut msg = parse_header_block(block)?;

    let body_len = declared_body_len(&msg);
    if data.len() < header_end + 4 + body_len {
        return Err(ParseError::Truncated);
    }
    msg.body = data[header_end + 4..header_end + 4 + body_len].to_vec();
    Ok(msg)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// =============================================================================
// HEADER VALUE HELPERS
// =============================================================================

/// Extract the substring following `start` up to `end` (or the remainder when
/// `end` is absent or not found). Mirrors the attribute plucking OCS headers
/// require, e.g. `find_part(v, "reason=\"", Some("\""))`.
pub fn find_part(haystack: &str, start: &str, end: Option<&str>) -> Option<String> {
    let from = haystack.find(start)? + start.len();
    let rest = &haystack[from..];
    match end {
        Some(delim) => match rest.find(delim) {
            Some(to) => Some(rest[..to].to_string()),
            None => Some(rest.to_string()),
        },
        None => Some(rest.to_string()),
    }
}

/// Extract the bare URI from a `From`/`To`/`Contact` style header value:
/// angle-bracket form preferred, otherwise everything before `;`.
pub fn parse_uri(hdr: &str) -> Option<String> {
    let hdr = hdr.trim();
    if let Some(open) = hdr.find('<') {
        let rest = &hdr[open + 1..];
        let close = rest.find('>')?;
        return Some(rest[..close].to_string());
    }
    let uri = hdr.split(';').next()?.trim();
    if uri.is_empty() {
        None
    } else {
        Some(uri.to_string())
    }
}

/// Extract the `tag=` parameter from a `From`/`To` header value.
pub fn find_tag(hdr: &str) -> Option<String> {
    find_part(hdr, "tag=", Some(";")).or_else(|| find_part(hdr, "tag=", None))
}

/// Extract the `epid=` parameter from a `From`/`To` header value.
pub fn find_epid(hdr: &str) -> Option<String> {
    let epid = find_part(hdr, "epid=", Some(";")).or_else(|| find_part(hdr, "epid=", None))?;
    // A tag glued on the end (no separating `;`) is not part of the epid.
    Some(epid.split_whitespace().next().unwrap_or(&epid).to_string())
}
