// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal HTTP/1.1 over the carrier socket.
//!
//! Just enough client for the Fortigate portal exchange: request
//! serialisation, response parsing via `httparse`, Content-Length and
//! chunked bodies, and a cookie jar for `SVPNCOOKIE` and friends. Not a
//! general HTTP client; redirects and retries are the caller's business.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Responses larger than this are treated as hostile.
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Read chunk for the carrier.
const READ_CHUNK: usize = 4096;

/// HTTP-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The response could not be parsed.
    Malformed(&'static str),
    /// The peer closed mid-response.
    Truncated,
    /// The response exceeded [`MAX_RESPONSE_SIZE`].
    TooLarge,
    /// An unexpected status code; carries code and reason.
    Status(u16, String),
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(what) => write!(f, "malformed response: {}", what),
            Self::Truncated => write!(f, "response truncated"),
            Self::TooLarge => write!(f, "response too large"),
            Self::Status(code, reason) => write!(f, "unexpected status {} {}", code, reason),
        }
    }
}

impl std::error::Error for HttpError {}

// ============================================================================
// Carrier abstraction
// ============================================================================

/// Blocking-style byte transport the portal talks through.
///
/// Implemented by the TLS carrier; tests substitute a scripted mock.
/// `reopen` re-establishes the transport after a keep-alive close; the
/// implementation must re-verify the certificate fingerprint there.
pub trait Carrier {
    /// Write all bytes within `timeout`.
    fn send_all(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Read some bytes within `timeout`; 0 means the peer closed.
    fn recv_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Re-establish the underlying transport.
    fn reopen(&mut self) -> Result<()>;
}

// ============================================================================
// Requests
// ============================================================================

/// Serialise one request. `body` is appended verbatim; the caller owns
/// its scrubbing when it carries credentials.
pub fn write_request(
    verb: &str,
    path: &str,
    host: &str,
    cookie_header: Option<&str>,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(verb.as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let mut header = |name: &str, value: &str| {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    };

    header("Host", host);
    header("Connection", "keep-alive");
    header("Accept", "text/html");
    header("User-Agent", "Mozilla/5.0");
    for (name, value) in extra_headers {
        header(name, value);
    }
    if let Some(cookies) = cookie_header {
        header("Cookie", cookies);
    }
    if !body.is_empty() || verb == "POST" {
        header("Content-Length", &body.len().to_string());
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

// ============================================================================
// Responses
// ============================================================================

/// A parsed response.
#[derive(Debug, Clone)]
pub struct Answer {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Headers in arrival order (names lowercased).
    pub headers: Vec<(String, String)>,
    /// Decoded body.
    pub body: Vec<u8>,
}

impl Answer {
    /// First header with the given (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a repeatable header (Set-Cookie).
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read and parse one response from the carrier.
pub fn read_answer<C: Carrier + ?Sized>(carrier: &mut C, timeout: Duration) -> Result<Answer> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut tmp = [0u8; READ_CHUNK];

    // Accumulate until the header block parses completely.
    let (header_len, status, reason, headers) = loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; 48];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&buf) {
                Ok(httparse::Status::Complete(n)) => {
                    let status = response
                        .code
                        .ok_or(Error::Http(HttpError::Malformed("missing status")))?;
                    let reason = response.reason.unwrap_or("").to_string();
                    let headers: Vec<(String, String)> = response
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_ascii_lowercase(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect();
                    Some((n, status, reason, headers))
                }
                Ok(httparse::Status::Partial) => None,
                Err(_) => return Err(Error::Http(HttpError::Malformed("header parse"))),
            }
        };

        if let Some(parsed) = parsed {
            break parsed;
        }
        if buf.len() > MAX_RESPONSE_SIZE {
            return Err(Error::Http(HttpError::TooLarge));
        }

        let n = carrier.recv_some(&mut tmp, timeout)?;
        if n == 0 {
            return Err(Error::Http(HttpError::Truncated));
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let mut rest = buf.split_off(header_len);

    let find = |name: &str| -> Option<String> {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };

    let body = if find("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        read_chunked(carrier, &mut rest, timeout)?
    } else {
        let content_length: usize = match find("content-length") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| Error::Http(HttpError::Malformed("content-length")))?,
            None => 0,
        };
        if content_length > MAX_RESPONSE_SIZE {
            return Err(Error::Http(HttpError::TooLarge));
        }
        while rest.len() < content_length {
            let n = carrier.recv_some(&mut tmp, timeout)?;
            if n == 0 {
                return Err(Error::Http(HttpError::Truncated));
            }
            rest.extend_from_slice(&tmp[..n]);
        }
        rest.truncate(content_length);
        rest
    };

    Ok(Answer {
        status,
        reason,
        headers,
        body,
    })
}

/// Decode a chunked body; `rest` holds bytes already read past the
/// header block.
fn read_chunked<C: Carrier + ?Sized>(
    carrier: &mut C,
    rest: &mut Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut tmp = [0u8; READ_CHUNK];
    let mut cursor = 0usize;

    loop {
        // Ensure a full size line is buffered.
        let line_end = loop {
            if let Some(pos) = find_crlf(&rest[cursor..]) {
                break cursor + pos;
            }
            if rest.len() > MAX_RESPONSE_SIZE {
                return Err(Error::Http(HttpError::TooLarge));
            }
            let n = carrier.recv_some(&mut tmp, timeout)?;
            if n == 0 {
                return Err(Error::Http(HttpError::Truncated));
            }
            rest.extend_from_slice(&tmp[..n]);
        };

        let size_str = std::str::from_utf8(&rest[cursor..line_end])
            .map_err(|_| Error::Http(HttpError::Malformed("chunk size")))?;
        let size = usize::from_str_radix(size_str.trim().split(';').next().unwrap_or(""), 16)
            .map_err(|_| Error::Http(HttpError::Malformed("chunk size")))?;

        cursor = line_end + 2;

        if body.len() + size > MAX_RESPONSE_SIZE {
            return Err(Error::Http(HttpError::TooLarge));
        }

        // Buffer chunk + trailing CRLF.
        while rest.len() < cursor + size + 2 {
            let n = carrier.recv_some(&mut tmp, timeout)?;
            if n == 0 {
                return Err(Error::Http(HttpError::Truncated));
            }
            rest.extend_from_slice(&tmp[..n]);
        }

        if size == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&rest[cursor..cursor + size]);
        cursor += size + 2;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

// ============================================================================
// Cookies
// ============================================================================

/// Cookie jar keyed by name; attributes beyond the value are ignored.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    /// Empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one `Set-Cookie` header value. An empty value removes the
    /// cookie (the Fortigate clears cookies that way).
    pub fn store(&mut self, set_cookie: &str) {
        let pair = set_cookie.split(';').next().unwrap_or("");
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();

        self.cookies.retain(|(n, _)| *n != name);
        if !value.is_empty() {
            self.cookies.push((name, value));
        }
    }

    /// Value of a cookie.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// True when the named cookie exists with a non-empty value.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.is_empty())
    }

    /// `Cookie:` header value, or `None` for an empty jar.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(n, v)| format!("{}={}", n, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Drop every cookie.
    pub fn clear(&mut self) {
        self.cookies.clear();
    }
}

// ============================================================================
// URL encoding
// ============================================================================

/// Percent-encode for form bodies (everything but unreserved characters).
pub fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Decode percent-escapes and `+`.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted carrier: canned responses out, captured requests in.
    #[derive(Default)]
    pub struct MockCarrier {
        pub responses: VecDeque<Vec<u8>>,
        pub requests: Vec<Vec<u8>>,
        pub reopens: usize,
        current: Vec<u8>,
        offset: usize,
    }

    impl MockCarrier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_response(&mut self, raw: &str) {
            self.responses.push_back(raw.as_bytes().to_vec());
        }

        /// The nth captured request as text.
        pub fn request_text(&self, n: usize) -> String {
            String::from_utf8_lossy(&self.requests[n]).into_owned()
        }
    }

    impl Carrier for MockCarrier {
        fn send_all(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
            self.requests.push(data.to_vec());
            // Each request consumes the next scripted response.
            self.current = self.responses.pop_front().unwrap_or_default();
            self.offset = 0;
            Ok(())
        }

        fn recv_some(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let rest = &self.current[self.offset..];
            let n = rest.len().min(buf.len());
            buf[..n].copy_from_slice(&rest[..n]);
            self.offset += n;
            Ok(n)
        }

        fn reopen(&mut self) -> Result<()> {
            self.reopens += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockCarrier;
    use super::*;

    #[test]
    fn test_write_request_layout() {
        let wire = write_request(
            "POST",
            "/remote/logincheck",
            "fw:10443",
            Some("SVPNCOOKIE=abc"),
            &[("Pragma", "no-cache")],
            b"ajax=1",
        );
        let text = String::from_utf8(wire).unwrap();

        assert!(text.starts_with("POST /remote/logincheck HTTP/1.1\r\n"));
        assert!(text.contains("Host: fw:10443\r\n"));
        assert!(text.contains("Cookie: SVPNCOOKIE=abc\r\n"));
        assert!(text.contains("Pragma: no-cache\r\n"));
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\najax=1"));
    }

    #[test]
    fn test_read_answer_content_length() {
        let mut carrier = MockCarrier::new();
        carrier.push_response(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello",
        );
        carrier.send_all(b"GET / ...", Duration::from_secs(1)).unwrap();

        let answer = read_answer(&mut carrier, Duration::from_secs(1)).unwrap();
        assert_eq!(answer.status, 200);
        assert_eq!(answer.reason, "OK");
        assert_eq!(answer.body, b"hello");
        assert_eq!(answer.header("content-type"), Some("text/html"));
        assert_eq!(answer.header("Content-Type"), Some("text/html"));
    }

    #[test]
    fn test_read_answer_chunked() {
        let mut carrier = MockCarrier::new();
        carrier.push_response(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );
        carrier.send_all(b"GET / ...", Duration::from_secs(1)).unwrap();

        let answer = read_answer(&mut carrier, Duration::from_secs(1)).unwrap();
        assert_eq!(answer.body, b"hello world");
    }

    #[test]
    fn test_read_answer_truncated() {
        let mut carrier = MockCarrier::new();
        carrier.push_response("HTTP/1.1 200 OK\r\nContent-Length: 50\r\n\r\nshort");
        carrier.send_all(b"GET / ...", Duration::from_secs(1)).unwrap();

        let result = read_answer(&mut carrier, Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(Error::Http(HttpError::Truncated))
        ));
    }

    #[test]
    fn test_multiple_set_cookie_headers() {
        let mut carrier = MockCarrier::new();
        carrier.push_response(
            "HTTP/1.1 200 OK\r\nSet-Cookie: SVPNCOOKIE=tok123; Secure\r\nSet-Cookie: other=1\r\nContent-Length: 0\r\n\r\n",
        );
        carrier.send_all(b"GET / ...", Duration::from_secs(1)).unwrap();

        let answer = read_answer(&mut carrier, Duration::from_secs(1)).unwrap();
        let cookies: Vec<&str> = answer.headers_named("set-cookie").collect();
        assert_eq!(cookies.len(), 2);

        let mut jar = CookieJar::new();
        for cookie in cookies {
            jar.store(cookie);
        }
        assert_eq!(jar.get("SVPNCOOKIE"), Some("tok123"));
        assert!(jar.has("other"));
    }

    #[test]
    fn test_cookie_jar_replace_and_clear() {
        let mut jar = CookieJar::new();
        jar.store("SVPNCOOKIE=old");
        jar.store("SVPNCOOKIE=new");
        assert_eq!(jar.get("SVPNCOOKIE"), Some("new"));

        // Empty value removes.
        jar.store("SVPNCOOKIE=; expires=Thu, 01 Jan 1970 00:00:00 GMT");
        assert!(!jar.has("SVPNCOOKIE"));

        jar.store("a=1");
        jar.store("b=2");
        assert_eq!(jar.header_value().unwrap(), "a=1; b=2");
        jar.clear();
        assert!(jar.header_value().is_none());
    }

    #[test]
    fn test_url_encode_decode() {
        assert_eq!(url_encode("user@example"), "user%40example");
        assert_eq!(url_encode("p@ss w0rd!"), "p%40ss%20w0rd%21");
        assert_eq!(url_decode("foo%40bar"), "foo@bar");
        assert_eq!(url_decode("a+b%21"), "a b!");
        assert_eq!(url_decode("100%"), "100%");
    }
}
