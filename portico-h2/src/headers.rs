//! HTTP/2 ↔ HTTP/1.1 header conversion and the HPACK decoder contract.
//!
//! Conversion is pure over a header-list value: pseudo-headers are
//! projected to a request line plus `host`, cookie crumbs are recombined
//! (RFC 7540 Section 8.1.2.5), and everything else passes through in
//! order. The stream merely invokes these functions.

use crate::error::{ErrorCode, StreamError};

/// A decoded header field. Names are kept as the decoder produced them
/// (lowercase on the wire per RFC 7540 Section 8.1.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        HeaderField {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Contract for the external HPACK decoder.
///
/// The core never parses header-block bytes itself; it hands the
/// accumulated block to this decoder exactly once per block.
pub trait HeaderDecoder {
    /// Decode one complete header block. `trailing` marks a trailer block
    /// (no pseudo-header requirements apply).
    fn decode(
        &mut self,
        block: &[u8],
        max_table_size: u32,
        trailing: bool,
    ) -> Result<Vec<HeaderField>, ErrorCode>;
}

/// An HTTP/1.1 request head, ready for serialization toward the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http1Request {
    pub method: String,
    pub target: String,
    /// Fields in serialization order, `host` included.
    pub fields: Vec<(String, String)>,
}

/// Project an HTTP/2 request header list onto HTTP/1.1 form.
///
/// Pseudo-headers become the request line and `host`; `cookie` crumbs are
/// joined with `"; "` at the position of the first crumb. Pseudo-headers
/// after a regular field, duplicates, unknown pseudo-headers, and
/// uppercase field names are protocol errors.
pub fn convert_from_2_to_1_1(headers: &[HeaderField]) -> Result<Http1Request, StreamError> {
    let mut method: Option<String> = None;
    let mut scheme: Option<String> = None;
    let mut authority: Option<String> = None;
    let mut path: Option<String> = None;

    let mut fields: Vec<(String, String)> = Vec::with_capacity(headers.len());
    let mut cookie_at: Option<usize> = None;
    let mut seen_regular = false;
    let mut has_host = false;

    for field in headers {
        let name = std::str::from_utf8(&field.name)
            .map_err(|_| StreamError::Protocol("non-UTF-8 field name"))?;
        let value = std::str::from_utf8(&field.value)
            .map_err(|_| StreamError::Protocol("non-UTF-8 field value"))?;

        if let Some(pseudo) = name.strip_prefix(':') {
            if seen_regular {
                return Err(StreamError::Protocol("pseudo-header after regular field"));
            }
            let slot = match pseudo {
                "method" => &mut method,
                "scheme" => &mut scheme,
                "authority" => &mut authority,
                "path" => &mut path,
                _ => return Err(StreamError::Protocol("unknown request pseudo-header")),
            };
            if slot.is_some() {
                return Err(StreamError::Protocol("duplicate pseudo-header"));
            }
            *slot = Some(value.to_string());
            continue;
        }

        seen_regular = true;
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(StreamError::Protocol("uppercase field name"));
        }
        if name == "cookie" {
            match cookie_at {
                Some(idx) => {
                    let crumb = &mut fields[idx].1;
                    crumb.push_str("; ");
                    crumb.push_str(value);
                }
                None => {
                    cookie_at = Some(fields.len());
                    fields.push((name.to_string(), value.to_string()));
                }
            }
            continue;
        }
        if name == "host" {
            has_host = true;
        }
        fields.push((name.to_string(), value.to_string()));
    }

    let method = method.ok_or(StreamError::Protocol("missing :method"))?;

    // CONNECT carries only :method and :authority (RFC 7540 Section 8.3).
    let target = if method == "CONNECT" {
        authority
            .clone()
            .ok_or(StreamError::Protocol("CONNECT without :authority"))?
    } else {
        scheme.ok_or(StreamError::Protocol("missing :scheme"))?;
        path.ok_or(StreamError::Protocol("missing :path"))?
    };

    if !has_host {
        if let Some(authority) = authority {
            fields.insert(0, ("host".to_string(), authority));
        }
    }

    Ok(Http1Request {
        method,
        target,
        fields,
    })
}

/// Validate a decoded trailer block: no pseudo-headers, lowercase names.
pub fn convert_trailers(headers: &[HeaderField]) -> Result<Vec<(String, String)>, StreamError> {
    let mut fields = Vec::with_capacity(headers.len());
    for field in headers {
        let name = std::str::from_utf8(&field.name)
            .map_err(|_| StreamError::Protocol("non-UTF-8 trailer name"))?;
        let value = std::str::from_utf8(&field.value)
            .map_err(|_| StreamError::Protocol("non-UTF-8 trailer value"))?;
        if name.starts_with(':') {
            return Err(StreamError::Protocol("pseudo-header in trailers"));
        }
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(StreamError::Protocol("uppercase trailer name"));
        }
        fields.push((name.to_string(), value.to_string()));
    }
    Ok(fields)
}

impl Http1Request {
    /// Serialize to wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Parse a complete serialized request head. Returns the head and the
    /// number of bytes consumed (up to and including the blank line).
    pub fn parse(data: &[u8]) -> Result<(Http1Request, usize), StreamError> {
        let end = find_head_end(data).ok_or(StreamError::Protocol("truncated request head"))?;
        let head = &data[..end - 2]; // drop the final blank line
        let mut lines = head.split(|&b| b == b'\n').map(strip_cr);

        let request_line = lines
            .next()
            .ok_or(StreamError::Protocol("missing request line"))?;
        let line = std::str::from_utf8(request_line)
            .map_err(|_| StreamError::Protocol("non-UTF-8 request line"))?;
        let mut parts = line.splitn(3, ' ');
        let method = parts
            .next()
            .filter(|m| !m.is_empty())
            .ok_or(StreamError::Protocol("missing method"))?;
        let target = parts
            .next()
            .ok_or(StreamError::Protocol("missing request target"))?;
        let version = parts
            .next()
            .ok_or(StreamError::Protocol("missing HTTP version"))?;
        if version != "HTTP/1.1" {
            return Err(StreamError::Protocol("unexpected HTTP version"));
        }

        let mut fields = Vec::new();
        for raw in lines {
            if raw.is_empty() {
                continue;
            }
            let (name, value) = split_field(raw)?;
            fields.push((name, value));
        }

        Ok((
            Http1Request {
                method: method.to_string(),
                target: target.to_string(),
                fields,
            },
            end,
        ))
    }
}

/// A parsed HTTP/1.x response head.
#[derive(Debug, Clone, Default)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub fields: Vec<(String, String)>,
}

impl ResponseHead {
    /// Whether the driver asked for the session to stop after this
    /// response. The value match is case-sensitive on the canonical
    /// lowercase token the driver produces.
    pub fn connection_close(&self) -> bool {
        self.fields
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("connection") && value == "close")
    }

    /// 1xx responses announce that a final response follows.
    pub fn expect_final_response(&self) -> bool {
        self.status / 100 == 1
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Result of feeding bytes to [`ResponseParser::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Head complete; unconsumed input is body.
    Complete,
    /// More bytes needed.
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    StatusLine,
    Fields,
    Done,
}

/// Incremental HTTP/1.x response head parser.
///
/// Bytes are consumed line by line; once the blank line is seen, parsing
/// stops and the remaining input is left to the caller (it is body data).
pub struct ResponseParser {
    state: ParserState,
    partial: Vec<u8>,
    head: ResponseHead,
}

impl ResponseParser {
    pub fn new() -> Self {
        ResponseParser {
            state: ParserState::StatusLine,
            partial: Vec::new(),
            head: ResponseHead::default(),
        }
    }

    /// Feed bytes. Returns how many were consumed and whether the head is
    /// complete. Once complete, no further bytes are consumed.
    pub fn parse(&mut self, data: &[u8]) -> Result<(usize, ParseStatus), StreamError> {
        let mut consumed = 0;
        while self.state != ParserState::Done {
            let rest = &data[consumed..];
            let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
                self.partial.extend_from_slice(rest);
                consumed = data.len();
                return Ok((consumed, ParseStatus::Partial));
            };
            consumed += nl + 1;

            let line: Vec<u8> = if self.partial.is_empty() {
                strip_cr(&rest[..nl]).to_vec()
            } else {
                self.partial.extend_from_slice(&rest[..nl]);
                let line = strip_cr(&self.partial).to_vec();
                self.partial.clear();
                line
            };

            match self.state {
                ParserState::StatusLine => {
                    self.parse_status_line(&line)?;
                    self.state = ParserState::Fields;
                }
                ParserState::Fields => {
                    if line.is_empty() {
                        self.state = ParserState::Done;
                    } else {
                        let (name, value) = split_field(&line)?;
                        self.head.fields.push((name, value));
                    }
                }
                ParserState::Done => unreachable!(),
            }
        }
        Ok((consumed, ParseStatus::Complete))
    }

    fn parse_status_line(&mut self, line: &[u8]) -> Result<(), StreamError> {
        let line =
            std::str::from_utf8(line).map_err(|_| StreamError::Protocol("non-UTF-8 status line"))?;
        let mut parts = line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or(StreamError::Protocol("missing HTTP version"))?;
        if !version.starts_with("HTTP/1.") {
            return Err(StreamError::Protocol("unexpected response version"));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|s| (100..1000).contains(s))
            .ok_or(StreamError::Protocol("malformed status code"))?;
        self.head.status = status;
        self.head.reason = parts.next().unwrap_or("").to_string();
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.state == ParserState::Done
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Full re-initialization, dynamic buffers included. Used after an
    /// informational response to read the final one.
    pub fn reset(&mut self) {
        self.state = ParserState::StatusLine;
        self.partial = Vec::new();
        self.head = ResponseHead::default();
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn split_field(raw: &[u8]) -> Result<(String, String), StreamError> {
    let line = std::str::from_utf8(raw).map_err(|_| StreamError::Protocol("non-UTF-8 field"))?;
    let (name, value) = line
        .split_once(':')
        .ok_or(StreamError::Protocol("field without colon"))?;
    if name.is_empty() {
        return Err(StreamError::Protocol("empty field name"));
    }
    Ok((name.to_string(), value.trim_start_matches(' ').to_string()))
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: &str) -> HeaderField {
        HeaderField::new(name.as_bytes(), value.as_bytes())
    }

    #[test]
    fn basic_conversion() {
        let req = convert_from_2_to_1_1(&[
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field(":path", "/index.html"),
            field("accept", "*/*"),
        ])
        .unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/index.html");
        assert_eq!(
            req.to_bytes(),
            b"GET /index.html HTTP/1.1\r\nhost: example.com\r\naccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn cookie_crumbs_rejoined() {
        let req = convert_from_2_to_1_1(&[
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field(":path", "/"),
            field("cookie", "a=1"),
            field("x-next", "y"),
            field("cookie", "b=2"),
            field("cookie", "c=3"),
        ])
        .unwrap();

        let cookie = req
            .fields
            .iter()
            .find(|(n, _)| n == "cookie")
            .map(|(_, v)| v.as_str());
        assert_eq!(cookie, Some("a=1; b=2; c=3"));
        // Joined at the position of the first crumb, before x-next.
        let names: Vec<&str> = req.fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["host", "cookie", "x-next"]);
    }

    #[test]
    fn explicit_host_preserved() {
        let req = convert_from_2_to_1_1(&[
            field(":method", "GET"),
            field(":scheme", "http"),
            field(":authority", "proxy.example"),
            field(":path", "/"),
            field("host", "origin.example"),
        ])
        .unwrap();
        let hosts: Vec<&str> = req
            .fields
            .iter()
            .filter(|(n, _)| n == "host")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(hosts, vec!["origin.example"]);
    }

    #[test]
    fn connect_uses_authority_target() {
        let req = convert_from_2_to_1_1(&[
            field(":method", "CONNECT"),
            field(":authority", "origin.example:443"),
        ])
        .unwrap();
        assert_eq!(req.target, "origin.example:443");
    }

    #[test]
    fn conversion_rejections() {
        // Pseudo-header after a regular field.
        assert!(convert_from_2_to_1_1(&[
            field(":method", "GET"),
            field("accept", "*/*"),
            field(":path", "/"),
        ])
        .is_err());
        // Duplicate pseudo-header.
        assert!(convert_from_2_to_1_1(&[
            field(":method", "GET"),
            field(":method", "POST"),
        ])
        .is_err());
        // Unknown pseudo-header.
        assert!(convert_from_2_to_1_1(&[field(":status", "200")]).is_err());
        // Uppercase field name.
        assert!(convert_from_2_to_1_1(&[
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":authority", "a"),
            field(":path", "/"),
            field("Accept", "*/*"),
        ])
        .is_err());
        // Missing :path.
        assert!(convert_from_2_to_1_1(&[
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":authority", "a"),
        ])
        .is_err());
    }

    #[test]
    fn serialization_round_trip_is_stable() {
        let req = convert_from_2_to_1_1(&[
            field(":method", "POST"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field(":path", "/submit?x=1"),
            field("cookie", "a=1"),
            field("cookie", "b=2"),
            field("content-type", "text/plain"),
        ])
        .unwrap();

        let first = req.to_bytes();
        let (reparsed, consumed) = Http1Request::parse(&first).unwrap();
        assert_eq!(consumed, first.len());
        let second = reparsed.to_bytes();
        assert_eq!(first, second);
    }

    #[test]
    fn trailers_validated() {
        let fields =
            convert_trailers(&[field("grpc-status", "0"), field("grpc-message", "ok")]).unwrap();
        assert_eq!(fields.len(), 2);
        assert!(convert_trailers(&[field(":status", "200")]).is_err());
    }

    #[test]
    fn response_parse_single_shot() {
        let mut parser = ResponseParser::new();
        let input = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello";
        let (consumed, status) = parser.parse(input).unwrap();
        assert_eq!(status, ParseStatus::Complete);
        assert_eq!(consumed, input.len() - 5, "body bytes must not be consumed");
        assert_eq!(parser.head().status, 200);
        assert_eq!(parser.head().field("content-length"), Some("5"));
    }

    #[test]
    fn response_parse_incremental() {
        let mut parser = ResponseParser::new();
        let (c1, s1) = parser.parse(b"HTTP/1.1 20").unwrap();
        assert_eq!((c1, s1), (11, ParseStatus::Partial));
        let (c2, s2) = parser.parse(b"0 OK\r\nx: y\r\n").unwrap();
        assert_eq!((c2, s2), (12, ParseStatus::Partial));
        let (c3, s3) = parser.parse(b"\r\nBODY").unwrap();
        assert_eq!((c3, s3), (2, ParseStatus::Complete));
        assert_eq!(parser.head().status, 200);
        assert_eq!(parser.head().field("x"), Some("y"));
    }

    #[test]
    fn response_connection_close_is_case_sensitive_on_value() {
        let mut parser = ResponseParser::new();
        parser
            .parse(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
            .unwrap();
        assert!(parser.head().connection_close());

        let mut parser = ResponseParser::new();
        parser
            .parse(b"HTTP/1.1 200 OK\r\nconnection: Close\r\n\r\n")
            .unwrap();
        assert!(!parser.head().connection_close());
    }

    #[test]
    fn informational_then_reset() {
        let mut parser = ResponseParser::new();
        let (_, status) = parser.parse(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();
        assert_eq!(status, ParseStatus::Complete);
        assert!(parser.head().expect_final_response());

        parser.reset();
        assert!(!parser.is_done());
        let (_, status) = parser
            .parse(b"HTTP/1.1 204 No Content\r\nx: 1\r\n\r\n")
            .unwrap();
        assert_eq!(status, ParseStatus::Complete);
        assert_eq!(parser.head().status, 204);
        assert_eq!(parser.head().fields.len(), 1);
    }

    #[test]
    fn malformed_status_rejected() {
        let mut parser = ResponseParser::new();
        assert!(parser.parse(b"HTTP/1.1 xx OK\r\n\r\n").is_err());
        let mut parser = ResponseParser::new();
        assert!(parser.parse(b"ICY 200 OK\r\n\r\n").is_err());
    }
}
