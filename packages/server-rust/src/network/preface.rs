//! Connection preface parsing for protocol classification.
//!
//! Works on the bytes a client sends before it expects anything back:
//! an HTTP/1 request head, or the HTTP/2 connection preface followed by
//! frames up to the first complete header block. Parsing is pure and
//! incremental; the caller keeps reading until [`parse_preface`] stops
//! asking for more.

use http::{HeaderMap, HeaderName, HeaderValue, Uri};

use crate::service::matcher::RequestHead;

/// HTTP/2 client connection preface (RFC 9113, section 3.4).
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const HTTP1_METHODS: [&[u8]; 9] = [
    b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"CONNECT", b"TRACE",
];

/// Wire protocol recognized from the preface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    Unknown,
}

/// What was learned from a connection's first bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPreface {
    pub protocol: Protocol,
    /// The first request's head, when it could be parsed.
    pub head: Option<RequestHead>,
}

impl ConnectionPreface {
    fn bare(protocol: Protocol) -> Self {
        Self {
            protocol,
            head: None,
        }
    }
}

/// Outcome of one parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse {
    /// The buffer ends mid-structure; read more and retry.
    NeedMore,
    Done(ConnectionPreface),
}

/// Parses the bytes read so far.
///
/// `complete` means no more bytes will be offered (EOF or the lookahead
/// limit); the parser then returns whatever it has instead of `NeedMore`.
#[must_use]
pub fn parse_preface(buf: &[u8], complete: bool) -> Parse {
    if buf.len() < HTTP2_PREFACE.len() && HTTP2_PREFACE.starts_with(buf) && !complete {
        return Parse::NeedMore;
    }
    if let Some(frames) = buf.strip_prefix(HTTP2_PREFACE) {
        return parse_http2(frames, complete);
    }

    match http1_method(buf) {
        MethodCheck::Match => parse_http1(buf, complete),
        MethodCheck::Partial if !complete => Parse::NeedMore,
        MethodCheck::Partial | MethodCheck::NoMatch => {
            Parse::Done(ConnectionPreface::bare(Protocol::Unknown))
        }
    }
}

enum MethodCheck {
    Match,
    Partial,
    NoMatch,
}

/// Fast check for an HTTP/1 request line: a known method followed by a space.
fn http1_method(buf: &[u8]) -> MethodCheck {
    let mut partial = false;
    for method in HTTP1_METHODS {
        if buf.len() > method.len() {
            if buf.starts_with(method) && buf[method.len()] == b' ' {
                return MethodCheck::Match;
            }
        } else if method.starts_with(buf) {
            partial = true;
        }
    }
    if partial {
        MethodCheck::Partial
    } else {
        MethodCheck::NoMatch
    }
}

fn parse_http1(buf: &[u8], complete: bool) -> Parse {
    let Some(end) = find(buf, b"\r\n\r\n") else {
        return if complete {
            Parse::Done(ConnectionPreface::bare(Protocol::Http1))
        } else {
            Parse::NeedMore
        };
    };

    let head = std::str::from_utf8(&buf[..end])
        .ok()
        .and_then(parse_http1_head);
    Parse::Done(ConnectionPreface {
        protocol: Protocol::Http1,
        head,
    })
}

fn parse_http1_head(text: &str) -> Option<RequestHead> {
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let target = request_line.next()?;

    let mut headers = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            headers.append(name, value);
        }
    }

    Some(RequestHead {
        method,
        path: request_path(target),
        headers,
    })
}

fn parse_http2(frames: &[u8], complete: bool) -> Parse {
    let incomplete = || {
        if complete {
            Parse::Done(ConnectionPreface::bare(Protocol::Http2))
        } else {
            Parse::NeedMore
        }
    };

    let mut offset = 0;
    let mut block: Vec<u8> = Vec::new();
    let mut in_header_block = false;

    loop {
        let Some(header) = frames.get(offset..offset + FRAME_HEADER_LEN) else {
            return incomplete();
        };
        let len = (usize::from(header[0]) << 16)
            | (usize::from(header[1]) << 8)
            | usize::from(header[2]);
        let kind = header[3];
        let flags = header[4];

        let start = offset + FRAME_HEADER_LEN;
        let Some(payload) = frames.get(start..start + len) else {
            return incomplete();
        };
        offset = start + len;

        let fragment = match kind {
            FRAME_HEADERS if !in_header_block => match headers_fragment(payload, flags) {
                Some(fragment) => fragment,
                None => return Parse::Done(ConnectionPreface::bare(Protocol::Http2)),
            },
            FRAME_CONTINUATION if in_header_block => payload,
            _ if in_header_block => {
                // Anything between HEADERS and END_HEADERS is a protocol error.
                return Parse::Done(ConnectionPreface::bare(Protocol::Http2));
            }
            _ => continue,
        };

        block.extend_from_slice(fragment);
        if flags & FLAG_END_HEADERS != 0 {
            return Parse::Done(ConnectionPreface {
                protocol: Protocol::Http2,
                head: decode_header_block(&block),
            });
        }
        in_header_block = true;
    }
}

/// Strips padding and priority fields from a HEADERS payload.
fn headers_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut fragment = payload;
    let mut padding = 0;
    if flags & FLAG_PADDED != 0 {
        let (&pad, rest) = fragment.split_first()?;
        padding = usize::from(pad);
        fragment = rest;
    }
    if flags & FLAG_PRIORITY != 0 {
        fragment = fragment.get(5..)?;
    }
    fragment.get(..fragment.len().checked_sub(padding)?)
}

fn decode_header_block(block: &[u8]) -> Option<RequestHead> {
    let fields = hpack::Decoder::new().decode(block).ok()?;

    let mut head = RequestHead::default();
    for (name, value) in fields {
        match name.as_slice() {
            b":method" => head.method = String::from_utf8(value).ok()?,
            b":path" => head.path = request_path(std::str::from_utf8(&value).ok()?),
            n if n.starts_with(b":") => {}
            _ => {
                if let (Ok(name), Ok(value)) =
                    (HeaderName::from_bytes(&name), HeaderValue::from_bytes(&value))
                {
                    head.headers.append(name, value);
                }
            }
        }
    }
    Some(head)
}

/// Extracts the path of a request target, dropping any query string.
fn request_path(target: &str) -> String {
    match target.parse::<Uri>() {
        Ok(uri) => uri.path().to_string(),
        Err(_) => target.split('?').next().unwrap_or_default().to_string(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
pub(crate) mod tests {
    use http::header::CONTENT_TYPE;

    use super::*;

    /// Builds an HTTP/2 prior-knowledge preface: client magic, an empty
    /// SETTINGS frame and one HEADERS frame carrying `fields`.
    pub(crate) fn h2_preface(fields: &[(&str, &str)], end_headers: bool) -> Vec<u8> {
        let block = hpack::Encoder::new().encode(
            fields
                .iter()
                .map(|(n, v)| (n.as_bytes(), v.as_bytes())),
        );

        let mut out = HTTP2_PREFACE.to_vec();
        out.extend_from_slice(&frame(0x4, 0, 0, &[]));
        let flags = if end_headers { FLAG_END_HEADERS } else { 0 };
        out.extend_from_slice(&frame(FRAME_HEADERS, flags, 1, &block));
        out
    }

    pub(crate) fn frame(kind: u8, flags: u8, stream: u32, payload: &[u8]) -> Vec<u8> {
        let len = payload.len();
        let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, kind, flags];
        out.extend_from_slice(&stream.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn done(parse: Parse) -> ConnectionPreface {
        match parse {
            Parse::Done(preface) => preface,
            Parse::NeedMore => panic!("expected a complete preface"),
        }
    }

    #[test]
    fn http1_head_is_parsed() {
        let raw = b"POST /v1/items?x=1 HTTP/1.1\r\nHost: a\r\nContent-Type: application/grpc-gateway\r\n\r\n{}";
        let preface = done(parse_preface(raw, false));
        assert_eq!(preface.protocol, Protocol::Http1);
        let head = preface.head.unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/v1/items");
        assert_eq!(head.headers[CONTENT_TYPE], "application/grpc-gateway");
    }

    #[test]
    fn http1_waits_for_end_of_head() {
        assert_eq!(parse_preface(b"GE", false), Parse::NeedMore);
        assert_eq!(parse_preface(b"GET / HTTP/1.1\r\nHost: a\r\n", false), Parse::NeedMore);
    }

    #[test]
    fn http1_truncated_at_limit_still_classifies() {
        let preface = done(parse_preface(b"GET / HTTP/1.1\r\nHost: a\r\n", true));
        assert_eq!(preface.protocol, Protocol::Http1);
        assert!(preface.head.is_none());
    }

    #[test]
    fn unknown_bytes_are_unknown() {
        let preface = done(parse_preface(b"\x16\x03\x01\x02\x00", false));
        assert_eq!(preface.protocol, Protocol::Unknown);
        let preface = done(parse_preface(b"GETX / HTTP/1.1\r\n\r\n", false));
        assert_eq!(preface.protocol, Protocol::Unknown);
    }

    #[test]
    fn partial_http2_magic_needs_more() {
        assert_eq!(parse_preface(b"PRI * HTTP/2", false), Parse::NeedMore);
        assert_eq!(parse_preface(b"", false), Parse::NeedMore);
    }

    #[test]
    fn http2_headers_are_decoded() {
        let raw = h2_preface(
            &[
                (":method", "POST"),
                (":scheme", "http"),
                (":path", "/grpc.health.v1.Health/Check"),
                (":authority", "localhost"),
                ("content-type", "application/grpc"),
                ("te", "trailers"),
            ],
            true,
        );
        let preface = done(parse_preface(&raw, false));
        assert_eq!(preface.protocol, Protocol::Http2);
        let head = preface.head.unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/grpc.health.v1.Health/Check");
        assert_eq!(head.headers[CONTENT_TYPE], "application/grpc");
        assert!(!head.headers.contains_key(":authority"));
    }

    #[test]
    fn http2_partial_frames_need_more() {
        let raw = h2_preface(&[(":path", "/a")], true);
        for cut in [HTTP2_PREFACE.len() + 4, raw.len() - 1] {
            assert_eq!(parse_preface(&raw[..cut], false), Parse::NeedMore);
        }
        let preface = done(parse_preface(&raw[..raw.len() - 1], true));
        assert_eq!(preface, ConnectionPreface::bare(Protocol::Http2));
    }

    #[test]
    fn http2_continuation_frames_are_joined() {
        let block = hpack::Encoder::new().encode(vec![
            (&b":path"[..], &b"/split"[..]),
            (&b"content-type"[..], &b"application/grpc"[..]),
        ]);
        let (first, second) = block.split_at(block.len() / 2);

        let mut raw = HTTP2_PREFACE.to_vec();
        raw.extend_from_slice(&frame(FRAME_HEADERS, 0, 1, first));
        assert_eq!(parse_preface(&raw, false), Parse::NeedMore);

        raw.extend_from_slice(&frame(FRAME_CONTINUATION, FLAG_END_HEADERS, 1, second));
        let head = done(parse_preface(&raw, false)).head.unwrap();
        assert_eq!(head.path, "/split");
        assert_eq!(head.headers[CONTENT_TYPE], "application/grpc");
    }

    #[test]
    fn http2_padding_and_priority_are_skipped() {
        let block = hpack::Encoder::new().encode(vec![(&b":path"[..], &b"/padded"[..])]);
        let mut payload = vec![3u8];
        payload.extend_from_slice(&[0, 0, 0, 0, 16]);
        payload.extend_from_slice(&block);
        payload.extend_from_slice(&[0, 0, 0]);

        let mut raw = HTTP2_PREFACE.to_vec();
        raw.extend_from_slice(&frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_PADDED | FLAG_PRIORITY,
            1,
            &payload,
        ));
        let head = done(parse_preface(&raw, false)).head.unwrap();
        assert_eq!(head.path, "/padded");
    }

    #[test]
    fn http2_bad_hpack_yields_no_head() {
        let mut raw = HTTP2_PREFACE.to_vec();
        raw.extend_from_slice(&frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &[0xff, 0xff, 0xff]));
        let preface = done(parse_preface(&raw, false));
        assert_eq!(preface.protocol, Protocol::Http2);
        assert!(preface.head.is_none());
    }
}
