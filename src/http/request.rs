use crate::{
    errors::ErrorKind,
    http::{
        query::QueryPairs,
        types::{slice_to_usize, to_lower_case, trim_ows},
    },
    limits::ReqLimits,
    ConnectionId, Method, Version,
};
use memchr::{memchr, memmem};
use std::{mem, ops::Range, str};

/// A parsed HTTP/1.x request.
///
/// The request owns exactly the bytes of one message (head and body) and
/// hands out views into them. It is immutable once parsed and is dropped
/// after the response has been generated.
///
/// # Input data requirements
///
/// #### General designations
/// - `SP`: ASCII space (0x20)
/// - `CRLF`: Carriage return + line feed (`"\r\n"`) - **exactly this sequence required**
///
/// ## First line
/// ```text
/// [METHOD] SP [TARGET] SP [VERSION] CRLF
/// ```
/// Exactly three space separated fields, otherwise the request is rejected.
/// `[TARGET]` is `path[?query]`, the path must start with `/` (or be `*`).
/// `[VERSION]` is `HTTP/1.0` or `HTTP/1.1`.
///
/// ## Header
/// ```text
/// [NAME]: [VALUE] CRLF
/// ```
/// - `[NAME]`: case-insensitive, stored lower-cased, must not be empty
/// - `[VALUE]`: surrounding spaces and tabs are trimmed
///
/// A header line without `:` makes the whole request invalid. When a header
/// is repeated, lookups return the **last** occurrence.
///
/// ## Body
///
/// Only bodies announced with `Content-Length` are supported. Without that
/// header the body is empty, whatever else the client sends.
///
/// **Not supported**:
/// - `Transfer-Encoding: chunked`
/// - Implicit-length bodies (read until connection close)
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    raw: Box<[u8]>,

    method: Method,
    path: Range<usize>,
    query: Option<Range<usize>>,
    version: Version,

    headers: Vec<(Range<usize>, Range<usize>)>,
    content_length: Option<usize>,
    keep_alive: bool,

    body: Option<Range<usize>>,

    pub(crate) connection_id: ConnectionId,
}

struct Head {
    method: Method,
    path: Range<usize>,
    query: Option<Range<usize>>,
    version: Version,
    headers: Vec<(Range<usize>, Range<usize>)>,
    content_length: Option<usize>,
    keep_alive: bool,
}

// Public API
impl Request {
    /// Id of the connection this request arrived on.
    ///
    /// The same id is used for WebSocket callbacks after an upgrade.
    #[inline(always)]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Path component of the request target, e.g. `/test.html`.
    #[inline(always)]
    pub fn path(&self) -> &str {
        self.str_at(self.path.clone())
    }

    /// Query component without the leading `?`.
    #[inline(always)]
    pub fn query(&self) -> Option<&str> {
        self.query.clone().map(|range| self.str_at(range))
    }

    /// Iterates over the `key=value` pairs of the query component.
    #[inline]
    pub fn query_pairs(&self) -> QueryPairs<'_> {
        QueryPairs::new(self.query().unwrap_or_default().as_bytes())
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the last header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| self.raw[n.clone()].eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| self.str_at(v.clone()))
    }

    /// Iterates over all headers in arrival order. Names are lower-cased.
    #[inline]
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(n, v)| (self.str_at(n.clone()), self.str_at(v.clone())))
    }

    /// Returns the value of the `Content-Length` header if present.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Returns the keep-alive status of the connection.
    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Returns the request body, `None` when it is empty.
    #[inline]
    pub fn body(&self) -> Option<&[u8]> {
        self.body.clone().map(|range| &self.raw[range])
    }

    #[inline(always)]
    fn str_at(&self, range: Range<usize>) -> &str {
        // SAFETY: `parse` validates the whole head with `simdutf8` before a
        // `Request` is built, and every range handed to this function lies
        // inside the head on character boundaries (split on ASCII bytes).
        // Lower-casing names only rewrites ASCII bytes.
        unsafe { str::from_utf8_unchecked(&self.raw[range]) }
    }
}

// Parser
impl Request {
    /// Tries to take one complete request from the front of `buffer`.
    ///
    /// Returns `Ok(None)` while the head terminator or the announced body is
    /// still missing; the caller appends more bytes and calls again with the
    /// whole buffer. On success the request's bytes are removed from
    /// `buffer`, anything after them (a pipelined request) stays.
    pub(crate) fn parse(
        buffer: &mut Vec<u8>,
        limits: &ReqLimits,
    ) -> Result<Option<Request>, ErrorKind> {
        let Some(head_end) = memmem::find(buffer.as_slice(), b"\r\n\r\n").map(|i| i + 4) else {
            return match buffer.len() > limits.header_size {
                true => Err(ErrorKind::HeadersTooLarge),
                false => Ok(None),
            };
        };

        if head_end > limits.header_size {
            return Err(ErrorKind::HeadersTooLarge);
        }

        simdutf8::basic::from_utf8(&buffer[..head_end]).map_err(|_| ErrorKind::InvalidEncoding)?;

        let head = Self::parse_head(&buffer[..head_end])?;

        let body_len = head.content_length.unwrap_or(0);
        if body_len > limits.body_size {
            return Err(ErrorKind::BodyTooLarge {
                declared: body_len,
                limit: limits.body_size,
            });
        }

        let total = head_end + body_len;
        if buffer.len() < total {
            return Ok(None);
        }

        let rest = buffer.split_off(total);
        let mut raw = mem::replace(buffer, rest).into_boxed_slice();

        for (name, _) in &head.headers {
            to_lower_case(&mut raw[name.clone()]);
        }

        Ok(Some(Request {
            raw,

            method: head.method,
            path: head.path,
            query: head.query,
            version: head.version,

            headers: head.headers,
            content_length: head.content_length,
            keep_alive: head.keep_alive,

            body: (body_len > 0).then_some(head_end..total),

            connection_id: ConnectionId::nil(),
        }))
    }

    fn parse_head(head: &[u8]) -> Result<Head, ErrorKind> {
        // `head` always ends with "\r\n\r\n", so the first CRLF exists
        let line_end = memmem::find(head, b"\r\n").ok_or(ErrorKind::InvalidRequestLine)?;

        let mut parts = head[..line_end].split(|b| *b == b' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ErrorKind::InvalidRequestLine);
        };

        let method = Method::from_bytes(method)?;
        let (version, mut keep_alive) = Version::from_bytes(version)?;
        let (path, query) = Self::parse_target(target, method.as_str().len() + 1)?;

        let mut headers = Vec::new();
        let mut content_length = None;

        let block_start = line_end + 2;
        let block_end = head.len() - 4;
        if block_start <= block_end {
            let mut start = block_start;

            loop {
                let end = memmem::find(&head[start..block_end], b"\r\n")
                    .map_or(block_end, |i| start + i);

                let (name, value) = Self::parse_header(head, start, end)?;

                let value_bytes = &head[value.clone()];
                match &head[name.clone()] {
                    n if n.eq_ignore_ascii_case(b"content-length") => {
                        content_length = Some(
                            slice_to_usize(value_bytes).ok_or(ErrorKind::InvalidContentLength)?,
                        );
                    }
                    n if n.eq_ignore_ascii_case(b"connection") => {
                        keep_alive = Self::connection_keep_alive(value_bytes, keep_alive);
                    }
                    _ => {}
                }

                headers.push((name, value));

                if end == block_end {
                    break;
                }
                start = end + 2;
            }
        }

        Ok(Head {
            method,
            path,
            query,
            version,
            headers,
            content_length,
            keep_alive,
        })
    }

    #[inline]
    fn parse_target(
        target: &[u8],
        offset: usize,
    ) -> Result<(Range<usize>, Option<Range<usize>>), ErrorKind> {
        match target.first() {
            Some(b'/') => {}
            Some(b'*') if target.len() == 1 => {}
            _ => return Err(ErrorKind::InvalidUrl),
        }

        Ok(match memchr(b'?', target) {
            Some(q) => (offset..offset + q, Some(offset + q + 1..offset + target.len())),
            None => (offset..offset + target.len(), None),
        })
    }

    #[inline]
    fn parse_header(
        head: &[u8],
        start: usize,
        end: usize,
    ) -> Result<(Range<usize>, Range<usize>), ErrorKind> {
        let line = &head[start..end];
        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;

        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(ErrorKind::InvalidHeader);
        }

        let raw_value = &line[colon + 1..];
        let value = trim_ows(raw_value);
        // Offset of the trimmed value inside `head`
        let value_start = start + colon + 1 + (value.as_ptr() as usize - raw_value.as_ptr() as usize);

        Ok((
            start..start + colon,
            value_start..value_start + value.len(),
        ))
    }

    #[inline]
    fn connection_keep_alive(value: &[u8], default: bool) -> bool {
        value
            .split(|b| *b == b',')
            .map(trim_ows)
            .fold(default, |keep_alive, token| {
                if token.eq_ignore_ascii_case(b"close") {
                    false
                } else if token.eq_ignore_ascii_case(b"keep-alive") {
                    true
                } else {
                    keep_alive
                }
            })
    }
}

#[cfg(test)]
impl Request {
    /// Parses a complete request, panicking when it is incomplete or invalid.
    pub(crate) fn from_text(value: &str) -> Request {
        let mut buffer = value.as_bytes().to_vec();
        Request::parse(&mut buffer, &ReqLimits::default())
            .unwrap()
            .expect("request must be complete")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    fn parse(value: &str) -> Result<Option<Request>, ErrorKind> {
        Request::parse(&mut value.as_bytes().to_vec(), &ReqLimits::default())
    }

    #[test]
    fn simple_get() {
        let req = Request::from_text("GET /test.html HTTP/1.1\r\nUser-Agent: X\r\n\r\n");

        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/test.html");
        assert_eq!(req.query(), None);
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.header("user-agent"), Some("X"));
        assert_eq!(req.header("USER-AGENT"), Some("X"));
        assert_eq!(req.body(), None);
        assert!(req.is_keep_alive());
    }

    #[test]
    fn target_and_query() {
        #[rustfmt::skip]
        let cases = [
            ("/",                    "/",         None),
            ("/api/users?id=1&x",    "/api/users", Some("id=1&x")),
            ("/search?",             "/search",   Some("")),
            ("*",                    "*",         None),
        ];

        for (target, path, query) in cases {
            let req = Request::from_text(&format!("OPTIONS {target} HTTP/1.1\r\n\r\n"));

            assert_eq!(req.path(), path);
            assert_eq!(req.query(), query);
        }

        let req = Request::from_text("GET /a?id=1&flag HTTP/1.1\r\n\r\n");
        let pairs: Vec<_> = req.query_pairs().map(str_2).collect();
        assert_eq!(pairs, [("id", "1"), ("flag", "")]);
    }

    #[test]
    fn invalid_request_line() {
        #[rustfmt::skip]
        let cases = [
            ("GET /\r\n\r\n",                  ErrorKind::InvalidRequestLine),
            ("GET  / HTTP/1.1\r\n\r\n",        ErrorKind::InvalidRequestLine),
            ("GET / HTTP/1.1 extra\r\n\r\n",   ErrorKind::InvalidRequestLine),
            ("\r\n\r\n",                       ErrorKind::InvalidRequestLine),
            ("FETCH / HTTP/1.1\r\n\r\n",       ErrorKind::InvalidMethod),
            ("GET api HTTP/1.1\r\n\r\n",       ErrorKind::InvalidUrl),
            ("GET / HTTP/2.0\r\n\r\n",         ErrorKind::InvalidVersion),
            ("GET / http/1.1\r\n\r\n",         ErrorKind::InvalidVersion),
        ];

        for (value, expected) in cases {
            assert_eq!(parse(value), Err(expected), "{value:?}");
        }
    }

    #[test]
    fn headers() {
        #[rustfmt::skip]
        let cases = [
            ("HEADER: value\r\n",     Some(("header", "value"))),
            ("Header:value\r\n",      Some(("header", "value"))),
            ("header:   value  \r\n", Some(("header", "value"))),
            ("header: \r\n",          Some(("header", ""))),
            ("x-a: b: c\r\n",         Some(("x-a", "b: c"))),

            ("no colon\r\n",          None),
            (": value\r\n",           None),
            ("bad name: value\r\n",   None),
        ];

        for (line, expected) in cases {
            let result = parse(&format!("GET / HTTP/1.1\r\n{line}\r\n"));

            match expected {
                Some((name, value)) => {
                    let req = result.unwrap().unwrap();
                    assert_eq!(req.headers().collect::<Vec<_>>(), [(name, value)]);
                    assert_eq!(req.header(name), Some(value));
                }
                None => assert_eq!(result, Err(ErrorKind::InvalidHeader), "{line:?}"),
            }
        }
    }

    #[test]
    fn duplicate_headers_last_wins() {
        let req = Request::from_text("GET / HTTP/1.1\r\nX-Id: 1\r\nx-id: 2\r\n\r\n");

        assert_eq!(req.header("x-id"), Some("2"));
        assert_eq!(req.headers().count(), 2);
    }

    #[test]
    fn keep_alive() {
        #[rustfmt::skip]
        let cases = [
            ("HTTP/1.1", "",                                 true),
            ("HTTP/1.1", "Connection: close\r\n",            false),
            ("HTTP/1.1", "Connection: Upgrade\r\n",          true),
            ("HTTP/1.0", "",                                 false),
            ("HTTP/1.0", "Connection: Keep-Alive\r\n",       true),
            ("HTTP/1.0", "Connection: keep-alive, Upgrade\r\n", true),
        ];

        for (version, header, expected) in cases {
            let req = Request::from_text(&format!("GET / {version}\r\n{header}\r\n"));
            assert_eq!(req.is_keep_alive(), expected, "{version} {header:?}");
        }
    }

    #[test]
    fn incomplete_until_terminator() {
        let full = "GET /test.html HTTP/1.1\r\nHost: a\r\n\r\n";

        for end in 0..full.len() {
            assert_eq!(parse(&full[..end]), Ok(None), "{end}");
        }
        assert!(parse(full).unwrap().is_some());
    }

    #[test]
    fn body_by_content_length() {
        let full = "POST /form HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world";
        let head_end = full.find("\r\n\r\n").unwrap() + 4;

        for end in head_end..full.len() {
            assert_eq!(parse(&full[..end]), Ok(None), "{end}");
        }

        let mut buffer = full.as_bytes().to_vec();
        let req = Request::parse(&mut buffer, &ReqLimits::default()).unwrap().unwrap();

        assert_eq!(req.content_length(), Some(11));
        assert_eq!(str(req.body()), Some("hello world"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn body_without_content_length_is_empty() {
        let mut buffer = b"POST / HTTP/1.1\r\n\r\nstray".to_vec();
        let req = Request::parse(&mut buffer, &ReqLimits::default()).unwrap().unwrap();

        assert_eq!(req.body(), None);
        assert_eq!(str_op(&buffer), "stray");
    }

    #[test]
    fn pipelined_requests() {
        let mut buffer = b"GET /a HTTP/1.1\r\n\r\nPOST /b HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET /c".to_vec();
        let limits = ReqLimits::default();

        let first = Request::parse(&mut buffer, &limits).unwrap().unwrap();
        let second = Request::parse(&mut buffer, &limits).unwrap().unwrap();
        let third = Request::parse(&mut buffer, &limits).unwrap();

        assert_eq!(first.path(), "/a");
        assert_eq!(second.path(), "/b");
        assert_eq!(str(second.body()), Some("ok"));
        assert_eq!(third, None);
        assert_eq!(str_op(&buffer), "GET /c");
    }

    #[test]
    fn content_length_errors() {
        #[rustfmt::skip]
        let cases = [
            ("Content-Length: abc\r\n", ErrorKind::InvalidContentLength),
            ("Content-Length: -1\r\n",  ErrorKind::InvalidContentLength),
            ("Content-Length: \r\n",    ErrorKind::InvalidContentLength),
            (
                "Content-Length: 2000000\r\n",
                ErrorKind::BodyTooLarge { declared: 2_000_000, limit: 1024 * 1024 },
            ),
        ];

        for (header, expected) in cases {
            assert_eq!(parse(&format!("POST / HTTP/1.1\r\n{header}\r\n")), Err(expected));
        }
    }

    #[test]
    fn limits() {
        let limits = ReqLimits {
            header_size: 32,
            ..ReqLimits::default()
        };

        let mut unterminated = vec![b'a'; 33];
        assert_eq!(
            Request::parse(&mut unterminated, &limits),
            Err(ErrorKind::HeadersTooLarge)
        );

        let mut long = b"GET / HTTP/1.1\r\nX-Long: 0123456789abcdef\r\n\r\n".to_vec();
        assert_eq!(Request::parse(&mut long, &limits), Err(ErrorKind::HeadersTooLarge));
    }

    #[test]
    fn invalid_encoding() {
        let mut buffer = b"GET / HTTP/1.1\r\nX: \xff\xfe\r\n\r\n".to_vec();
        assert_eq!(
            Request::parse(&mut buffer, &ReqLimits::default()),
            Err(ErrorKind::InvalidEncoding)
        );
    }
}
