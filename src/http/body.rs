//! Request body data and the parsers that produce it.
//!
//! The HTTP handler offers every complete request to the registered
//! [`BodyParser`]s in order; the first one whose [`matches`](BodyParser::matches)
//! returns `true` builds the [`BodyData`]. Without a match the body data is
//! empty, the raw bytes stay available through [`Request::body`].

use crate::{http::query::QueryPairs, Request};
use std::collections::HashMap;

/// One named field of a request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodyField {
    pub name: String,
    pub file_name: Option<String>,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    /// `data` decoded as text, when it is valid UTF-8.
    pub text: Option<String>,
}

/// Body fields of one request, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodyData {
    fields: HashMap<String, BodyField>,
}

impl BodyData {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, replacing an earlier field with the same name.
    #[inline]
    pub fn insert(&mut self, field: BodyField) {
        self.fields.insert(field.name.clone(), field);
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&BodyField> {
        self.fields.get(name)
    }

    /// Shortcut for the decoded text of a field.
    #[inline]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name)?.text.as_deref()
    }

    #[inline]
    pub fn fields(&self) -> impl Iterator<Item = &BodyField> {
        self.fields.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Turns the raw body of a request into [`BodyData`].
///
/// # Examples
/// ```
/// use maker_ws::{BodyData, BodyField, BodyParser, Request};
///
/// struct PlainText;
///
/// impl BodyParser for PlainText {
///     fn matches(&self, req: &Request, _: &[u8]) -> bool {
///         req.content_type().is_some_and(|t| t.starts_with("text/plain"))
///     }
///
///     fn parse(&self, _: &Request, raw: &[u8]) -> BodyData {
///         let mut data = BodyData::new();
///         data.insert(BodyField {
///             name: "text".into(),
///             data: raw.to_vec(),
///             text: String::from_utf8(raw.to_vec()).ok(),
///             ..BodyField::default()
///         });
///         data
///     }
/// }
/// ```
pub trait BodyParser: Send + Sync + 'static {
    /// Decides whether this parser handles the request, usually by sniffing
    /// its `Content-Type`.
    fn matches(&self, request: &Request, raw: &[u8]) -> bool;

    fn parse(&self, request: &Request, raw: &[u8]) -> BodyData;
}

/// Ordered list of body parsers, first match wins.
#[derive(Default)]
pub(crate) struct BodyParsers(Vec<Box<dyn BodyParser>>);

impl BodyParsers {
    #[inline]
    pub(crate) fn push(&mut self, parser: Box<dyn BodyParser>) {
        self.0.push(parser);
    }

    pub(crate) fn parse(&self, request: &Request) -> BodyData {
        let raw = request.body().unwrap_or_default();

        self.0
            .iter()
            .find(|parser| parser.matches(request, raw))
            .map(|parser| parser.parse(request, raw))
            .unwrap_or_default()
    }
}

/// Parser for `application/x-www-form-urlencoded` bodies.
///
/// Values are kept raw: no percent-decoding and no `+` to space conversion.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormParser;

impl BodyParser for FormParser {
    fn matches(&self, request: &Request, _: &[u8]) -> bool {
        request.content_type().is_some_and(|value| {
            value
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        })
    }

    fn parse(&self, request: &Request, raw: &[u8]) -> BodyData {
        let charset = request
            .content_type()
            .and_then(|value| {
                value
                    .split(';')
                    .skip(1)
                    .filter_map(|param| param.trim().split_once('='))
                    .find(|(key, _)| key.eq_ignore_ascii_case("charset"))
            })
            .map(|(_, value)| value.trim_matches('"').to_owned());

        let mut data = BodyData::new();
        for (name, value) in QueryPairs::new(raw).filter(|(name, _)| !name.is_empty()) {
            data.insert(BodyField {
                name: String::from_utf8_lossy(name).into_owned(),
                file_name: None,
                data: value.to_vec(),
                content_type: None,
                charset: charset.clone(),
                text: simdutf8::basic::from_utf8(value).ok().map(str::to_owned),
            });
        }

        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl BodyParser for Fixed {
        fn matches(&self, _: &Request, raw: &[u8]) -> bool {
            raw.starts_with(self.0.as_bytes())
        }

        fn parse(&self, _: &Request, _: &[u8]) -> BodyData {
            let mut data = BodyData::new();
            data.insert(BodyField {
                name: self.0.into(),
                ..BodyField::default()
            });
            data
        }
    }

    fn post(content_type: &str, body: &str) -> Request {
        Request::from_text(&format!(
            "POST / HTTP/1.1\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ))
    }

    #[test]
    fn first_match_wins() {
        let mut parsers = BodyParsers::default();
        parsers.push(Box::new(Fixed("ab")));
        parsers.push(Box::new(Fixed("a")));

        let data = parsers.parse(&post("text/plain", "abc"));
        assert!(data.get("ab").is_some());
        assert!(data.get("a").is_none());

        let data = parsers.parse(&post("text/plain", "axe"));
        assert!(data.get("a").is_some());
    }

    #[test]
    fn no_match_is_empty() {
        let mut parsers = BodyParsers::default();
        parsers.push(Box::new(FormParser));

        assert!(parsers.parse(&post("application/json", "{}")).is_empty());
        assert!(BodyParsers::default().parse(&post("text/plain", "x")).is_empty());
    }

    #[test]
    fn form_fields() {
        let req = post(
            "application/x-www-form-urlencoded; charset=UTF-8",
            "name=john&age=25&flag&=skipped&bin=%FF",
        );

        assert!(FormParser.matches(&req, req.body().unwrap()));
        let data = FormParser.parse(&req, req.body().unwrap());

        assert_eq!(data.len(), 4);
        assert_eq!(data.text("name"), Some("john"));
        assert_eq!(data.text("age"), Some("25"));
        assert_eq!(data.text("flag"), Some(""));
        assert_eq!(data.get("bin").unwrap().data, b"%FF");
        assert_eq!(data.get("name").unwrap().charset.as_deref(), Some("UTF-8"));
    }

    #[test]
    fn form_content_type_sniffing() {
        #[rustfmt::skip]
        let cases = [
            ("application/x-www-form-urlencoded",               true),
            ("Application/X-WWW-Form-Urlencoded; charset=utf-8", true),
            ("multipart/form-data; boundary=x",                  false),
            ("text/plain",                                        false),
        ];

        for (content_type, expected) in cases {
            let req = post(content_type, "a=1");
            assert_eq!(FormParser.matches(&req, b"a=1"), expected, "{content_type}");
        }
    }
}
