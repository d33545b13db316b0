//! Zero-copy splitter for `key=value&key=value` strings.
//!
//! Used for URL query components and `application/x-www-form-urlencoded`
//! bodies. **No percent-decoding is performed** (`%20`, `+`, etc. are kept
//! as-is).

use memchr::memchr;

/// Iterator over the `(key, value)` pairs of a query string.
///
/// A leading `?` is skipped, a pair without `=` yields an empty value, and
/// empty segments (`a=1&&b=2`) yield `("", "")`.
///
/// # Examples
/// ```
/// use maker_ws::QueryPairs;
///
/// let pairs: Vec<_> = QueryPairs::new(b"?flag&name=john").collect();
/// assert_eq!(pairs, [(&b"flag"[..], &b""[..]), (&b"name"[..], &b"john"[..])]);
/// ```
#[derive(Debug, Clone)]
pub struct QueryPairs<'a> {
    data: &'a [u8],
}

impl<'a> QueryPairs<'a> {
    #[inline]
    pub fn new(query: &'a [u8]) -> Self {
        let data = match query {
            [b'?', rest @ ..] => rest,
            _ => query,
        };

        Self { data }
    }
}

impl<'a> Iterator for QueryPairs<'a> {
    type Item = (&'a [u8], &'a [u8]);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }

        let end = memchr(b'&', self.data).unwrap_or(self.data.len());
        let segment = &self.data[..end];
        self.data = self.data.get(end + 1..).unwrap_or_default();

        Some(match memchr(b'=', segment) {
            Some(split) => (&segment[..split], &segment[split + 1..]),
            None => (segment, b""),
        })
    }
}
