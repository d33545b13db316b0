//! HTTP response builder.
//!
//! The builder keeps the header bytes and the body bytes in two separate
//! buffers. The HTTP handler writes the header buffer to completion first,
//! then the body buffer.

use crate::{
    http::types::{StatusCode, Version},
    server::connection::HandlerKind,
    BodyWriter, WriteBuffer,
};
use std::{borrow::Cow, rc::Rc, sync::Arc};

/// HTTP response builder for constructing server responses.
///
/// Build responses by chaining methods in strict order:
/// [`status()`](Response::status) -> headers -> [`body()`](Response::body)
/// or [`body_with()`](Response::body_with).
///
/// Instances are created by the server and passed to
/// [`Handler::handle`](crate::Handler::handle).
///
/// # Examples
/// ```
/// use maker_ws::{Handled, Request, Response, StatusCode};
///
/// // In your implementation `Handler`
/// fn handle(_req: &Request, resp: &mut Response) -> Handled {
///     resp
///         .status(StatusCode::Ok)
///         .header("content-type", "text/html")
///         .body("<h1>Hello World</h1>")
/// }
/// ```
///
/// # Panics
/// All methods perform ordering checks in `debug` mode that panic on violations.
#[derive(Debug)]
pub struct Response {
    head: Vec<u8>,
    body: Vec<u8>,
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    pub(crate) handoff: Option<HandlerKind>,
    informational: bool,
    state: ResponseState,
}

/// Proof that a [`Response`] was finalized.
#[doc(hidden)]
pub struct Handled(());

#[derive(Debug, Clone, Copy, PartialEq)]
enum ResponseState {
    Clean,
    Headers,
    Complete,
}

impl Response {
    #[inline]
    pub(crate) fn new(version: Version, keep_alive: bool) -> Self {
        Self {
            head: Vec::with_capacity(256),
            body: Vec::new(),
            version,
            keep_alive,
            handoff: None,
            informational: false,
            state: ResponseState::Clean,
        }
    }

    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        self.state == ResponseState::Complete
    }

    /// Splits the finished response into header bytes and body bytes.
    #[inline]
    pub(crate) fn into_staged(self) -> (Vec<u8>, Vec<u8>) {
        (self.head, self.body)
    }
}

impl Response {
    /// Forces the connection to close after this response.
    ///
    /// # Panics
    /// Panics in `debug` mode when called after the body was written.
    #[inline]
    #[track_caller]
    pub fn close(&mut self) -> &mut Self {
        debug_assert!(
            self.state != ResponseState::Complete,
            "Must be called before any finalizing method",
        );

        self.keep_alive = false;
        self
    }

    /// Hands the connection over to another handler once this response has
    /// been written completely.
    ///
    /// Usually set through [`upgrade_websocket`](Response::upgrade_websocket),
    /// which also writes the handshake headers.
    #[inline]
    #[track_caller]
    pub fn upgrade(&mut self, target: HandlerKind) -> &mut Self {
        debug_assert!(
            self.state != ResponseState::Complete,
            "Must be called before any finalizing method",
        );

        self.handoff = Some(target);
        self
    }

    /// Sets the HTTP status code. Must be called first.
    ///
    /// # Examples
    /// ```
    /// # maker_ws::run_test(|_, resp| {
    /// use maker_ws::StatusCode;
    ///
    /// resp.status(StatusCode::NotFound).body("Not found")
    /// # });
    /// ```
    ///
    /// # Panics
    /// Panics in `debug` mode when called twice.
    #[inline]
    #[track_caller]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Clean,
            "`status` must be called exactly once, before headers"
        );

        self.head
            .extend_from_slice(status.into_first_line(self.version));
        self.informational = status.as_u16() < 200;
        self.state = ResponseState::Headers;
        self
    }

    /// Appends a header line `name: value`.
    ///
    /// `content-length` and `connection: close` are written by the builder,
    /// do not set them here.
    ///
    /// # Examples
    /// ```
    /// # maker_ws::run_test(|_, resp| {
    /// use maker_ws::StatusCode;
    ///
    /// resp.status(StatusCode::Ok)
    ///     .header("content-type", "application/json")
    ///     .header("x-request-number", 42)
    ///     .body(r#"{"ok":true}"#)
    /// # });
    /// ```
    #[inline]
    #[track_caller]
    pub fn header<N: WriteBuffer, V: WriteBuffer>(&mut self, name: N, value: V) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Headers go after `status` and before the body"
        );

        name.write_to(&mut self.head);
        self.head.extend_from_slice(b": ");
        value.write_to(&mut self.head);
        self.head.extend_from_slice(b"\r\n");
        self
    }

    /// Writes the body and finalizes the response.
    #[inline]
    #[track_caller]
    pub fn body<T: WriteBuffer>(&mut self, data: T) -> Handled {
        self.body_with(|w| w.write(data))
    }

    /// Writes the body through a [`BodyWriter`] and finalizes the response.
    ///
    /// # Examples
    /// ```
    /// # maker_ws::run_test(|_, resp| {
    /// use maker_ws::StatusCode;
    /// use std::io::Write;
    ///
    /// resp.status(StatusCode::Ok)
    ///     .body_with(|w| {
    ///         w.write("Sum: ");
    ///         write!(w, "{}", 2 + 2).unwrap();
    ///     })
    /// # });
    /// ```
    #[inline]
    #[track_caller]
    pub fn body_with<F: FnOnce(&mut BodyWriter)>(&mut self, f: F) -> Handled {
        debug_assert!(
            self.state == ResponseState::Headers,
            "The body goes after `status` and headers, exactly once"
        );

        f(&mut BodyWriter(&mut self.body));

        if !self.keep_alive && self.handoff.is_none() {
            self.head.extend_from_slice(b"connection: close\r\n");
        }
        // RFC 9110, 8.6: no Content-Length in 1xx responses
        if !self.informational {
            self.head.extend_from_slice(b"content-length: ");
            self.body.len().write_to(&mut self.head);
            self.head.extend_from_slice(b"\r\n");
        }
        self.head.extend_from_slice(b"\r\n");

        self.state = ResponseState::Complete;
        Handled(())
    }
}

pub mod write {
    use super::*;

    /// Writer for constructing the HTTP response body.
    /// Used in [body_with](Response::body_with).
    #[derive(Debug)]
    pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

    impl BodyWriter<'_> {
        /// Appends content to the response body.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) {
            value.write_to(self.0);
        }
    }

    impl std::io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Trait for writing data to the [`Response`] buffers.
    ///
    /// Implemented for strings, bytes, booleans and integer types.
    /// Floating-point numbers are left out on purpose: format them yourself
    /// with the precision you need.
    ///
    /// # Example
    /// ```
    /// use maker_ws::WriteBuffer;
    ///
    /// struct MyString(String);
    ///
    /// impl WriteBuffer for MyString {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         buffer.extend_from_slice(self.0.as_bytes())
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        /// Writes the value's representation directly to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_bytes {
        ($($ty:ty => |$v:ident| $bytes:expr;)*) => {$(
            impl WriteBuffer for $ty {
                #[inline]
                fn write_to(&self, buffer: &mut Vec<u8>) {
                    let $v = self;
                    buffer.extend_from_slice($bytes);
                }
            }
        )*};
    }

    impl_write_bytes! {
        str => |v| v.as_bytes();
        String => |v| v.as_bytes();
        [u8] => |v| v;
        Vec<u8> => |v| v;
        Cow<'_, str> => |v| v.as_bytes();
        Cow<'_, [u8]> => |v| v;
        bool => |v| if *v { b"true".as_slice() } else { b"false".as_slice() };
    }

    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            (**self).write_to(buffer);
        }
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for Box<T> {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            (**self).write_to(buffer);
        }
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for Rc<T> {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            (**self).write_to(buffer);
        }
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for Arc<T> {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            (**self).write_to(buffer);
        }
    }

    macro_rules! impl_write_int {
        ($($ty:ty),*) => {$(
            impl WriteBuffer for $ty {
                #[inline]
                fn write_to(&self, buffer: &mut Vec<u8>) {
                    use std::io::Write;
                    // Writing into a Vec cannot fail
                    let _ = write!(buffer, "{}", self);
                }
            }
        )*};
    }

    impl_write_int!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);
}
