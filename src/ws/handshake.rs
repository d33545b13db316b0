//! Opening handshake ([RFC 6455, Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2)).

use crate::{Handled, HandlerKind, Request, Response, StatusCode, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
///
/// # Examples
/// ```
/// assert_eq!(
///     maker_ws::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    STANDARD.encode(sha1.finalize())
}

/// Checks the upgrade headers and returns the client key on success.
fn upgrade_key(req: &Request) -> Option<&str> {
    let has_token = |name: &str, token: &str| {
        req.header(name).is_some_and(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    };

    if req.version() != Version::Http11
        || !has_token("upgrade", "websocket")
        || !has_token("connection", "upgrade")
        || req.header("sec-websocket-version") != Some("13")
    {
        return None;
    }

    req.header("sec-websocket-key")
        .filter(|key| STANDARD.decode(key).is_ok_and(|raw| raw.len() == 16))
}

impl Response {
    /// Answers a WebSocket upgrade request.
    ///
    /// A valid request gets `101 Switching Protocols` and the connection is
    /// handed over to the WebSocket loop after the response is written.
    /// Anything else gets `400 Bad Request` and stays on HTTP.
    ///
    /// # Examples
    /// ```
    /// use maker_ws::{BodyData, Handled, Handler, Request, Response, StatusCode};
    ///
    /// struct Chat;
    ///
    /// impl Handler for Chat {
    ///     fn handle(&self, req: &Request, _: &BodyData, resp: &mut Response) -> Handled {
    ///         match req.path() {
    ///             "/ws" => resp.upgrade_websocket(req),
    ///             _ => resp.status(StatusCode::NotFound).body("Not found"),
    ///         }
    ///     }
    /// }
    /// ```
    #[track_caller]
    pub fn upgrade_websocket(&mut self, req: &Request) -> Handled {
        match upgrade_key(req) {
            Some(key) => self
                .status(StatusCode::SwitchingProtocols)
                .upgrade(HandlerKind::WebSocket)
                .header("upgrade", "websocket")
                .header("connection", "Upgrade")
                .header("sec-websocket-accept", accept_key(key))
                .body(""),
            None => self
                .status(StatusCode::BadRequest)
                .close()
                .body("Invalid WebSocket upgrade request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn upgrade_request(extra: &str) -> String {
        format!(
            "GET /chat HTTP/1.1\r\nHost: server.example.com\r\n{extra}\r\n",
        )
    }

    fn respond(text: &str) -> Response {
        let req = Request::from_text(text);
        let mut resp = Response::new(req.version(), req.is_keep_alive());
        resp.upgrade_websocket(&req);
        resp
    }

    #[test]
    fn rfc_sample_key() {
        assert_eq!(accept_key(KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn switching_protocols() {
        let resp = respond(&upgrade_request(&format!(
            "Upgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 13\r\n"
        )));

        assert_eq!(resp.handoff, Some(HandlerKind::WebSocket));
        let (head, body) = resp.into_staged();
        assert_eq!(
            str_op(&head),
            "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\n\
             sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
        assert!(body.is_empty());
    }

    #[test]
    fn rejected_upgrades() {
        let valid = [
            "Upgrade: websocket\r\n",
            "Connection: Upgrade\r\n",
            "Sec-WebSocket-Version: 13\r\n",
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
        ];

        #[rustfmt::skip]
        let replacements = [
            (0, ""),
            (0, "Upgrade: h2c\r\n"),
            (1, ""),
            (1, "Connection: keep-alive\r\n"),
            (2, ""),
            (2, "Sec-WebSocket-Version: 8\r\n"),
            (3, ""),
            (3, "Sec-WebSocket-Key: short\r\n"),
        ];

        for (index, replacement) in replacements {
            let mut headers = valid;
            headers[index] = replacement;

            let resp = respond(&upgrade_request(&headers.concat()));

            assert_eq!(resp.handoff, None, "{replacement:?}");
            assert!(!resp.keep_alive);
            assert!(str_op(&resp.into_staged().0).starts_with("HTTP/1.1 400 Bad Request\r\n"));
        }
    }

    #[test]
    fn http_10_is_rejected() {
        let resp = respond(&format!(
            "GET / HTTP/1.0\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {KEY}\r\n\r\n"
        ));

        assert_eq!(resp.handoff, None);
    }
}
