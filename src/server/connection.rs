use std::fmt;
use uuid::Uuid;

/// Opaque, globally unique identity of one accepted socket.
///
/// The id is assigned at accept time and survives a hand-off, so the HTTP
/// request that upgraded a connection and the later WebSocket callbacks
/// report the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[inline]
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero id, never assigned to a real connection.
    #[inline]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    #[inline]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Closed set of protocol handlers a connection can be registered with.
///
/// Used as the hand-off target of a [`Response`](crate::Response).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Http,
    WebSocket,
}

impl HandlerKind {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::WebSocket => "websocket",
        }
    }
}
