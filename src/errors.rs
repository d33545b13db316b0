use std::{error, fmt, io};

/// Fatal, per-connection failures.
///
/// Every variant except `Io` and `ConnectionClosed` comes from the HTTP
/// parser; the connection that produced it is closed without a response.
/// WebSocket protocol violations never show up here, they are answered
/// with a close frame instead (see [`CloseCode`](crate::CloseCode)).
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidRequestLine,
    InvalidMethod,
    InvalidUrl,
    InvalidVersion,

    InvalidHeader,
    InvalidContentLength,
    InvalidEncoding,
    HeadersTooLarge,
    BodyTooLarge {
        declared: usize,
        limit: usize,
    },

    ConnectionClosed,
    Io(IoError),
}

impl ErrorKind {
    /// `true` for failures that are the peer's fault rather than the socket's.
    #[inline]
    pub(crate) const fn is_parse_error(&self) -> bool {
        !matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BodyTooLarge { declared, limit } => {
                write!(f, "BodyTooLarge: content-length {declared} exceeds {limit}")
            }
            Self::Io(err) => write!(f, "Io: {}", err.0),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
