//! Close status codes ([RFC 6455, Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4)).

macro_rules! close_codes {
    ($(
        $(#[$docs:meta])*
        $name:ident = $num:literal;
    )+) => {
        /// Status code carried by a close frame.
        ///
        /// Codes without a name are classified by range: `0..=999` is
        /// [`ReservedUnused`](Self::ReservedUnused), `2000..=2999` is
        /// [`ReservedFuture`](Self::ReservedFuture), the rest is
        /// [`Other`](Self::Other).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CloseCode {
            $(
                #[doc = concat!("`", stringify!($num), "`")]
                $(#[$docs])*
                $name,
            )+
            /// `0..=999`, never used.
            ReservedUnused(u16),
            /// `2000..=2999`, reserved for future extensions of the protocol.
            ReservedFuture(u16),
            /// Any other value, e.g. application codes `3000..=4999`.
            Other(u16),
        }

        impl CloseCode {
            #[inline]
            pub const fn from_u16(code: u16) -> Self {
                match code {
                    $($num => Self::$name,)+
                    0..=999 => Self::ReservedUnused(code),
                    2000..=2999 => Self::ReservedFuture(code),
                    _ => Self::Other(code),
                }
            }

            #[inline]
            pub const fn as_u16(&self) -> u16 {
                match self {
                    $(Self::$name => $num,)+
                    Self::ReservedUnused(code)
                    | Self::ReservedFuture(code)
                    | Self::Other(code) => *code,
                }
            }
        }
    };
}

close_codes! {
    /// Normal closure.
    Normal = 1000;
    /// The endpoint is going away (server shutdown, page navigation).
    GoingAway = 1001;
    /// The peer violated the protocol.
    ProtocolError = 1002;
    /// The peer sent a data type the endpoint cannot accept.
    InvalidData = 1003;
    /// No status code was present. Never sent on the wire.
    NoStatus = 1005;
    /// The connection dropped without a close frame. Never sent on the wire.
    Abnormal = 1006;
    /// A text message was not valid UTF-8.
    InconsistentData = 1007;
    /// A message violated the endpoint's policy.
    PolicyViolation = 1008;
    /// A message was too big to process.
    MessageTooBig = 1009;
    /// The client expected an extension the server did not negotiate.
    MissingExtension = 1010;
    /// The server hit an unexpected condition.
    UnexpectedCondition = 1011;
    /// TLS handshake failure. Never sent on the wire.
    TlsFailure = 1015;
}

impl CloseCode {
    /// Reserved codes must be rejected when a peer sends them.
    #[inline]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::ReservedUnused(_) | Self::ReservedFuture(_))
    }
}

impl From<u16> for CloseCode {
    #[inline]
    fn from(code: u16) -> Self {
        Self::from_u16(code)
    }
}

impl From<CloseCode> for u16 {
    #[inline]
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}
