//! Error types for simmpi.

use thiserror::Error;

/// Socket-level error codes.
///
/// These are carried inside operation results (a socket operation resolves
/// to a value *and* an errno, mirroring the underlying stream socket), and
/// only promoted to [`Error`] at the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SockErr {
    /// No error.
    #[default]
    NotError,
    /// Operation would block; retry on the next wake.
    Again,
    /// Message larger than the transfer unit allows.
    MsgSize,
    /// The connection was shut down.
    Shutdown,
    /// Operation not supported in the current socket state.
    OpNotSupp,
    /// Invalid argument.
    Inval,
    /// Bad socket handle (absent or unusable).
    Badf,
    /// No route to the requested address.
    NoRouteToHost,
    /// Address not available on this host.
    AddrNotAvail,
    /// Address already in use.
    AddrInUse,
    /// Socket is not connected.
    NotConn,
    /// Socket is already connected.
    IsConn,
}

impl SockErr {
    /// Symbolic name, as surfaced in user-visible failure messages.
    pub fn symbol(&self) -> &'static str {
        match self {
            SockErr::NotError => "ERROR_NOTERROR",
            SockErr::Again => "ERROR_AGAIN",
            SockErr::MsgSize => "ERROR_MSGSIZE",
            SockErr::Shutdown => "ERROR_SHUTDOWN",
            SockErr::OpNotSupp => "ERROR_OPNOTSUPP",
            SockErr::Inval => "ERROR_INVAL",
            SockErr::Badf => "ERROR_BADF",
            SockErr::NoRouteToHost => "ERROR_NOROUTETOHOST",
            SockErr::AddrNotAvail => "ERROR_ADDRNOTAVAIL",
            SockErr::AddrInUse => "ERROR_ADDRINUSE",
            SockErr::NotConn => "ERROR_NOTCONN",
            SockErr::IsConn => "ERROR_ISCONN",
        }
    }

    /// Whether the error is transient (retriable on the next wake).
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, SockErr::Again | SockErr::MsgSize)
    }

    /// Whether this is an actual error.
    #[inline]
    pub fn is_error(&self) -> bool {
        *self != SockErr::NotError
    }
}

impl std::fmt::Display for SockErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Error type for simmpi operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A send to a peer rank failed.
    #[error("send to rank {rank} failed: {source}")]
    Send {
        rank: u64,
        #[source]
        source: Box<Error>,
    },
    /// A receive from a peer rank failed.
    #[error("receive from rank {rank} failed: {source}")]
    Recv {
        rank: u64,
        #[source]
        source: Box<Error>,
    },
    /// Encoding or decoding a typed value over a socket failed.
    #[error("codec for {what} failed, reason: {errno}")]
    Codec { what: &'static str, errno: SockErr },
    /// Accepting an inbound connection failed.
    #[error("accept failed, reason: {errno}")]
    Accept { errno: SockErr },
    /// An outbound connection failed.
    #[error("connect failed, reason: {errno}")]
    Connect { errno: SockErr },
    /// A socket operation surfaced a terminal error.
    #[error("socket error, reason: {errno}")]
    Socket { errno: SockErr },
    /// A protocol invariant was violated; these are fatal to the collective
    /// that observed them.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The operation was terminated without a value, or its captured
    /// failure was already consumed by an earlier reader.
    #[error("operation aborted")]
    Aborted,
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Wrap an error with the peer rank of a failed send.
    pub fn send_to(rank: u64, source: Error) -> Self {
        Error::Send {
            rank,
            source: Box::new(source),
        }
    }

    /// Wrap an error with the peer rank of a failed receive.
    pub fn recv_from(rank: u64, source: Error) -> Self {
        Error::Recv {
            rank,
            source: Box::new(source),
        }
    }
}

/// Result type for simmpi operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols() {
        assert_eq!(SockErr::Shutdown.symbol(), "ERROR_SHUTDOWN");
        assert_eq!(SockErr::NotError.symbol(), "ERROR_NOTERROR");
        assert!(SockErr::Again.is_transient());
        assert!(!SockErr::Badf.is_transient());
        assert!(!SockErr::NotError.is_error());
    }

    #[test]
    fn test_message_carries_rank_and_symbol() {
        let err = Error::send_to(
            3,
            Error::Codec {
                what: "u64",
                errno: SockErr::Shutdown,
            },
        );
        let text = err.to_string();
        assert!(text.contains("rank 3"));
        let inner = std::error::Error::source(&err).unwrap().to_string();
        assert!(inner.contains("ERROR_SHUTDOWN"));
    }
}
