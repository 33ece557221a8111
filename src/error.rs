//! Error types for peernet
//!
//! This module defines the error hierarchy for the connection handler. All
//! network errors are absorbed by the handler and surfaced to the embedder
//! through callbacks carrying a `will_retry` flag; the types here exist so
//! that internal paths can classify failures and so embedders get structured
//! errors from the few fallible public entry points.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for peernet
#[derive(Debug, Error)]
pub enum NetError {
    /// Handler lifecycle errors (double start, not started)
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// DNS resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// TCP connect errors
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Proxy dialogue errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Listener bind errors
    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    /// Inbound framing violations
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Check if this error is recoverable (the operation can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Handler(_) => false,
            Self::Resolve(e) => e.is_recoverable(),
            Self::Connect(e) => e.is_recoverable(),
            Self::Proxy(e) => e.is_recoverable(),
            Self::Bind(e) => e.is_recoverable(),
            Self::Framing(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Handler lifecycle errors
#[derive(Debug, Error)]
pub enum HandlerError {
    /// `start` called while already running
    #[error("Handler already started")]
    AlreadyStarted,

    /// Operation requires a started handler
    #[error("Handler not started")]
    NotStarted,

    /// The handler configuration failed validation
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A destination failed validation before any connection was attempted
    #[error("Invalid destination: {reason}")]
    InvalidDestination { reason: String },
}

/// DNS resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The lookup itself failed
    #[error("Failed to resolve {host}: {reason}")]
    LookupFailed { host: String, reason: String },

    /// The lookup succeeded but produced no usable addresses
    #[error("No addresses for {host} (family filter: {family})")]
    NoAddresses { host: String, family: String },

    /// Numeric-only resolution was requested for a non-literal host
    #[error("Host {host} is not a literal address")]
    NotLiteral { host: String },
}

impl ResolveError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::LookupFailed { .. } | Self::NoAddresses { .. } => true,
            Self::NotLiteral { .. } => false,
        }
    }

    /// Create a lookup failure
    pub fn lookup(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LookupFailed {
            host: host.into(),
            reason: reason.into(),
        }
    }
}

/// TCP connect errors
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Connection failed (refused, unreachable, reset)
    #[error("Failed to connect to {addr}: {reason}")]
    Failed { addr: SocketAddr, reason: String },

    /// Connect attempt exceeded its timeout
    #[error("Connect to {addr} timed out after {timeout_secs}s")]
    Timeout { addr: SocketAddr, timeout_secs: u64 },

    /// Failed to set a socket option on the new stream
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },
}

impl ConnectError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Failed { .. } | Self::Timeout { .. } => true,
            Self::SocketOption { .. } => false,
        }
    }

    /// Create a connection failure
    pub fn failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Failed {
            addr,
            reason: reason.into(),
        }
    }
}

/// SOCKS5 proxy dialogue errors
///
/// Transport-level failures while reaching the proxy itself are reported as
/// [`ConnectError`]; this type covers the proxy protocol exchange.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Proxy spoke an unexpected protocol version
    #[error("Invalid SOCKS version: expected {expected:#04x}, got {actual:#04x}")]
    InvalidVersion { expected: u8, actual: u8 },

    /// Proxy accepted none of the offered authentication methods
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Username/password authentication rejected
    #[error("Proxy authentication failed")]
    AuthFailed,

    /// Proxy refused the CONNECT request
    #[error("Proxy reply (code {code:#04x}): {message}")]
    ConnectRefused { code: u8, message: String },

    /// Malformed proxy message
    #[error("Proxy protocol error: {0}")]
    Protocol(String),

    /// The proxy closed or broke the control stream mid-dialogue
    #[error("Proxy stream error: {0}")]
    Stream(String),

    /// The dialogue did not complete within the attempt timeout
    #[error("Proxy handshake timed out")]
    HandshakeTimeout,
}

impl ProxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectRefused { .. } | Self::Stream(_) | Self::HandshakeTimeout => true,
            Self::InvalidVersion { .. }
            | Self::NoAcceptableMethod
            | Self::AuthFailed
            | Self::Protocol(_) => false,
        }
    }
}

/// Listener bind errors
#[derive(Debug, Error)]
pub enum BindError {
    /// Socket creation failed
    #[error("Failed to create listener socket: {0}")]
    SocketCreation(String),

    /// Failed to set a socket option
    #[error("Failed to set listener option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Binding the address failed
    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// The bind descriptor's host is not a literal address
    #[error("Bind host {host} is not a literal address")]
    NotLiteral { host: String },

    /// Accepting failed fatally, the listener was torn down
    #[error("Accept error: {0}")]
    Accept(String),
}

impl BindError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Accept(_))
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Inbound message framing violations
#[derive(Debug, Error)]
pub enum FramingError {
    /// Declared message length exceeds the framer's limit
    #[error("Frame of {length} bytes exceeds maximum of {max}")]
    Oversized { length: usize, max: usize },

    /// The byte stream does not parse as a frame header
    #[error("Malformed frame header: {0}")]
    BadHeader(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_recoverable() {
        assert!(ResolveError::lookup("example.com", "servfail").is_recoverable());
        assert!(!ResolveError::NotLiteral {
            host: "example.com".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_connect_recoverable() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(ConnectError::failed(addr, "refused").is_recoverable());
        assert!(!ConnectError::SocketOption {
            option: "TCP_NODELAY".into(),
            reason: "nope".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_proxy_recoverable() {
        assert!(ProxyError::Stream("reset".into()).is_recoverable());
        assert!(!ProxyError::AuthFailed.is_recoverable());
        assert!(!ProxyError::NoAcceptableMethod.is_recoverable());
    }

    #[test]
    fn test_top_level_classification() {
        let e = NetError::from(ProxyError::AuthFailed);
        assert!(!e.is_recoverable());

        let e = NetError::from(io::Error::new(io::ErrorKind::TimedOut, "t"));
        assert!(e.is_recoverable());
    }
}
