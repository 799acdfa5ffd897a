//! Error types for netem-router
//!
//! Errors are categorized by subsystem. Per-packet errors never propagate to
//! the packet submitter; they are absorbed where they occur and show up in
//! the statistics snapshot. Only fatal conditions (tun closed, rejected
//! configuration) surface as a shutdown signal.

use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

/// Top-level error type for netem-router
#[derive(Debug, Error)]
pub enum RouterError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet decode/encode errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Flow/session handling errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// The tun fd is gone; the router must shut down
    #[error("Tun device closed: {0}")]
    TunClosed(String),

    /// Router is already stopped or stopping
    #[error("Router is shutting down")]
    ShuttingDown,

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RouterError {
    /// Check if this error is recoverable (the router can keep running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Packet(e) => e.is_recoverable(),
            Self::Session(e) => e.is_recoverable(),
            Self::TunClosed(_) | Self::ShuttingDown => false,
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

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, conflicting fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Packet decode/encode errors
///
/// These all result in the offending frame being dropped with a log line;
/// none of them stop the router.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Frame too short or internally inconsistent
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// Frame shorter than a header demands
    #[error("Truncated packet: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    /// IP version other than 4
    #[error("Unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// L4 protocol the router does not forward (not UDP/TCP/ICMP-echo)
    #[error("Unsupported protocol {0}")]
    UnsupportedProtocol(u8),

    /// Outbound frame whose source is not the tun's assigned address
    #[error("Source address {0} is not the tun address")]
    SourceNotTun(std::net::Ipv4Addr),

    /// Segment SEQ more than the permitted gap past the expected SEQ
    #[error("Sequence gap of {gap} bytes exceeds the reassembly window")]
    SequenceGapTooLarge { gap: u32 },
}

impl PacketError {
    /// All packet errors are recoverable: the frame is dropped, the router
    /// keeps running.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a malformed-packet error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Flow/session handling errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// The protect() callback refused the socket; the nascent session is
    /// closed and the triggering packet dropped
    #[error("Socket protection failed for {dst}")]
    ProtectFailed { dst: SocketAddrV4 },

    /// Native socket connect failed
    #[error("Failed to connect to {dst}: {reason}")]
    ConnectFailed { dst: SocketAddrV4, reason: String },

    /// Native socket I/O error mid-session; the session is closed
    #[error("Native socket I/O error: {0}")]
    NativeSocketIo(#[from] io::Error),

    /// Operation on a session that has already been closed
    #[error("Session is closed")]
    Closed,
}

impl SessionError {
    /// Check if this error is recoverable
    ///
    /// Session errors close the affected session but never the router. A
    /// UDP flow re-opens on the next outbound datagram; a TCP client is
    /// left to time out (no RST is synthesized upstream).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ProtectFailed { .. } => false,
            Self::ConnectFailed { .. } | Self::Closed => true,
            Self::NativeSocketIo(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a connect-failed error
    pub fn connect_failed(dst: SocketAddrV4, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            dst,
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with `RouterError`
pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        let config_err = ConfigError::ValidationError("test".into());
        assert!(!config_err.is_recoverable());

        let packet_err = PacketError::UnsupportedVersion(6);
        assert!(packet_err.is_recoverable());

        let protect_err = SessionError::ProtectFailed {
            dst: "8.8.8.8:53".parse().unwrap(),
        };
        assert!(!protect_err.is_recoverable());

        let reset: SessionError =
            io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(reset.is_recoverable());

        let fatal = RouterError::TunClosed("read returned 0".into());
        assert!(!fatal.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = PacketError::SourceNotTun("192.168.1.7".parse().unwrap());
        assert!(err.to_string().contains("192.168.1.7"));

        let err = SessionError::connect_failed(
            "1.1.1.1:443".parse().unwrap(),
            "connection refused",
        );
        let msg = err.to_string();
        assert!(msg.contains("1.1.1.1:443"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let router_err: RouterError = io_err.into();
        assert!(router_err.is_recoverable());

        let config_err = ConfigError::validation("bad percentile");
        let router_err: RouterError = config_err.into();
        assert!(!router_err.is_recoverable());
    }
}
