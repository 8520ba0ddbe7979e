//! Bridge error taxonomy
//!
//! Configuration and transport errors are fatal to `configure()`/`connect()`
//! and returned to the caller. Per-frame problems never surface as `Err` on
//! the tick thread: they become [`DropReason`]s that are counted and logged.
//! Per-connection failures surface as state transitions on the pipelines.

use thiserror::Error;

use crate::convert::ConvertError;
use crate::pool::PoolError;
use crate::settings::SettingsError;
use crate::transport::TransportError;

/// Why a single frame was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The hand-off queue to the I/O thread was full.
    QueueFull,
    /// More frames were in flight than the staleness policy allows.
    Stale,
    /// The frame buffer pool hit its ceiling.
    PoolExhausted,
    /// Pixel or audio conversion failed.
    Conversion,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::QueueFull => write!(f, "send queue full"),
            DropReason::Stale => write!(f, "pipeline behind"),
            DropReason::PoolExhausted => write!(f, "buffer pool exhausted"),
            DropReason::Conversion => write!(f, "conversion failed"),
        }
    }
}

/// Errors returned by bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Invalid target or source settings, or a mismatched audio format.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The transport layer is not ready.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Frame dropped: {0}")]
    FrameDropped(DropReason),

    /// The connected source went away.
    #[error("Source lost: {0}")]
    SourceLost(String),

    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Source already connected: {0}")]
    AlreadyConnected(String),

    #[error("Send target name already in use: {0}")]
    NameInUse(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(#[from] PoolError),

    /// Operation not valid in the current pipeline state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

impl BridgeError {
    /// Build a configuration error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::Configuration(msg.into())
    }

    /// Map a transport failure during configure/connect onto the bridge taxonomy.
    pub fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::NotReady(msg) => BridgeError::TransportUnavailable(msg),
            TransportError::NotFound(name) => BridgeError::NotFound(name),
            TransportError::NameInUse(name) => BridgeError::NameInUse(name),
            TransportError::ConnectionReset(name) => BridgeError::SourceLost(name),
            other => BridgeError::Transport(other),
        }
    }

    /// True for errors the caller may retry by reconfiguring.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportUnavailable(_) | BridgeError::FrameDropped(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::NotFound("HOST (Test)".to_string());
        assert_eq!(format!("{}", err), "Source not found: HOST (Test)");

        let err = BridgeError::FrameDropped(DropReason::QueueFull);
        assert_eq!(format!("{}", err), "Frame dropped: send queue full");

        let err = BridgeError::config("odd width 1919");
        assert_eq!(format!("{}", err), "Configuration error: odd width 1919");
    }

    #[test]
    fn test_retryable() {
        assert!(BridgeError::TransportUnavailable("not ready".into()).is_retryable());
        assert!(!BridgeError::AlreadyConnected("x".into()).is_retryable());
        assert!(!BridgeError::config("bad").is_retryable());
    }

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            BridgeError::from_transport(TransportError::NotReady("offline".into())),
            BridgeError::TransportUnavailable(_)
        ));
        assert!(matches!(
            BridgeError::from_transport(TransportError::NameInUse("A (B)".into())),
            BridgeError::NameInUse(_)
        ));
        assert!(matches!(
            BridgeError::from_transport(TransportError::Closed),
            BridgeError::Transport(TransportError::Closed)
        ));
    }
}
