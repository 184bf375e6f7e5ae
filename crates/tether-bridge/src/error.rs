//! Error types for the plugin bridge

use crate::protocol::ChannelKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
    Configuration,
    Spawning,
    Attaching,
    Accepting,
    Initializing,
}

impl std::fmt::Display for StartupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupStage::Configuration => write!(f, "resolving configuration"),
            StartupStage::Spawning => write!(f, "spawning host process"),
            StartupStage::Attaching => write!(f, "attaching to group host"),
            StartupStage::Accepting => write!(f, "accepting channels"),
            StartupStage::Initializing => write!(f, "reading plugin descriptor"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Bridge startup failed while {stage}\n  Reason: {reason}")]
    StartupFailed { stage: StartupStage, reason: String },

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: u64, limit: u64 },

    #[error("Channel connected out of order: expected {expected}, got tag {actual}")]
    ChannelOrder { expected: ChannelKind, actual: u8 },

    #[error("The {0} channel is closed")]
    ChannelClosed(ChannelKind),

    #[error("Host process exited unexpectedly")]
    ProcessCrashed,

    #[error("Failed to spawn host process '{}': {source}", path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Bridge instance is closed")]
    InstanceClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl BridgeError {
    /// Whether this error means the peer went away rather than that it sent
    /// something we could not understand.
    pub fn is_disconnect(&self) -> bool {
        match self {
            BridgeError::ChannelClosed(_) | BridgeError::ProcessCrashed => true,
            BridgeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_stage_display() {
        assert_eq!(
            StartupStage::Configuration.to_string(),
            "resolving configuration"
        );
        assert_eq!(StartupStage::Spawning.to_string(), "spawning host process");
        assert_eq!(StartupStage::Attaching.to_string(), "attaching to group host");
        assert_eq!(StartupStage::Accepting.to_string(), "accepting channels");
        assert_eq!(
            StartupStage::Initializing.to_string(),
            "reading plugin descriptor"
        );
    }

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = BridgeError::MessageTooLarge {
            size: 4096,
            limit: 1024,
        };
        assert!(err.to_string().contains("4096"));
        assert!(err.to_string().contains("1024"));

        let err = BridgeError::ProcessCrashed;
        assert_eq!(err.to_string(), "Host process exited unexpectedly");

        let err = BridgeError::ChannelOrder {
            expected: ChannelKind::Dispatch,
            actual: 3,
        };
        assert!(err.to_string().contains("dispatch"));
        assert!(err.to_string().contains("tag 3"));
    }

    #[test]
    fn test_disconnect_classification() {
        let eof = BridgeError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(eof.is_disconnect());
        assert!(BridgeError::ChannelClosed(ChannelKind::Audio).is_disconnect());
        assert!(!BridgeError::Framing("bad".into()).is_disconnect());
        assert!(!BridgeError::ProtocolError("early".into()).is_disconnect());
    }
}
