//! Connection state machine

use crate::{Error, Result};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Channel requested, startup handshake in progress
    Connecting,

    /// Handshake acknowledged, no query in flight
    Ready,

    /// One query written, awaiting its settlement
    Busy,

    /// Shutting down (pending work is being failed, terminate being sent)
    Closing,

    /// Channel gone
    Closed,
}

impl ConnectionState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Connecting, Ready)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Connecting, Closing)
                | (Ready, Closing)
                | (Busy, Closing)
                | (Closing, Closed)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Whether the connection can still accept work
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Connecting | Self::Ready | Self::Busy)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
