//! Event types for PetalMix

use crate::source::SourceId;

#[derive(Debug, Clone, PartialEq)]
pub enum PetalMixEvent {
    EngineStarted,
    EngineStopped,
    EngineError {
        error: String,
    },
    /// A fatal error was observed and the recovery protocol is running.
    RecoveryStarted {
        attempt: u32,
    },
    Recovered {
        attempts: u32,
    },
    RecoveryFailed {
        error: String,
    },
    InputUnavailable {
        reason: String,
    },
    InputAccessDenied,
    /// Synchronous exchanges with the render thread timed out since the last poll.
    MessageTimeouts {
        count: u64,
        total: u64,
    },
    SourcePropertiesChanged {
        source_id: SourceId,
    },
}

impl PetalMixEvent {
    pub fn source_id(&self) -> Option<SourceId> {
        match self {
            Self::SourcePropertiesChanged { source_id } => Some(*source_id),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::EngineError { .. }
                | Self::RecoveryFailed { .. }
                | Self::InputUnavailable { .. }
                | Self::InputAccessDenied
                | Self::MessageTimeouts { .. }
        )
    }

    pub fn is_recovery_event(&self) -> bool {
        matches!(
            self,
            Self::RecoveryStarted { .. } | Self::Recovered { .. } | Self::RecoveryFailed { .. }
        )
    }
}
