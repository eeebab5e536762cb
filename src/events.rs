//! Event types for Sonara

use uuid::Uuid;

/// Out-of-band diagnostics emitted by the engine.
///
/// Events are delivered on an unbounded channel and may be read from any
/// thread; dropping them is harmless.
#[derive(Debug, Clone, PartialEq)]
pub enum SonaraEvent {
    /// A voice reached the natural end of its generator.
    VoiceCompleted { voice: Uuid },
    /// A fire-and-forget one-shot could not be resolved or decoded.
    OneShotFailed { uri: String, error: String },
    /// A streaming voice ran dry and was restarted after its queue refilled.
    StreamUnderrun { voice: Uuid },
    /// A non-fatal backend failure during the tick.
    BackendError { message: String },
}

impl SonaraEvent {
    pub fn voice(&self) -> Option<Uuid> {
        match self {
            Self::VoiceCompleted { voice } | Self::StreamUnderrun { voice } => Some(*voice),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::OneShotFailed { .. } | Self::BackendError { .. }
        )
    }
}
