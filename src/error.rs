//! Unified error handling for the ruck-core library.
//!
//! Recoverable conditions (invalid fixes, low-confidence detections) are
//! reported through return values and counters, not errors; `TrackError`
//! covers the cases where a caller made a call the current state or
//! configuration cannot honor.

use std::fmt;

use crate::session::SessionState;

/// Unified error type for ruck-core operations.
#[derive(Debug, Clone)]
pub enum TrackError {
    /// A session lifecycle call was made in a state that does not allow it.
    /// State is left unchanged; the caller may retry from a valid state.
    InvalidTransition {
        from: SessionState,
        attempted: &'static str,
    },
    /// A configuration or calibration input was out of range
    ConfigError { message: String },
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackError::InvalidTransition { from, attempted } => {
                write!(f, "Cannot {} while session is {:?}", attempted, from)
            }
            TrackError::ConfigError { message } => {
                write!(f, "Configuration error: {}", message)
            }
        }
    }
}

impl std::error::Error for TrackError {}

/// Result type alias for ruck-core operations.
pub type Result<T> = std::result::Result<T, TrackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = TrackError::InvalidTransition {
            from: SessionState::Stopped,
            attempted: "pause",
        };
        assert!(err.to_string().contains("pause"));
        assert!(err.to_string().contains("Stopped"));
    }

    #[test]
    fn test_config_error_display() {
        let err = TrackError::ConfigError {
            message: "calibration elevation must be finite".to_string(),
        };
        assert!(err.to_string().contains("finite"));
    }
}
