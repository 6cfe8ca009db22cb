//! Error types for training

use thiserror::Error;

/// Training errors
#[derive(Debug, Error)]
pub enum TrainError {
    /// Malformed or missing configuration
    #[error("Configuration error: {0}")]
    ConfigValidation(String),

    /// Unknown registry key
    #[error("Unknown {kind} '{key}' (available: {available})")]
    Registry {
        /// Registry name
        kind: &'static str,
        /// Requested key
        key: String,
        /// Registered keys, comma separated
        available: String,
    },

    /// Loss became non-finite
    #[error("Training diverged at step {step}: loss = {loss}")]
    TrainingDivergence {
        /// Step that produced the loss
        step: u64,
        /// Offending loss value
        loss: f64,
    },

    /// A data-parallel worker failed or timed out
    #[error("Worker {rank} failed: {reason}")]
    WorkerFailure {
        /// Rank of the failing worker
        rank: usize,
        /// What went wrong
        reason: String,
    },

    /// Checkpoint could not be used
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Data loading failed after retries
    #[error("Data error: {0}")]
    Data(String),

    /// Model or codec error
    #[error(transparent)]
    Codec(#[from] mcquic_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl TrainError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        TrainError::ConfigValidation(message.into())
    }

    /// True for configuration problems, including those raised by the model.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            TrainError::ConfigValidation(_)
                | TrainError::Registry { .. }
                | TrainError::Codec(mcquic_core::Error::ConfigValidation(_))
        )
    }
}

/// Result type for training operations
pub type Result<T> = std::result::Result<T, TrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = TrainError::Registry {
            kind: "optimizer",
            key: "Lion".into(),
            available: "Adam, SGD".into(),
        };
        assert_eq!(err.to_string(), "Unknown optimizer 'Lion' (available: Adam, SGD)");

        let err = TrainError::WorkerFailure {
            rank: 2,
            reason: "barrier timed out".into(),
        };
        assert!(err.to_string().contains("Worker 2"));
    }

    #[test]
    fn test_is_config() {
        assert!(TrainError::config("bad").is_config());
        assert!(TrainError::from(mcquic_core::Error::config("bad")).is_config());
        assert!(!TrainError::Data("gone".into()).is_config());
    }
}
