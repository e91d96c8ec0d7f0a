use std::path::PathBuf;
use thiserror::Error;

/// A batch that cannot be used for a training or validation step.
#[derive(Clone, Debug, Error)]
pub enum BatchError {
    #[error("batch size mismatch: source {source_len}, target {target_len}, labels {label_len}")]
    SizeMismatch {
        source_len: usize,
        target_len: usize,
        label_len: usize,
    },

    #[error("source image shape {source_shape:?} differs from target image shape {target_shape:?}")]
    ShapeMismatch {
        source_shape: [usize; 4],
        target_shape: [usize; 4],
    },

    #[error("empty batch")]
    Empty,

    #[error("label {label} is outside the {num_domains} domains")]
    LabelOutOfRange { label: i64, num_domains: usize },

    #[error("failed to decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },
}

/// Failures while writing or restoring training state.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to write checkpoint {}: {reason}", path.display())]
    Save { path: PathBuf, reason: String },

    #[error("failed to read checkpoint {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("{module}: checkpoint has {found} parameters, model defines {expected}")]
    ParameterCount {
        module: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{module}: parameter #{index} has shape {found:?}, model expects {expected:?}")]
    ShapeMismatch {
        module: &'static str,
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("{module}: optimizer state references unknown parameter {key}")]
    UnknownOptimizerKey { module: &'static str, key: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Invalid configuration values detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown adversarial criterion `{0}` (expected one of: {1})")]
    UnknownCriterion(String, String),

    #[error("unknown augmentation op `{0}` in policy (expected color, translation or cutout)")]
    UnknownAugmentation(String),

    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_errors_name_the_offending_parameter() {
        let err = CheckpointError::ShapeMismatch {
            module: "generator",
            index: 3,
            expected: vec![8, 4, 3, 3],
            found: vec![16, 4, 3, 3],
        };
        let message = err.to_string();
        assert!(message.contains("generator"));
        assert!(message.contains("#3"));
        assert!(message.contains("[16, 4, 3, 3]"));
    }

    #[test]
    fn batch_errors_report_sizes() {
        let err = BatchError::SizeMismatch {
            source_len: 2,
            target_len: 2,
            label_len: 1,
        };
        assert!(err.to_string().contains("labels 1"));
    }
}
