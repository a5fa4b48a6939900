//! Configuration errors shared by the pool and shard configs.

use thiserror::Error;

/// A configuration value that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("block_stride", "must be a multiple of 64");
        assert_eq!(
            err.to_string(),
            "invalid config value for block_stride: must be a multiple of 64"
        );

        let err = ConfigError::UnknownVariant {
            kind: "driver",
            value: "kqueue".into(),
        };
        assert_eq!(err.to_string(), "unknown driver 'kqueue'");
    }
}
