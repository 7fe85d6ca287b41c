//! Error types shared across FleetSync crates

/// Application-level error types
#[derive(thiserror::Error, Debug)]
pub enum FleetSyncError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("logging error: {0}")]
    LoggingError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for FleetSyncError {
    fn from(value: config::ConfigError) -> Self {
        FleetSyncError::ConfigError(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = FleetSyncError::ConfigError("fleet.domain must not be empty".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: fleet.domain must not be empty"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: FleetSyncError = io.into();
        assert!(matches!(err, FleetSyncError::Io(_)));
    }
}
