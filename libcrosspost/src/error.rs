//! Error types for Crosspost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrosspostError>;

#[derive(Error, Debug)]
pub enum CrosspostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrosspostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrosspostError::InvalidInput(_) => 3,
            CrosspostError::Queue(QueueError::Scheduling(_)) => 3,
            CrosspostError::Config(_) => 2,
            CrosspostError::Platform(PlatformError::NotRegistered(_)) => 2,
            CrosspostError::Platform(_) => 1,
            CrosspostError::Queue(_) => 1,
            CrosspostError::Io(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Failures raised by, or on behalf of, a platform adapter.
///
/// Cloneable so the same error can be stored in a `PlatformResult`, logged,
/// and forwarded to tracker subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Platform not registered: {0}")]
    NotRegistered(String),

    #[error("Platform {platform} does not support {operation}")]
    Unsupported { platform: String, operation: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Publishing failed: {0}")]
    Publish(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {0} is in progress and cannot be cancelled")]
    InProgress(String),

    #[error("Invalid schedule: {0}")]
    Scheduling(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CrosspostError::InvalidInput("No platforms".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_scheduling_error() {
        let error: CrosspostError = QueueError::Scheduling("not a time".to_string()).into();
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_configuration_errors() {
        let error: CrosspostError = ConfigError::MissingField("platforms.command".to_string()).into();
        assert_eq!(error.exit_code(), 2);

        let error: CrosspostError = PlatformError::NotRegistered("weibo".to_string()).into();
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_runtime_errors() {
        let error: CrosspostError = PlatformError::Publish("boom".to_string()).into();
        assert_eq!(error.exit_code(), 1);

        let error: CrosspostError = QueueError::InProgress("pub_1".to_string()).into();
        assert_eq!(error.exit_code(), 1);

        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "signals");
        let error: CrosspostError = io_error.into();
        assert_eq!(error.exit_code(), 1);
        assert!(error.to_string().starts_with("I/O error"));
    }

    #[test]
    fn test_error_message_formatting() {
        let error: CrosspostError = PlatformError::Validation("Title too long".to_string()).into();
        assert_eq!(
            error.to_string(),
            "Platform error: Content validation failed: Title too long"
        );

        let error: CrosspostError = QueueError::NotFound("pub_x".to_string()).into();
        assert_eq!(error.to_string(), "Queue error: Task not found: pub_x");
    }

    #[test]
    fn test_unsupported_names_platform_and_operation() {
        let error = PlatformError::Unsupported {
            platform: "wechat".to_string(),
            operation: "login".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("wechat"));
        assert!(message.contains("login"));
    }

    #[test]
    fn test_in_progress_message() {
        let error = QueueError::InProgress("pub_42".to_string());
        assert!(error.to_string().contains("in progress"));
    }

    #[test]
    fn test_config_invalid_formatting() {
        let error = ConfigError::Invalid {
            field: "queue.max_concurrent".to_string(),
            reason: "must be at least 1".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid value for queue.max_concurrent: must be at least 1"
        );
    }

    #[test]
    fn test_platform_error_clone() {
        let original = PlatformError::Network("Connection reset".to_string());
        let cloned = original.clone();
        assert_eq!(original, cloned);
    }

    #[test]
    fn test_config_read_error_formatting() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let config_error = ConfigError::ReadError(io_error);
        assert!(config_error.to_string().contains("Failed to read config file"));
    }
}
