//! Shared utilities: error types and logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{BrokerError, PublishError, ValidationError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(logging::parse_level("nonsense"), tracing::Level::INFO);
    }

    #[test]
    fn error_messages_are_readable() {
        let err = ValidationError::MissingField("message");
        assert_eq!(err.to_string(), "missing required field 'message'");

        let err = PublishError::PartialFailure {
            failed: vec![("created".into(), "disk full".into())],
            delivered: 1,
        };
        assert_eq!(err.to_string(), "1 subscription(s) failed to enqueue, 1 delivered");

        let err = BrokerError::UnknownQueue("nope".into());
        assert_eq!(err.to_string(), "unknown queue 'nope'");
    }
}
