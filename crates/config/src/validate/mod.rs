//! Configuration validation.
//!
//! Validation never stops at the first problem: every check appends to a
//! [`ValidationResult`] so `baton -t` can report everything at once.

mod lint;
mod network;

use std::fmt;

use crate::Config;

pub use lint::lint_config;
pub use network::validate_listeners;

/// Area of the configuration an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Listener,
    Lifecycle,
    Stream,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Listener => "listener",
            ErrorCategory::Lifecycle => "lifecycle",
            ErrorCategory::Stream => "stream",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run every validation and lint pass
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = validate_listeners(config);
    result.merge(validate_timings(config));
    result.merge(lint_config(config));
    result
}

fn validate_timings(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let lifecycle = &config.lifecycle;

    let checks = [
        ("drain-grace-secs", lifecycle.drain_grace_secs),
        ("hard-exit-secs", lifecycle.hard_exit_secs),
        ("readiness-timeout-secs", lifecycle.readiness_timeout_secs),
    ];
    for (name, value) in checks {
        if value == 0 {
            result.add_error(ValidationError::new(
                ErrorCategory::Lifecycle,
                format!("'{}' must be greater than zero", name),
            ));
        }
    }

    if config.stream.interval_ms == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Stream,
            "'interval-ms' must be greater than zero",
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&Config::default());
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn test_zero_timings_rejected() {
        let mut config = Config::default();
        config.lifecycle.drain_grace_secs = 0;
        config.lifecycle.hard_exit_secs = 0;
        config.stream.interval_ms = 0;

        let result = validate_config(&config);
        assert_eq!(result.errors.len(), 3);
        assert!(result
            .errors
            .iter()
            .any(|e| e.category == ErrorCategory::Stream));
    }

    #[test]
    fn test_merge_keeps_everything() {
        let mut a = ValidationResult::new();
        a.add_warning(ValidationWarning::new("w"));
        let mut b = ValidationResult::new();
        b.add_error(ValidationError::new(ErrorCategory::Listener, "e"));

        a.merge(b);
        assert!(!a.is_valid());
        assert_eq!(a.warnings.len(), 1);
        assert_eq!(a.errors[0].to_string(), "[listener] e");
    }
}
