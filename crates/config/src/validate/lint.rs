//! Configuration linting
//!
//! Flags settings that are legal but likely to surprise during an upgrade.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

/// Lint lifecycle settings
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let lifecycle = &config.lifecycle;

    if lifecycle.readiness_timeout_secs > 0 && lifecycle.readiness_timeout_secs < 5 {
        result.add_warning(ValidationWarning::new(format!(
            "readiness-timeout-secs is {}s; slow successors will be killed before they bind",
            lifecycle.readiness_timeout_secs
        )));
    }

    if lifecycle.drain_grace_secs > 0 && lifecycle.drain_grace() < config.stream.interval()
    {
        result.add_warning(ValidationWarning::new(
            "drain-grace-secs is shorter than one stream interval; streams are cut before their next event",
        ));
    }

    if let Some(pid_file) = &lifecycle.pid_file {
        if let Some(parent) = pid_file.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                result.add_warning(ValidationWarning::new(format!(
                    "pid-file directory '{}' does not exist",
                    parent.display()
                )));
            }
        }
    }

    if let Some(program) = &lifecycle.successor_program {
        if program.is_absolute() && !program.exists() {
            result.add_warning(ValidationWarning::new(format!(
                "successor-program '{}' does not exist; upgrades will fail until it does",
                program.display()
            )));
        }
    }

    if let Some(index) = &config.stream.index_file {
        if !index.exists() {
            result.add_warning(ValidationWarning::new(format!(
                "index-file '{}' does not exist; the embedded page will be served",
                index.display()
            )));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_quiet() {
        let result = lint_config(&Config::default());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_short_readiness_timeout() {
        let mut config = Config::default();
        config.lifecycle.readiness_timeout_secs = 2;
        let result = lint_config(&config);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_missing_pid_dir() {
        let mut config = Config::default();
        config.lifecycle.pid_file = Some("/nonexistent-baton-dir/baton.pid".into());
        let result = lint_config(&config);
        assert!(result.warnings[0].message.contains("does not exist"));
    }
}
