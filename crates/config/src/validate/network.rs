//! Listener address validation
//!
//! Checks that every listener can be handed between generations by name
//! and that its address resolves.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::collections::HashSet;
use std::net::ToSocketAddrs;

/// Characters that would corrupt the `name=fd,...` handoff encoding
const RESERVED_NAME_CHARS: [char; 2] = [',', '='];

/// Validate listener names and addresses
pub fn validate_listeners(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.listeners.is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Listener,
            "At least one listener is required",
        ));
        return result;
    }

    let mut seen = HashSet::new();
    for listener in &config.listeners {
        if listener.name.is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Listener,
                format!("Listener on '{}' has an empty name", listener.address),
            ));
        } else if listener.name.contains(RESERVED_NAME_CHARS) {
            result.add_error(ValidationError::new(
                ErrorCategory::Listener,
                format!(
                    "Listener name '{}' must not contain ',' or '='",
                    listener.name
                ),
            ));
        }

        if !seen.insert(listener.name.as_str()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Listener,
                format!("Duplicate listener name '{}'", listener.name),
            ));
        }

        match listener.address.to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) if addr.port() == 0 => {
                    result.add_warning(ValidationWarning::new(format!(
                        "Listener '{}' uses port 0; the kernel picks the port at first bind",
                        listener.name
                    )));
                }
                Some(_) => {}
                None => {
                    result.add_error(ValidationError::new(
                        ErrorCategory::Listener,
                        format!(
                            "Listener '{}' address '{}' resolved to nothing",
                            listener.name, listener.address
                        ),
                    ));
                }
            },
            Err(e) => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Listener,
                    format!(
                        "Listener '{}' address '{}' is invalid: {}",
                        listener.name, listener.address, e
                    ),
                ));
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ListenerConfig;

    fn config_with(listeners: Vec<ListenerConfig>) -> Config {
        Config {
            listeners,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_listeners() {
        let result = validate_listeners(&config_with(vec![]));
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_duplicate_and_reserved_names() {
        let result = validate_listeners(&config_with(vec![
            ListenerConfig::new("http", "127.0.0.1:8080"),
            ListenerConfig::new("http", "127.0.0.1:8081"),
            ListenerConfig::new("a=b", "127.0.0.1:8082"),
        ]));

        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().any(|e| e.message.contains("Duplicate")));
        assert!(result.errors.iter().any(|e| e.message.contains("a=b")));
    }

    #[test]
    fn test_unparseable_address() {
        let result = validate_listeners(&config_with(vec![ListenerConfig::new(
            "http",
            "not-an-address",
        )]));
        assert!(!result.is_valid());
    }

    #[test]
    fn test_port_zero_warns() {
        let result = validate_listeners(&config_with(vec![ListenerConfig::new(
            "http",
            "127.0.0.1:0",
        )]));
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }
}
