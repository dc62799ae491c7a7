use std::{net::SocketAddr, time::Duration};

use crate::config::models::ControllerConfig;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Controller configuration validator
pub struct ControllerConfigValidator;

impl ControllerConfigValidator {
    /// Validate the entire configuration, reporting every problem at once.
    pub fn validate(config: &ControllerConfig) -> ValidationResult<()> {
        let errors = Self::collect_errors(config);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    pub fn collect_errors(config: &ControllerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, address) in [
            ("http_addr", &config.http_addr),
            ("https_addr", &config.https_addr),
        ] {
            if let Err(e) = Self::validate_listen_address(field, address) {
                errors.push(e);
            }
        }
        if config.http_addr == config.https_addr {
            errors.push(ValidationError::InvalidField {
                field: "https_addr".to_string(),
                message: "Must differ from http_addr".to_string(),
            });
        }

        for (field, duration) in [
            ("reconcile.interval", config.reconcile.interval),
            ("reconcile.call_timeout", config.reconcile.call_timeout),
            ("proxy.timeout", config.proxy.timeout),
        ] {
            if let Err(e) = Self::validate_non_zero(field, duration) {
                errors.push(e);
            }
        }

        for (field, value) in [
            ("cluster.ingress_class", &config.cluster.ingress_class),
            ("cluster.namespace", &config.cluster.namespace),
            ("cluster.field_manager", &config.cluster.field_manager),
        ] {
            if value.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        if let Some(service_name) = &config.cluster.service_name {
            if service_name.trim().is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: "cluster.service_name".to_string(),
                    message: "Must not be empty when set".to_string(),
                });
            }
        }

        if let Err(e) = Self::validate_cookie_name(&config.session.cookie_name) {
            errors.push(e);
        }

        for host in &config.dummy_hosts {
            if host.trim().is_empty() || host.contains(['/', ' ', ':']) {
                errors.push(ValidationError::InvalidField {
                    field: "dummy_hosts".to_string(),
                    message: format!("'{host}' is not a bare hostname"),
                });
            }
        }

        errors
    }

    /// Validate listen address format
    fn validate_listen_address(field: &str, address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: format!("{field} must be in format 'IP:PORT' (e.g. '0.0.0.0:443')"),
            });
        }
        Ok(())
    }

    fn validate_non_zero(field: &str, duration: Duration) -> ValidationResult<()> {
        if duration.is_zero() {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Cookie names are RFC 6265 tokens.
    fn validate_cookie_name(name: &str) -> ValidationResult<()> {
        const SEPARATORS: &str = "()<>@,;:\\\"/[]?={} \t";

        if name.is_empty() {
            return Err(ValidationError::MissingField {
                field: "session.cookie_name".to_string(),
            });
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !c.is_ascii() || c.is_ascii_control() || SEPARATORS.contains(*c))
        {
            return Err(ValidationError::InvalidField {
                field: "session.cookie_name".to_string(),
                message: format!("Character {bad:?} is not allowed in a cookie name"),
            });
        }
        Ok(())
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
