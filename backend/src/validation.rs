//! Request validation for the workflow API
//!
//! Collects field-level problems and reports them together as one
//! `INVALID_ARGUMENT` error.

use serde_json::Value;

use crate::error::{ApiResult, ValidationBuilder};

/// Longest name accepted for rules, actions and templates
pub const MAX_NAME_LENGTH: usize = 255;

/// Validator builder for request bodies
pub struct Validator {
    builder: ValidationBuilder,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            builder: ValidationBuilder::new(),
        }
    }

    /// Add error for a field
    pub fn error(mut self, field: &str, message: &str) -> Self {
        self.builder.push(field, message);
        self
    }

    /// Add error if condition is true
    pub fn error_if(self, condition: bool, field: &str, message: &str) -> Self {
        if condition {
            self.error(field, message)
        } else {
            self
        }
    }

    /// A name that is present, not blank, and not too long.
    pub fn name(self, value: &str, field: &str) -> Self {
        if value.trim().is_empty() {
            self.error(field, &format!("{} cannot be empty", field))
        } else if value.len() > MAX_NAME_LENGTH {
            self.error(
                field,
                &format!("{} must be {} characters or less", field, MAX_NAME_LENGTH),
            )
        } else {
            self
        }
    }

    /// Optional name; only checked when given.
    pub fn optional_name(self, value: &Option<String>, field: &str) -> Self {
        match value {
            Some(v) => self.name(v, field),
            None => self,
        }
    }

    /// JSON blobs that must be objects when present.
    pub fn json_object(self, value: Option<&Value>, field: &str) -> Self {
        match value {
            None | Some(Value::Null) | Some(Value::Object(_)) => self,
            Some(_) => self.error(field, &format!("{} must be a JSON object", field)),
        }
    }

    /// Run a check that yields an error message.
    pub fn check<E: std::fmt::Display>(self, result: Result<(), E>, field: &str) -> Self {
        match result {
            Ok(()) => self,
            Err(e) => self.error(field, &e.to_string()),
        }
    }

    /// Check if validation passed
    pub fn is_valid(&self) -> bool {
        !self.builder.has_errors()
    }

    /// Finish validation, returning error if any
    pub fn finish(self) -> ApiResult<()> {
        self.builder.finish()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
