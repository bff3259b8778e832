//! Error types for dochub
//!
//! Every error knows how to render itself as a JSON:API error object
//! (`status`, `title`, `detail`, `source.pointer`). Validation collects many
//! errors and reports them as one, with the rest under `additionalErrors`.

use serde_json::{json, Value};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for dochub operations
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Schema Errors
    // ==========================================================================
    #[error("\"{type_name}\" is not a valid type")]
    UnknownType { type_name: String },

    #[error("type \"{type_name}\" has no field named \"{field}\"")]
    UnknownField {
        type_name: String,
        field: String,
        pointer: String,
    },

    #[error("Invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("Unknown {kind} plugin \"{key}\"")]
    UnknownPlugin { kind: &'static str, key: String },

    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    #[error("{detail}")]
    InvalidValue { detail: String, pointer: String },

    #[error("{detail}")]
    ConstraintViolation {
        detail: String,
        pointer: Option<String>,
    },

    #[error("{first}")]
    Multiple {
        first: Box<Error>,
        additional: Vec<Error>,
    },

    // ==========================================================================
    // Authorization Errors
    // ==========================================================================
    #[error("You may not create this resource")]
    MayNotCreate { type_name: String },

    #[error("You may not update this resource")]
    MayNotUpdate { type_name: String, id: String },

    #[error("You may not delete this resource")]
    MayNotDelete { type_name: String, id: String },

    #[error("You may not write field \"{field}\"")]
    MayNotWriteField { field: String, pointer: String },

    #[error("Not found")]
    NotFound { type_name: String, id: String },

    // ==========================================================================
    // Query Errors
    // ==========================================================================
    #[error("{message}")]
    InvalidQuery {
        message: String,
        location: Option<String>,
    },

    #[error("Invalid page cursor: {reason}")]
    InvalidCursor { reason: String },

    // ==========================================================================
    // Storage Errors
    // ==========================================================================
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==========================================================================
    // Serialization Errors
    // ==========================================================================
    #[error("Failed to parse YAML: {message}")]
    YamlParseError { message: String },

    #[error("Failed to parse JSON: {message}")]
    JsonParseError { message: String },

    // ==========================================================================
    // Catch-all
    // ==========================================================================
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for dochub operations
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Conversions from external error types
// =============================================================================

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::YamlParseError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonParseError {
            message: err.to_string(),
        }
    }
}

impl From<hubql::ParseError> for Error {
    fn from(err: hubql::ParseError) -> Self {
        Error::InvalidQuery {
            message: err.message,
            location: err.location,
        }
    }
}

impl From<crate::validation::ValidationError> for Error {
    fn from(err: crate::validation::ValidationError) -> Self {
        use crate::validation::ValidationError;
        match err {
            ValidationError::InvalidIdentifier(value, reason) => Error::InvalidIdentifier {
                kind: "identifier",
                value,
                reason,
            },
            ValidationError::TooLong(value, _max) => Error::InvalidIdentifier {
                kind: "identifier",
                value,
                reason: "exceeds maximum length",
            },
            ValidationError::Empty => Error::InvalidIdentifier {
                kind: "identifier",
                value: String::new(),
                reason: "cannot be empty",
            },
        }
    }
}

// =============================================================================
// JSON:API rendering
// =============================================================================

impl Error {
    /// Shorthand for a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Error::InvalidSchema {
            message: message.into(),
        }
    }

    /// Shorthand for a query error without a location
    pub fn query(message: impl Into<String>) -> Self {
        Error::InvalidQuery {
            message: message.into(),
            location: None,
        }
    }

    /// Collapse a list of errors: none is success, one is itself, more
    /// become `Multiple` led by the first
    pub fn from_many(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => {
                let first = errors.remove(0);
                Err(Error::Multiple {
                    first: Box::new(first),
                    additional: errors,
                })
            }
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> u16 {
        match self {
            Error::UnknownType { .. }
            | Error::UnknownField { .. }
            | Error::InvalidSchema { .. }
            | Error::InvalidIdentifier { .. }
            | Error::InvalidValue { .. }
            | Error::ConstraintViolation { .. }
            | Error::InvalidQuery { .. }
            | Error::InvalidCursor { .. }
            | Error::JsonParseError { .. }
            | Error::YamlParseError { .. } => 400,
            Error::MayNotCreate { .. }
            | Error::MayNotUpdate { .. }
            | Error::MayNotDelete { .. }
            | Error::MayNotWriteField { .. } => 401,
            Error::NotFound { .. } => 404,
            Error::Multiple { first, .. } => first.status(),
            Error::UnknownPlugin { .. }
            | Error::Database(_)
            | Error::FileReadError { .. }
            | Error::Config { .. }
            | Error::Other(_) => 500,
        }
    }

    /// Short JSON:API title
    pub fn title(&self) -> &'static str {
        match self {
            Error::Multiple { first, .. } => first.title(),
            Error::UnknownType { .. } | Error::UnknownField { .. } => "Bad request",
            Error::InvalidSchema { .. } | Error::UnknownPlugin { .. } => "Schema error",
            Error::InvalidValue { .. }
            | Error::ConstraintViolation { .. }
            | Error::InvalidIdentifier { .. } => "Validation error",
            Error::MayNotCreate { .. }
            | Error::MayNotUpdate { .. }
            | Error::MayNotDelete { .. }
            | Error::MayNotWriteField { .. } => "Not authorized",
            Error::NotFound { .. } => "Not found",
            Error::InvalidQuery { .. } | Error::InvalidCursor { .. } => "Bad query",
            Error::JsonParseError { .. } | Error::YamlParseError { .. } => "Malformed input",
            _ => "Internal error",
        }
    }

    /// JSON pointer into the request document, when the error has one
    pub fn pointer(&self) -> Option<&str> {
        match self {
            Error::UnknownField { pointer, .. }
            | Error::InvalidValue { pointer, .. }
            | Error::MayNotWriteField { pointer, .. } => Some(pointer),
            Error::ConstraintViolation { pointer, .. } => pointer.as_deref(),
            Error::Multiple { first, .. } => first.pointer(),
            _ => None,
        }
    }

    /// Additional errors aggregated behind this one
    pub fn additional_errors(&self) -> &[Error] {
        match self {
            Error::Multiple { additional, .. } => additional,
            _ => &[],
        }
    }

    fn json_api_object(&self) -> Value {
        let mut obj = json!({
            "status": self.status().to_string(),
            "title": self.title(),
            "detail": self.to_string(),
        });
        if let Some(pointer) = self.pointer() {
            obj["source"] = json!({ "pointer": pointer });
        }
        obj
    }

    /// Render as a JSON:API error object
    pub fn to_json_api(&self) -> Value {
        let mut obj = match self {
            Error::Multiple { first, .. } => first.json_api_object(),
            _ => self.json_api_object(),
        };
        let additional = self.additional_errors();
        if !additional.is_empty() {
            obj["additionalErrors"] =
                Value::Array(additional.iter().map(Error::json_api_object).collect());
        }
        obj
    }

    /// Returns a user-friendly suggestion for fixing the error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::UnknownType { .. } => Some("Add a content-types model for this type first"),
            Error::UnknownField { .. } => {
                Some("Add the field to the content type's fields relationship")
            }
            Error::MayNotWriteField { .. } => {
                Some("Add a grant with may-write-fields that names this field")
            }
            Error::UnknownPlugin { .. } => Some("Register the plugin before loading the schema"),
            Error::InvalidCursor { .. } => Some("Use the cursor from meta.page.cursor unchanged"),
            _ => None,
        }
    }

    /// Returns true if this error is caused by the request rather than the server
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::MayNotWriteField {
            field: "title".to_string(),
            pointer: "/data/attributes/title".to_string(),
        };
        assert_eq!(err.to_string(), "You may not write field \"title\"");
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_from_many() {
        assert!(Error::from_many(vec![]).is_ok());

        let one = Error::from_many(vec![Error::schema("a")]).unwrap_err();
        assert!(matches!(one, Error::InvalidSchema { .. }));

        let many = Error::from_many(vec![
            Error::InvalidValue {
                detail: "bad".into(),
                pointer: "/data/attributes/a".into(),
            },
            Error::schema("b"),
            Error::schema("c"),
        ])
        .unwrap_err();
        assert_eq!(many.status(), 400);
        assert_eq!(many.additional_errors().len(), 2);
        assert_eq!(many.pointer(), Some("/data/attributes/a"));
    }

    #[test]
    fn test_json_api_rendering() {
        let err = Error::from_many(vec![
            Error::NotFound {
                type_name: "articles".into(),
                id: "1".into(),
            },
            Error::MayNotDelete {
                type_name: "articles".into(),
                id: "1".into(),
            },
        ])
        .unwrap_err();
        let doc = err.to_json_api();
        assert_eq!(doc["status"], "404");
        assert_eq!(doc["title"], "Not found");
        assert_eq!(doc["additionalErrors"][0]["status"], "401");
        assert!(doc.get("source").is_none());
    }

    #[test]
    fn test_error_suggestion() {
        let err = Error::UnknownType {
            type_name: "events".to_string(),
        };
        assert!(err.suggestion().is_some());
        assert!(err.is_client_error());
    }
}
