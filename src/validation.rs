//! Identifier validation for dochub
//!
//! Field and type names end up inside JSON:API member names, JSON pointers
//! and (as bound parameters) SQL path expressions, so they are held to a
//! strict alphabet.

use thiserror::Error;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid identifier '{0}': {1}")]
    InvalidIdentifier(String, &'static str),

    #[error("Identifier '{0}' is too long (max {1} characters)")]
    TooLong(String, usize),

    #[error("Identifier cannot be empty")]
    Empty,
}

/// Maximum length for identifiers
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Separator between the scopes of a namespaced model id
pub const SCOPE_SEPARATOR: &str = "::";

/// Validate a field name
///
/// Rules:
/// - Must be 1-255 characters
/// - Only alphanumeric, underscore, and hyphen allowed
/// - Must start and end with an alphanumeric character
///
/// Namespaced ids (`source::package::name`) are checked scope by scope.
pub fn validate_field_name(name: &str) -> Result<(), ValidationError> {
    validate_scoped(name)
}

/// Validate a content type name
///
/// Same rules as field names
pub fn validate_type_name(name: &str) -> Result<(), ValidationError> {
    validate_scoped(name)
}

/// Every `::`-separated scope must be an identifier on its own
fn validate_scoped(name: &str) -> Result<(), ValidationError> {
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong(name.to_string(), MAX_IDENTIFIER_LENGTH));
    }
    for scope in name.split(SCOPE_SEPARATOR) {
        validate_identifier(scope).map_err(|err| match err {
            ValidationError::Empty if name.is_empty() => ValidationError::Empty,
            ValidationError::Empty => {
                ValidationError::InvalidIdentifier(name.to_string(), "has an empty scope")
            }
            ValidationError::InvalidIdentifier(_, reason) => {
                ValidationError::InvalidIdentifier(name.to_string(), reason)
            }
            other => other,
        })?;
    }
    Ok(())
}

/// Validate a data source id; these may not be namespaced
pub fn validate_source_id(id: &str) -> Result<(), ValidationError> {
    validate_identifier(id)
}

/// True when `name` is a plain identifier
pub fn is_identifier(name: &str) -> bool {
    validate_identifier(name).is_ok()
}

/// Core identifier validation
fn validate_identifier(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong(name.to_string(), MAX_IDENTIFIER_LENGTH));
    }

    let last = name.chars().count() - 1;
    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
            return Err(ValidationError::InvalidIdentifier(
                name.to_string(),
                "contains invalid characters (only alphanumeric, underscore, and hyphen allowed)",
            ));
        }
        if (i == 0 || i == last) && !c.is_ascii_alphanumeric() {
            return Err(ValidationError::InvalidIdentifier(
                name.to_string(),
                "must start and end with a letter or digit",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_field_name("title").is_ok());
        assert!(validate_field_name("published-date").is_ok());
        assert!(validate_field_name("x").is_ok());
        assert!(validate_field_name("a_b-9").is_ok());
        assert!(validate_type_name("articles").is_ok());
        assert!(validate_field_name("local-hub::article-card::title").is_ok());
    }

    #[test]
    fn test_invalid_edges() {
        assert!(validate_field_name("-title").is_err());
        assert!(validate_field_name("title-").is_err());
        assert!(validate_field_name("_x").is_err());
        assert!(validate_field_name("x_").is_err());
    }

    #[test]
    fn test_invalid_characters() {
        assert!(validate_field_name("foo bar").is_err());
        assert!(validate_field_name("foo.bar").is_err());
        assert!(validate_field_name("foo'bar").is_err());
        assert!(validate_source_id("a::b").is_err());
    }

    #[test]
    fn test_every_scope_is_checked() {
        assert!(validate_field_name("foo bar::title").is_err());
        assert!(validate_field_name("a.b::title").is_err());
        assert!(validate_field_name("x'y::title").is_err());
        assert!(validate_type_name("bad name.x::articles").is_err());
        assert!(matches!(
            validate_field_name("::title"),
            Err(ValidationError::InvalidIdentifier(_, "has an empty scope"))
        ));
        assert!(validate_field_name("local::").is_err());
        assert!(validate_field_name("local:::title").is_err());
    }

    #[test]
    fn test_empty_and_too_long() {
        assert!(matches!(validate_field_name(""), Err(ValidationError::Empty)));
        let long_name = "a".repeat(256);
        assert!(matches!(
            validate_field_name(&long_name),
            Err(ValidationError::TooLong(_, _))
        ));
    }
}
