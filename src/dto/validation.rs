//! Validation helpers for inbound payloads and user input.

use indexmap::IndexMap;
use validator::{ValidationError, ValidationErrors};

/// Record a `required` error for `field` when `value` is absent.
pub fn require_present<T>(errors: &mut ValidationErrors, field: &'static str, value: &Option<T>) {
    if value.is_none() {
        let mut err = ValidationError::new("required");
        err.message = Some(format!("`{field}` is missing from the payload").into());
        errors.add(field, err);
    }
}

/// Validates that `letter` names one of the presented options.
///
/// # Examples
///
/// ```ignore
/// validate_option_letter("B", &options) // Ok when options has a "B" key
/// validate_option_letter("Z", &options) // Err
/// ```
pub fn validate_option_letter(
    letter: &str,
    options: &IndexMap<String, String>,
) -> Result<(), ValidationError> {
    if letter.trim().is_empty() {
        let mut err = ValidationError::new("answer_empty");
        err.message = Some("Answer letter must not be empty".into());
        return Err(err);
    }

    if !options.contains_key(letter) {
        let mut err = ValidationError::new("answer_unknown");
        err.message = Some(format!("`{letter}` is not one of the presented options").into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> IndexMap<String, String> {
        IndexMap::from([
            ("A".to_string(), "one".to_string()),
            ("B".to_string(), "two".to_string()),
        ])
    }

    #[test]
    fn test_validate_option_letter_valid() {
        assert!(validate_option_letter("A", &options()).is_ok());
        assert!(validate_option_letter("B", &options()).is_ok());
    }

    #[test]
    fn test_validate_option_letter_invalid() {
        assert!(validate_option_letter("", &options()).is_err());
        assert!(validate_option_letter("C", &options()).is_err());
        assert!(validate_option_letter("a", &options()).is_err());
    }

    #[test]
    fn test_require_present() {
        let mut errors = ValidationErrors::new();
        require_present(&mut errors, "answers", &Some(1));
        assert!(errors.is_empty());
        require_present::<u8>(&mut errors, "answers", &None);
        assert!(errors.field_errors().contains_key("answers"));
    }
}
