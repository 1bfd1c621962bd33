//! US phone canonicalization.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{SignalKind, ValidationError};

static EMBEDDED_NUMBER: OnceLock<Regex> = OnceLock::new();

fn embedded_number() -> &'static Regex {
    // A NANP number cannot start with 0 or 1.
    EMBEDDED_NUMBER
        .get_or_init(|| Regex::new(r"[2-9][0-9]{9}").expect("embedded phone pattern is valid"))
}

/// Canonicalizes a phone to its bare 10 digits, reporting why it was rejected.
///
/// # Errors
/// Returns `ValidationError::MalformedSignal` when no 10-digit number can be
/// recovered.
pub fn canonical_phone(raw: &str) -> Result<String, ValidationError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(ValidationError::malformed(SignalKind::Phone, "no digits"));
    }

    match digits.len() {
        10 => return Ok(digits),
        11 if digits.starts_with('1') => return Ok(digits[1..].to_string()),
        _ => {}
    }

    // Concatenated or padded numbers: take the first plausible embedded run.
    if digits.len() > 10 {
        if let Some(m) = embedded_number().find(&digits) {
            return Ok(m.as_str().to_string());
        }
    }

    Err(ValidationError::malformed(
        SignalKind::Phone,
        format!("cannot recover a 10-digit number from {} digits", digits.len()),
    ))
}

/// Canonicalizes a phone, returning `None` when no valid number is present.
///
/// # Examples
///
/// ```
/// use contact_resolver::normalize::normalize_phone;
///
/// assert_eq!(normalize_phone("+1 (707) 555-0134"), Some("7075550134".to_string()));
/// assert_eq!(normalize_phone("555-0134"), None);
/// ```
#[must_use]
pub fn normalize_phone(raw: &str) -> Option<String> {
    canonical_phone(raw).ok()
}
