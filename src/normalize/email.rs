//! Email canonicalization.

use crate::error::{SignalKind, ValidationError};

/// Canonicalizes an email for comparison, reporting why it was rejected.
///
/// Lowercases, trims, and drops a `+tag` suffix from the local part.
///
/// # Errors
/// Returns `ValidationError::MalformedSignal` for anything that is not a
/// single `local@domain.tld` address.
pub fn canonical_email(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err(ValidationError::malformed(SignalKind::Email, "empty"));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(ValidationError::malformed(SignalKind::Email, "contains whitespace"));
    }

    let mut parts = trimmed.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ValidationError::malformed(
            SignalKind::Email,
            "expected exactly one '@'",
        ));
    };

    let local = local.split('+').next().unwrap_or("");
    if local.is_empty() {
        return Err(ValidationError::malformed(SignalKind::Email, "empty local part"));
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(ValidationError::malformed(
            SignalKind::Email,
            format!("invalid domain '{domain}'"),
        ));
    }

    Ok(format!("{local}@{domain}"))
}

/// Canonicalizes an email, returning `None` on malformed input.
///
/// # Examples
///
/// ```
/// use contact_resolver::normalize::normalize_email;
///
/// assert_eq!(normalize_email(" Jane+Cats@Example.COM "), Some("jane@example.com".to_string()));
/// assert_eq!(normalize_email("not-an-email"), None);
/// ```
#[must_use]
pub fn normalize_email(raw: &str) -> Option<String> {
    canonical_email(raw).ok()
}
