//! Person name canonicalization.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{SignalKind, ValidationError};

const HONORIFICS: [&str; 9] = ["mr", "mrs", "ms", "miss", "mx", "dr", "prof", "rev", "sir"];

const SUFFIXES: [&str; 10] = ["jr", "sr", "ii", "iii", "iv", "md", "phd", "esq", "dds", "dvm"];

/// A name in both display and comparison form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedName {
    /// Original spelling with whitespace collapsed.
    pub display: String,
    /// Case-folded comparison key without honorifics or suffixes.
    pub key: String,
}

impl NormalizedName {
    /// Tokens of the comparison key.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.key.split(' ').filter(|t| !t.is_empty())
    }

    /// Comparison key with tokens sorted, for order-insensitive matching.
    #[must_use]
    pub fn sorted_key(&self) -> String {
        let mut tokens: Vec<&str> = self.tokens().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Builds the loose comparison key for a name.
///
/// Punctuation becomes whitespace, so "O'Brien" and "O Brien" compare equal.
#[must_use]
pub fn name_key(raw: &str) -> String {
    let folded: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded
        .split_whitespace()
        .filter(|t| !HONORIFICS.contains(t) && !SUFFIXES.contains(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Character trigrams of a comparison key, padded per word.
///
/// Used as the blocking key for fuzzy name lookups: two keys that share no
/// trigram cannot be similar enough to matter.
#[must_use]
pub fn trigrams(key: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for word in key.split_whitespace() {
        let padded: Vec<char> = format!("  {word} ").chars().collect();
        for window in padded.windows(3) {
            out.insert(window.iter().collect());
        }
    }
    out
}

/// Canonicalizes a name, rejecting keys shorter than `min_length` characters.
///
/// # Errors
/// Returns `ValidationError::NameTooShort` or `MalformedSignal`.
pub fn canonical_name(raw: &str, min_length: usize) -> Result<NormalizedName, ValidationError> {
    let display = collapse_whitespace(raw);
    if display.is_empty() {
        return Err(ValidationError::malformed(SignalKind::Name, "empty"));
    }
    let key = name_key(&display);
    if key.chars().count() < min_length {
        return Err(ValidationError::NameTooShort {
            value: display,
            min_length,
        });
    }
    Ok(NormalizedName { display, key })
}

/// Canonicalizes a name with the default minimum length of 2.
///
/// # Examples
///
/// ```
/// use contact_resolver::normalize::normalize_name;
///
/// let name = normalize_name("  Dr.  Jane   Doe, Jr. ").unwrap();
/// assert_eq!(name.key, "jane doe");
/// assert_eq!(name.display, "Dr. Jane Doe, Jr.");
/// ```
#[must_use]
pub fn normalize_name(raw: &str) -> Option<NormalizedName> {
    canonical_name(raw, 2).ok()
}
