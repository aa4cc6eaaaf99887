//! Interest naming rules and the confirmed-set hash.

use crate::error::{ProtocolError, ProtocolResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt::Write;

/// A set of interest names, ordered so hashing and wire bodies are stable.
pub type InterestSet = BTreeSet<String>;

/// Maximum length of an interest name, in bytes.
pub const MAX_INTEREST_LENGTH: usize = 164;

fn is_interest_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '=' | '@' | ',' | '.' | ';')
}

/// Validates a single interest name.
///
/// Names are 1 to 164 characters drawn from `A-Z a-z 0-9 _ - = @ , . ;`.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidInterest`] naming the broken rule.
pub fn validate_interest(name: &str) -> ProtocolResult<()> {
    if name.is_empty() {
        return Err(ProtocolError::invalid_interest(name, "name is empty"));
    }
    if name.len() > MAX_INTEREST_LENGTH {
        return Err(ProtocolError::invalid_interest(
            name,
            format!("longer than {MAX_INTEREST_LENGTH} characters"),
        ));
    }
    if let Some(bad) = name.chars().find(|c| !is_interest_char(*c)) {
        return Err(ProtocolError::invalid_interest(
            name,
            format!("character {bad:?} is not allowed"),
        ));
    }
    Ok(())
}

/// Validates every name in a set, stopping at the first bad one.
///
/// # Errors
///
/// Returns the error for the first invalid name in iteration order.
pub fn validate_interests<'a, I>(names: I) -> ProtocolResult<()>
where
    I: IntoIterator<Item = &'a String>,
{
    names.into_iter().try_for_each(|name| validate_interest(name))
}

/// Content hash of an interest set: SHA-256 over the sorted names joined by
/// newlines, as lowercase hex.
#[must_use]
pub fn interests_hash(interests: &InterestSet) -> String {
    let mut hasher = Sha256::new();
    for (i, name) in interests.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(name.as_bytes());
    }
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing to a String cannot fail.
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
