//! Slug format rules
//!
//! A slug is 1-100 lowercase ASCII letters or digits, optionally separated by
//! single hyphens: `intro-to-rust`, `web3`, `a-1`.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::StorageError;

pub const MAX_SLUG_LEN: usize = 100;

/// Check slug format
pub fn validate_slug(slug: &str) -> Result<(), StorageError> {
    if slug.is_empty() {
        return Err(StorageError::InvalidInput("slug is required".into()));
    }

    if slug.len() > MAX_SLUG_LEN {
        return Err(StorageError::InvalidInput(format!(
            "slug must be <= {} characters",
            MAX_SLUG_LEN
        )));
    }

    if let Some(bad) = slug
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(StorageError::InvalidInput(format!(
            "slug '{}' contains '{}'; use lowercase letters, digits and hyphens",
            slug, bad
        )));
    }

    if slug.starts_with('-') || slug.ends_with('-') || slug.contains("--") {
        return Err(StorageError::InvalidInput(format!(
            "slug '{}' must not start or end with a hyphen or contain '--'",
            slug
        )));
    }

    Ok(())
}

/// Derive a slug from a display name.
///
/// Accented Latin letters lose their marks (`ç` becomes `c`); other
/// non-ASCII characters act as separators.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    for c in name.nfd().filter(|c| !is_combining_mark(*c)) {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }

    slug
}
