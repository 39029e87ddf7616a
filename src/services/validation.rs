//! Input checks shared by the catalog services

use rusqlite::Connection;

use crate::db::{is_constraint_violation, non_empty, slugs};
use crate::error::{ConflictKind, EntityKind, StorageError};
use crate::slug::{slugify, validate_slug};

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_META_TITLE_LEN: usize = 200;
pub const MAX_META_DESCRIPTION_LEN: usize = 500;

/// Trim a required text field and enforce its length
pub fn required_text(field: &str, value: &str, max_len: usize) -> Result<String, StorageError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StorageError::InvalidInput(format!("{} is required", field)));
    }
    if trimmed.chars().count() > max_len {
        return Err(StorageError::InvalidInput(format!(
            "{} must be <= {} characters",
            field, max_len
        )));
    }
    Ok(trimmed.to_string())
}

/// Normalize an optional text field, rejecting overlong values
pub fn optional_text(field: &str, value: &Option<String>, max_len: usize) -> Result<Option<String>, StorageError> {
    let value = non_empty(value);
    if let Some(ref text) = value {
        if text.chars().count() > max_len {
            return Err(StorageError::InvalidInput(format!(
                "{} must be <= {} characters",
                field, max_len
            )));
        }
    }
    Ok(value)
}

/// Route words that cannot double as caller-supplied ids
pub const CATEGORY_RESERVED_IDS: &[&str] = &["tree", "slug-check", "by-slug"];
pub const SUBCATEGORY_RESERVED_IDS: &[&str] = &["slug-check"];

/// Reject an id that would be shadowed by a fixed route
pub fn check_reserved_id(id: Option<&str>, reserved: &[&str]) -> Result<(), StorageError> {
    match id {
        Some(id) if reserved.contains(&id) => Err(StorageError::InvalidInput(format!(
            "id '{}' is reserved",
            id
        ))),
        _ => Ok(()),
    }
}

/// Use the explicit slug if given, otherwise derive one from `name`
pub fn resolve_slug(explicit: &Option<String>, name: &str) -> Result<String, StorageError> {
    let slug = match non_empty(explicit) {
        Some(slug) => slug,
        None => {
            let derived = slugify(name);
            if derived.is_empty() {
                return Err(StorageError::InvalidInput(format!(
                    "cannot derive a slug from '{}'; provide an explicit slug",
                    name
                )));
            }
            derived
        }
    };
    validate_slug(&slug)?;
    Ok(slug)
}

/// Fail with a conflict naming the current owner if `slug` is taken
pub fn ensure_slug_free(
    conn: &Connection,
    kind: EntityKind,
    slug: &str,
    exclude_id: Option<&str>,
) -> Result<(), StorageError> {
    let availability = slugs::check_slug(conn, kind, slug, exclude_id)?;
    match availability.conflict {
        None => Ok(()),
        Some(owner) => Err(StorageError::Conflict(ConflictKind::SlugTaken {
            kind,
            slug: slug.to_string(),
            conflicting_id: owner.id,
            conflicting_name: owner.name,
        })),
    }
}

/// Map a unique-index violation on write back to a slug conflict.
///
/// The explicit check runs first inside the same transaction, so this only
/// fires when another writer bypassed the service layer.
pub fn map_write_conflict(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    slug: &str,
    err: StorageError,
) -> StorageError {
    if !is_constraint_violation(&err) {
        return err;
    }
    match ensure_slug_free(conn, kind, slug, Some(id)) {
        Err(conflict @ StorageError::Conflict(_)) => conflict,
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_text() {
        assert_eq!(required_text("name", "  Rust  ", 10).unwrap(), "Rust");
        assert!(required_text("name", "   ", 10).is_err());
        assert!(required_text("name", "abcdefghijk", 10).is_err());
    }

    #[test]
    fn test_resolve_slug() {
        assert_eq!(resolve_slug(&None, "Intro to Rust").unwrap(), "intro-to-rust");
        assert_eq!(resolve_slug(&Some(" web3 ".into()), "ignored").unwrap(), "web3");
        assert!(resolve_slug(&Some("Bad Slug".into()), "x").is_err());
        assert_eq!(resolve_slug(&None, "Educação").unwrap(), "educacao");
        // Nothing to derive from
        let err = resolve_slug(&None, "!!!").unwrap_err();
        assert!(err.to_string().contains("explicit slug"));
    }

    #[test]
    fn test_reserved_ids() {
        assert!(check_reserved_id(Some("tree"), CATEGORY_RESERVED_IDS).is_err());
        assert!(check_reserved_id(Some("by-slug"), CATEGORY_RESERVED_IDS).is_err());
        assert!(check_reserved_id(Some("tree"), SUBCATEGORY_RESERVED_IDS).is_ok());
        assert!(check_reserved_id(None, CATEGORY_RESERVED_IDS).is_ok());
    }

    #[test]
    fn test_optional_text() {
        assert_eq!(optional_text("meta", &Some("  ".into()), 5).unwrap(), None);
        assert!(optional_text("meta", &Some("toolong".into()), 5).is_err());
    }
}
