//! Slug ownership lookups, scoped per entity kind

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{EntityKind, StorageError};

/// Entity currently holding a slug
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlugConflict {
    pub id: String,
    pub name: String,
}

/// Result of a slug availability check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlugAvailability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<SlugConflict>,
}

fn table_for(kind: EntityKind) -> Result<(&'static str, &'static str), StorageError> {
    match kind {
        EntityKind::Category => Ok(("categories", "name")),
        EntityKind::Subcategory => Ok(("subcategories", "name")),
        EntityKind::Course => Ok(("courses", "title")),
        EntityKind::Badge => Ok(("badges", "name")),
        EntityKind::Module | EntityKind::Lesson => Err(StorageError::Internal(format!(
            "{} has no slug",
            kind
        ))),
    }
}

/// Find the entity of `kind` that owns `slug`
pub fn find_slug_owner(
    conn: &Connection,
    kind: EntityKind,
    slug: &str,
) -> Result<Option<SlugConflict>, StorageError> {
    let (table, name_col) = table_for(kind)?;
    let sql = format!("SELECT id, {} FROM {} WHERE slug = ?", name_col, table);

    let owner = conn
        .query_row(&sql, params![slug], |row| {
            Ok(SlugConflict {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .optional()?;

    Ok(owner)
}

/// Slug is available if nobody owns it, or the owner is `exclude_id`
pub fn check_slug(
    conn: &Connection,
    kind: EntityKind,
    slug: &str,
    exclude_id: Option<&str>,
) -> Result<SlugAvailability, StorageError> {
    let conflict = find_slug_owner(conn, kind, slug)?
        .filter(|owner| Some(owner.id.as_str()) != exclude_id);

    Ok(SlugAvailability {
        available: conflict.is_none(),
        conflict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO categories (id, name, slug) VALUES ('cat-1', 'Programming', 'programming');
            INSERT INTO subcategories (id, name, slug, category_id) VALUES ('sub-1', 'Rust', 'rust', 'cat-1');
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_own_slug_is_available_with_exclusion() {
        let conn = setup();
        let check = check_slug(&conn, EntityKind::Category, "programming", Some("cat-1")).unwrap();
        assert!(check.available);
        assert!(check.conflict.is_none());
    }

    #[test]
    fn test_other_entity_slug_conflicts() {
        let conn = setup();
        let check = check_slug(&conn, EntityKind::Category, "programming", Some("cat-2")).unwrap();
        assert!(!check.available);
        assert_eq!(
            check.conflict,
            Some(SlugConflict { id: "cat-1".into(), name: "Programming".into() })
        );

        let no_exclusion = check_slug(&conn, EntityKind::Category, "programming", None).unwrap();
        assert!(!no_exclusion.available);
    }

    #[test]
    fn test_slugs_are_scoped_per_kind() {
        let conn = setup();
        // A subcategory slug does not block a category
        assert!(check_slug(&conn, EntityKind::Category, "rust", None).unwrap().available);
        assert!(!check_slug(&conn, EntityKind::Subcategory, "rust", None).unwrap().available);
    }

    #[test]
    fn test_check_is_idempotent() {
        let conn = setup();
        let a = check_slug(&conn, EntityKind::Category, "programming", None).unwrap();
        let b = check_slug(&conn, EntityKind::Category, "programming", None).unwrap();
        assert_eq!(a, b);
    }
}
