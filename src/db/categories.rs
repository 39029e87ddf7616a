//! Category CRUD operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::hierarchy::CategoryTree;

/// Category row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRow {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub image: Option<String>,
    pub parent_id: Option<String>,
    pub is_active: bool,
    pub is_featured: bool,
    pub sort_order: i32,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Derived on read
    #[serde(default)]
    pub course_count: u64,
    #[serde(default)]
    pub child_count: u64,
    #[serde(default)]
    pub subcategory_count: u64,
}

impl CategoryRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            slug: row.get("slug")?,
            description: row.get("description")?,
            icon: row.get("icon")?,
            color: row.get("color")?,
            image: row.get("image")?,
            parent_id: row.get("parent_id")?,
            is_active: row.get("is_active")?,
            is_featured: row.get("is_featured")?,
            sort_order: row.get("sort_order")?,
            meta_title: row.get("meta_title")?,
            meta_description: row.get("meta_description")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            course_count: row.get::<_, i64>("course_count")? as u64,
            child_count: row.get::<_, i64>("child_count")? as u64,
            subcategory_count: row.get::<_, i64>("subcategory_count")? as u64,
        })
    }
}

/// Input for creating or updating a category (full form submission)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryInput {
    /// Generated when omitted on create; ignored on update
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// Derived from `name` when omitted
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub meta_title: Option<String>,
    #[serde(default)]
    pub meta_description: Option<String>,
}

fn default_true() -> bool { true }

/// Query parameters for listing categories
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryQuery {
    /// Only children of this category
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Only categories without a parent
    #[serde(default)]
    pub roots_only: bool,
    #[serde(default)]
    pub active_only: bool,
    #[serde(default)]
    pub featured_only: bool,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

/// Base select with derived dependent counts
const SELECT_WITH_COUNTS: &str = r#"
    SELECT c.*,
        (SELECT COUNT(*) FROM courses co WHERE co.category_id = c.id) AS course_count,
        (SELECT COUNT(*) FROM categories ch WHERE ch.parent_id = c.id) AS child_count,
        (SELECT COUNT(*) FROM subcategories s WHERE s.category_id = c.id) AS subcategory_count
    FROM categories c
"#;

/// Get category by ID
pub fn get_category(conn: &Connection, id: &str) -> Result<Option<CategoryRow>, StorageError> {
    let sql = format!("{} WHERE c.id = ?", SELECT_WITH_COUNTS);
    let row = conn
        .query_row(&sql, params![id], |row| CategoryRow::from_row(row))
        .optional()?;
    Ok(row)
}

/// Get category by slug
pub fn get_category_by_slug(conn: &Connection, slug: &str) -> Result<Option<CategoryRow>, StorageError> {
    let sql = format!("{} WHERE c.slug = ?", SELECT_WITH_COUNTS);
    let row = conn
        .query_row(&sql, params![slug], |row| CategoryRow::from_row(row))
        .optional()?;
    Ok(row)
}

/// Check existence without loading the row
pub fn category_exists(conn: &Connection, id: &str) -> Result<bool, StorageError> {
    let exists = conn
        .query_row("SELECT 1 FROM categories WHERE id = ?", params![id], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(exists)
}

/// List categories with optional filters
pub fn list_categories(conn: &Connection, query: &CategoryQuery) -> Result<Vec<CategoryRow>, StorageError> {
    let mut sql = String::from(SELECT_WITH_COUNTS);
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(ref parent_id) = query.parent_id {
        conditions.push("c.parent_id = ?".to_string());
        params.push(Box::new(parent_id.clone()));
    } else if query.roots_only {
        conditions.push("c.parent_id IS NULL".to_string());
    }

    if query.active_only {
        conditions.push("c.is_active = 1".to_string());
    }

    if query.featured_only {
        conditions.push("c.is_featured = 1".to_string());
    }

    if let Some(ref search) = query.search {
        conditions.push("(c.name LIKE ? OR c.slug LIKE ?)".to_string());
        let pattern = format!("%{}%", search);
        params.push(Box::new(pattern.clone()));
        params.push(Box::new(pattern));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    sql.push_str(" ORDER BY c.sort_order, c.name LIMIT ? OFFSET ?");
    params.push(Box::new(query.limit as i64));
    params.push(Box::new(query.offset as i64));

    debug!("Executing query: {}", sql);

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| CategoryRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Direct children of a category
pub fn children_of(conn: &Connection, id: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare("SELECT id FROM categories WHERE parent_id = ? ORDER BY sort_order, name")?;
    let ids = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Load the whole parent graph in one query
pub fn load_tree(conn: &Connection) -> Result<CategoryTree, StorageError> {
    let mut stmt = conn.prepare("SELECT id, parent_id FROM categories ORDER BY sort_order, name")?;
    let edges = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    debug!(nodes = edges.len(), "Loaded category tree");
    Ok(CategoryTree::from_edges(edges))
}

/// Dependent row counts used by the deletion precondition check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryDependents {
    pub courses: u64,
    pub children: u64,
    pub subcategories: u64,
}

/// Count everything that references a category
pub fn count_dependents(conn: &Connection, id: &str) -> Result<CategoryDependents, StorageError> {
    let (courses, children, subcategories): (i64, i64, i64) = conn.query_row(
        r#"
        SELECT
            (SELECT COUNT(*) FROM courses WHERE category_id = ?1),
            (SELECT COUNT(*) FROM categories WHERE parent_id = ?1),
            (SELECT COUNT(*) FROM subcategories WHERE category_id = ?1)
        "#,
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    Ok(CategoryDependents {
        courses: courses as u64,
        children: children as u64,
        subcategories: subcategories as u64,
    })
}

/// Insert a category. Input must already be normalized (id and slug set).
pub fn insert_category(conn: &Connection, id: &str, slug: &str, input: &CategoryInput) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO categories (
            id, name, slug, description, icon, color, image, parent_id,
            is_active, is_featured, sort_order, meta_title, meta_description
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            input.name,
            slug,
            input.description,
            input.icon,
            input.color,
            input.image,
            input.parent_id,
            input.is_active,
            input.is_featured,
            input.sort_order,
            input.meta_title,
            input.meta_description,
        ],
    )?;
    Ok(())
}

/// Replace all editable fields of a category
pub fn update_category(conn: &Connection, id: &str, slug: &str, input: &CategoryInput) -> Result<bool, StorageError> {
    let changes = conn.execute(
        r#"
        UPDATE categories SET
            name = ?, slug = ?, description = ?, icon = ?, color = ?, image = ?,
            parent_id = ?, is_active = ?, is_featured = ?, sort_order = ?,
            meta_title = ?, meta_description = ?, updated_at = datetime('now')
        WHERE id = ?
        "#,
        params![
            input.name,
            slug,
            input.description,
            input.icon,
            input.color,
            input.image,
            input.parent_id,
            input.is_active,
            input.is_featured,
            input.sort_order,
            input.meta_title,
            input.meta_description,
            id,
        ],
    )?;
    Ok(changes > 0)
}

/// Delete a category by ID
pub fn delete_category(conn: &Connection, id: &str) -> Result<bool, StorageError> {
    let changes = conn.execute("DELETE FROM categories WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn input(name: &str, parent: Option<&str>) -> CategoryInput {
        CategoryInput {
            name: name.to_string(),
            parent_id: parent.map(|p| p.to_string()),
            is_active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_get_and_counts() {
        let conn = setup();
        insert_category(&conn, "a", "a", &input("A", None)).unwrap();
        insert_category(&conn, "b", "b", &input("B", Some("a"))).unwrap();

        let a = get_category(&conn, "a").unwrap().unwrap();
        assert_eq!(a.child_count, 1);
        assert_eq!(a.course_count, 0);
        assert!(a.is_active);

        let by_slug = get_category_by_slug(&conn, "b").unwrap().unwrap();
        assert_eq!(by_slug.parent_id.as_deref(), Some("a"));
        assert!(get_category(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_children_and_tree() {
        let conn = setup();
        insert_category(&conn, "a", "a", &input("A", None)).unwrap();
        insert_category(&conn, "b", "b", &input("B", Some("a"))).unwrap();
        insert_category(&conn, "c", "c", &input("C", Some("b"))).unwrap();

        assert_eq!(children_of(&conn, "a").unwrap(), vec!["b".to_string()]);
        let tree = load_tree(&conn).unwrap();
        assert_eq!(tree.len(), 3);
        assert!(tree.would_create_cycle("a", "c"));
    }

    #[test]
    fn test_list_filters() {
        let conn = setup();
        insert_category(&conn, "a", "a", &input("Alpha", None)).unwrap();
        insert_category(&conn, "b", "b", &input("Beta", Some("a"))).unwrap();
        let mut hidden = input("Gamma", None);
        hidden.is_active = false;
        insert_category(&conn, "g", "g", &hidden).unwrap();

        let roots = list_categories(&conn, &CategoryQuery { roots_only: true, limit: 10, ..Default::default() }).unwrap();
        assert_eq!(roots.len(), 2);

        let active_roots = list_categories(
            &conn,
            &CategoryQuery { roots_only: true, active_only: true, limit: 10, ..Default::default() },
        )
        .unwrap();
        assert_eq!(active_roots.len(), 1);

        let children = list_categories(
            &conn,
            &CategoryQuery { parent_id: Some("a".into()), limit: 10, ..Default::default() },
        )
        .unwrap();
        assert_eq!(children[0].id, "b");

        let search = list_categories(
            &conn,
            &CategoryQuery { search: Some("amm".into()), limit: 10, ..Default::default() },
        )
        .unwrap();
        assert_eq!(search.len(), 1);
    }

    #[test]
    fn test_count_dependents() {
        let conn = setup();
        insert_category(&conn, "a", "a", &input("A", None)).unwrap();
        insert_category(&conn, "b", "b", &input("B", Some("a"))).unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO subcategories (id, name, slug, category_id) VALUES ('s', 'S', 's', 'a');
            INSERT INTO courses (id, title, slug, category_id) VALUES ('co', 'Course', 'course', 'a');
            "#,
        )
        .unwrap();

        assert_eq!(
            count_dependents(&conn, "a").unwrap(),
            CategoryDependents { courses: 1, children: 1, subcategories: 1 }
        );
        assert_eq!(count_dependents(&conn, "b").unwrap(), CategoryDependents::default());
    }
}
