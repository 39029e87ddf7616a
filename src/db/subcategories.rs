//! Subcategory CRUD operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;

/// Subcategory row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubcategoryRow {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub image: Option<String>,
    pub category_id: String,
    pub is_active: bool,
    pub sort_order: i32,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub course_count: u64,
}

impl SubcategoryRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            slug: row.get("slug")?,
            description: row.get("description")?,
            icon: row.get("icon")?,
            color: row.get("color")?,
            image: row.get("image")?,
            category_id: row.get("category_id")?,
            is_active: row.get("is_active")?,
            sort_order: row.get("sort_order")?,
            meta_title: row.get("meta_title")?,
            meta_description: row.get("meta_description")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            course_count: row.get::<_, i64>("course_count")? as u64,
        })
    }
}

/// Input for creating or updating a subcategory
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubcategoryInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
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
    /// Required parent category
    pub category_id: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub meta_title: Option<String>,
    #[serde(default)]
    pub meta_description: Option<String>,
}

fn default_true() -> bool { true }

/// Query parameters for listing subcategories
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubcategoryQuery {
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub active_only: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

const SELECT_WITH_COUNTS: &str = r#"
    SELECT s.*,
        (SELECT COUNT(*) FROM courses co WHERE co.subcategory_id = s.id) AS course_count
    FROM subcategories s
"#;

/// Get subcategory by ID
pub fn get_subcategory(conn: &Connection, id: &str) -> Result<Option<SubcategoryRow>, StorageError> {
    let sql = format!("{} WHERE s.id = ?", SELECT_WITH_COUNTS);
    let row = conn
        .query_row(&sql, params![id], |row| SubcategoryRow::from_row(row))
        .optional()?;
    Ok(row)
}

/// List subcategories, optionally for one category
pub fn list_subcategories(conn: &Connection, query: &SubcategoryQuery) -> Result<Vec<SubcategoryRow>, StorageError> {
    let mut sql = String::from(SELECT_WITH_COUNTS);
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(ref category_id) = query.category_id {
        conditions.push("s.category_id = ?");
        params.push(Box::new(category_id.clone()));
    }

    if query.active_only {
        conditions.push("s.is_active = 1");
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    sql.push_str(" ORDER BY s.sort_order, s.name LIMIT ? OFFSET ?");
    params.push(Box::new(query.limit as i64));
    params.push(Box::new(query.offset as i64));

    debug!("Executing query: {}", sql);

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| SubcategoryRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Number of courses filed under a subcategory
pub fn count_courses(conn: &Connection, id: &str) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM courses WHERE subcategory_id = ?",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Parent category of a subcategory
pub fn parent_category_of(conn: &Connection, id: &str) -> Result<Option<String>, StorageError> {
    let parent = conn
        .query_row(
            "SELECT category_id FROM subcategories WHERE id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(parent)
}

/// Insert a subcategory. Input must already be normalized.
pub fn insert_subcategory(conn: &Connection, id: &str, slug: &str, input: &SubcategoryInput) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO subcategories (
            id, name, slug, description, icon, color, image, category_id,
            is_active, sort_order, meta_title, meta_description
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            input.name,
            slug,
            input.description,
            input.icon,
            input.color,
            input.image,
            input.category_id,
            input.is_active,
            input.sort_order,
            input.meta_title,
            input.meta_description,
        ],
    )?;
    Ok(())
}

/// Replace all editable fields of a subcategory
pub fn update_subcategory(conn: &Connection, id: &str, slug: &str, input: &SubcategoryInput) -> Result<bool, StorageError> {
    let changes = conn.execute(
        r#"
        UPDATE subcategories SET
            name = ?, slug = ?, description = ?, icon = ?, color = ?, image = ?,
            category_id = ?, is_active = ?, sort_order = ?,
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
            input.category_id,
            input.is_active,
            input.sort_order,
            input.meta_title,
            input.meta_description,
            id,
        ],
    )?;
    Ok(changes > 0)
}

/// Delete a subcategory by ID
pub fn delete_subcategory(conn: &Connection, id: &str) -> Result<bool, StorageError> {
    let changes = conn.execute("DELETE FROM subcategories WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
