//! Course, module and lesson CRUD operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::unlock::{StoredCriteria, UnlockCriteria};

/// Course row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseRow {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub description: Option<String>,
    pub category_id: Option<String>,
    pub subcategory_id: Option<String>,
    pub is_published: bool,
    pub price_cents: i64,
    pub xp_reward: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl CourseRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            slug: row.get("slug")?,
            description: row.get("description")?,
            category_id: row.get("category_id")?,
            subcategory_id: row.get("subcategory_id")?,
            is_published: row.get("is_published")?,
            price_cents: row.get("price_cents")?,
            xp_reward: row.get("xp_reward")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Module row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRow {
    pub id: String,
    pub course_id: String,
    pub title: String,
    pub description: Option<String>,
    pub sort_order: i32,
    /// Raw criteria JSON as stored
    pub unlock_criteria: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ModuleRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            course_id: row.get("course_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            sort_order: row.get("sort_order")?,
            unlock_criteria: row.get("unlock_criteria")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Lesson row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonRow {
    pub id: String,
    pub module_id: String,
    pub title: String,
    pub content: Option<String>,
    pub duration_minutes: i32,
    pub xp_reward: i64,
    pub sort_order: i32,
    pub unlock_criteria: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl LessonRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            module_id: row.get("module_id")?,
            title: row.get("title")?,
            content: row.get("content")?,
            duration_minutes: row.get("duration_minutes")?,
            xp_reward: row.get("xp_reward")?,
            sort_order: row.get("sort_order")?,
            unlock_criteria: row.get("unlock_criteria")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for creating or replacing a course
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseInput {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub subcategory_id: Option<String>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub price_cents: i64,
    #[serde(default)]
    pub xp_reward: i64,
}

/// Input for creating or replacing a module
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleInput {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Appended after existing modules when omitted; kept as is on update
    #[serde(default)]
    pub sort_order: Option<i32>,
    #[serde(default)]
    pub unlock_criteria: Option<UnlockCriteria>,
}

/// Input for creating or replacing a lesson
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LessonInput {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub duration_minutes: i32,
    #[serde(default)]
    pub xp_reward: i64,
    #[serde(default)]
    pub sort_order: Option<i32>,
    #[serde(default)]
    pub unlock_criteria: Option<UnlockCriteria>,
}

/// Query parameters for listing courses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseQuery {
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub subcategory_id: Option<String>,
    #[serde(default)]
    pub published_only: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

fn criteria_column(criteria: &Option<UnlockCriteria>) -> Option<String> {
    criteria.as_ref().map(UnlockCriteria::to_json_string)
}

// =============================================================================
// Courses
// =============================================================================

/// Get course by ID
pub fn get_course(conn: &Connection, id: &str) -> Result<Option<CourseRow>, StorageError> {
    let row = conn
        .query_row("SELECT * FROM courses WHERE id = ?", params![id], |row| CourseRow::from_row(row))
        .optional()?;
    Ok(row)
}

/// List courses with optional filters
pub fn list_courses(conn: &Connection, query: &CourseQuery) -> Result<Vec<CourseRow>, StorageError> {
    let mut sql = String::from("SELECT * FROM courses");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(ref category_id) = query.category_id {
        conditions.push("category_id = ?");
        params.push(Box::new(category_id.clone()));
    }

    if let Some(ref subcategory_id) = query.subcategory_id {
        conditions.push("subcategory_id = ?");
        params.push(Box::new(subcategory_id.clone()));
    }

    if query.published_only {
        conditions.push("is_published = 1");
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    sql.push_str(" ORDER BY created_at DESC, title LIMIT ? OFFSET ?");
    params.push(Box::new(query.limit as i64));
    params.push(Box::new(query.offset as i64));

    debug!("Executing query: {}", sql);

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| CourseRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Insert a course. Input must already be normalized.
pub fn insert_course(conn: &Connection, id: &str, slug: &str, input: &CourseInput) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO courses (
            id, title, slug, description, category_id, subcategory_id,
            is_published, price_cents, xp_reward
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            input.title,
            slug,
            input.description,
            input.category_id,
            input.subcategory_id,
            input.is_published,
            input.price_cents,
            input.xp_reward,
        ],
    )?;
    Ok(())
}

/// Replace a course's editable fields
pub fn update_course(conn: &Connection, id: &str, slug: &str, input: &CourseInput) -> Result<bool, StorageError> {
    let changes = conn.execute(
        r#"
        UPDATE courses SET
            title = ?, slug = ?, description = ?, category_id = ?, subcategory_id = ?,
            is_published = ?, price_cents = ?, xp_reward = ?, updated_at = datetime('now')
        WHERE id = ?
        "#,
        params![
            input.title,
            slug,
            input.description,
            input.category_id,
            input.subcategory_id,
            input.is_published,
            input.price_cents,
            input.xp_reward,
            id,
        ],
    )?;
    Ok(changes > 0)
}

/// Point every course of a subcategory at `category_id`. Returns rows changed.
pub fn reassign_subcategory_courses(
    conn: &Connection,
    subcategory_id: &str,
    category_id: &str,
) -> Result<usize, StorageError> {
    let changes = conn.execute(
        r#"
        UPDATE courses SET category_id = ?, updated_at = datetime('now')
        WHERE subcategory_id = ? AND category_id IS NOT ?
        "#,
        params![category_id, subcategory_id, category_id],
    )?;
    Ok(changes)
}

/// Modules and lessons of other courses whose prerequisite criteria name a course
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrerequisiteRefs {
    pub modules: u64,
    pub lessons: u64,
}

/// Count content outside `course_id` that lists it as a prerequisite.
///
/// `instr` narrows the scan; each candidate is then parsed so only real
/// `prerequisite` entries count. Unparseable criteria reference nothing.
pub fn count_prerequisite_refs(conn: &Connection, course_id: &str) -> Result<PrerequisiteRefs, StorageError> {
    let names_course = |raw: &str| match StoredCriteria::parse(Some(raw)) {
        StoredCriteria::Valid(UnlockCriteria::Prerequisite { course_ids }) => {
            course_ids.iter().any(|id| id == course_id)
        }
        _ => false,
    };

    let mut stmt = conn.prepare(
        "SELECT unlock_criteria FROM modules \
         WHERE course_id != ?1 AND instr(unlock_criteria, ?1) > 0",
    )?;
    let modules = stmt
        .query_map(params![course_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|raw| names_course(raw.as_str()))
        .count() as u64;

    let mut stmt = conn.prepare(
        r#"
        SELECT l.unlock_criteria FROM lessons l
        JOIN modules m ON m.id = l.module_id
        WHERE m.course_id != ?1 AND instr(l.unlock_criteria, ?1) > 0
        "#,
    )?;
    let lessons = stmt
        .query_map(params![course_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|raw| names_course(raw.as_str()))
        .count() as u64;

    Ok(PrerequisiteRefs { modules, lessons })
}

/// Delete a course (cascades to modules and lessons)
pub fn delete_course(conn: &Connection, id: &str) -> Result<bool, StorageError> {
    let changes = conn.execute("DELETE FROM courses WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

// =============================================================================
// Modules
// =============================================================================

/// Get module by ID
pub fn get_module(conn: &Connection, id: &str) -> Result<Option<ModuleRow>, StorageError> {
    let row = conn
        .query_row("SELECT * FROM modules WHERE id = ?", params![id], |row| ModuleRow::from_row(row))
        .optional()?;
    Ok(row)
}

/// Modules of a course in display order
pub fn list_modules(conn: &Connection, course_id: &str) -> Result<Vec<ModuleRow>, StorageError> {
    let mut stmt = conn.prepare("SELECT * FROM modules WHERE course_id = ? ORDER BY sort_order, created_at")?;
    let rows = stmt
        .query_map(params![course_id], |row| ModuleRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Sort order one past the current last module
pub fn next_module_order(conn: &Connection, course_id: &str) -> Result<i32, StorageError> {
    let next: i32 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM modules WHERE course_id = ?",
        params![course_id],
        |row| row.get(0),
    )?;
    Ok(next)
}

/// Insert a module
pub fn insert_module(
    conn: &Connection,
    id: &str,
    course_id: &str,
    sort_order: i32,
    input: &ModuleInput,
) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO modules (id, course_id, title, description, sort_order, unlock_criteria)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            course_id,
            input.title,
            input.description,
            sort_order,
            criteria_column(&input.unlock_criteria),
        ],
    )?;
    Ok(())
}

/// Replace a module's fields, criteria included
pub fn update_module(conn: &Connection, id: &str, sort_order: i32, input: &ModuleInput) -> Result<bool, StorageError> {
    let changes = conn.execute(
        r#"
        UPDATE modules SET
            title = ?, description = ?, sort_order = ?, unlock_criteria = ?,
            updated_at = datetime('now')
        WHERE id = ?
        "#,
        params![
            input.title,
            input.description,
            sort_order,
            criteria_column(&input.unlock_criteria),
            id,
        ],
    )?;
    Ok(changes > 0)
}

/// Replace a module's unlock criteria
pub fn set_module_criteria(
    conn: &Connection,
    id: &str,
    criteria: &Option<UnlockCriteria>,
) -> Result<bool, StorageError> {
    let changes = conn.execute(
        "UPDATE modules SET unlock_criteria = ?, updated_at = datetime('now') WHERE id = ?",
        params![criteria_column(criteria), id],
    )?;
    Ok(changes > 0)
}

/// Write `sort_order = position` for each module id
pub fn set_module_order(conn: &Connection, ordered_ids: &[String]) -> Result<(), StorageError> {
    let mut stmt = conn.prepare("UPDATE modules SET sort_order = ?, updated_at = datetime('now') WHERE id = ?")?;
    for (position, id) in ordered_ids.iter().enumerate() {
        stmt.execute(params![position as i32, id])?;
    }
    Ok(())
}

/// Delete a module (cascades to lessons)
pub fn delete_module(conn: &Connection, id: &str) -> Result<bool, StorageError> {
    let changes = conn.execute("DELETE FROM modules WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

// =============================================================================
// Lessons
// =============================================================================

/// Get lesson by ID
pub fn get_lesson(conn: &Connection, id: &str) -> Result<Option<LessonRow>, StorageError> {
    let row = conn
        .query_row("SELECT * FROM lessons WHERE id = ?", params![id], |row| LessonRow::from_row(row))
        .optional()?;
    Ok(row)
}

/// Lessons of a module in display order
pub fn list_lessons(conn: &Connection, module_id: &str) -> Result<Vec<LessonRow>, StorageError> {
    let mut stmt = conn.prepare("SELECT * FROM lessons WHERE module_id = ? ORDER BY sort_order, created_at")?;
    let rows = stmt
        .query_map(params![module_id], |row| LessonRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Course that owns a lesson
pub fn course_of_lesson(conn: &Connection, lesson_id: &str) -> Result<Option<String>, StorageError> {
    let course_id = conn
        .query_row(
            r#"
            SELECT m.course_id FROM lessons l
            JOIN modules m ON m.id = l.module_id
            WHERE l.id = ?
            "#,
            params![lesson_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(course_id)
}

/// Total lessons in a course
pub fn count_course_lessons(conn: &Connection, course_id: &str) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row(
        r#"
        SELECT COUNT(*) FROM lessons l
        JOIN modules m ON m.id = l.module_id
        WHERE m.course_id = ?
        "#,
        params![course_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Sort order one past the current last lesson
pub fn next_lesson_order(conn: &Connection, module_id: &str) -> Result<i32, StorageError> {
    let next: i32 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM lessons WHERE module_id = ?",
        params![module_id],
        |row| row.get(0),
    )?;
    Ok(next)
}

/// Insert a lesson
pub fn insert_lesson(
    conn: &Connection,
    id: &str,
    module_id: &str,
    sort_order: i32,
    input: &LessonInput,
) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO lessons (
            id, module_id, title, content, duration_minutes, xp_reward, sort_order, unlock_criteria
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            module_id,
            input.title,
            input.content,
            input.duration_minutes,
            input.xp_reward,
            sort_order,
            criteria_column(&input.unlock_criteria),
        ],
    )?;
    Ok(())
}

/// Replace a lesson's fields, criteria included
pub fn update_lesson(conn: &Connection, id: &str, sort_order: i32, input: &LessonInput) -> Result<bool, StorageError> {
    let changes = conn.execute(
        r#"
        UPDATE lessons SET
            title = ?, content = ?, duration_minutes = ?, xp_reward = ?, sort_order = ?,
            unlock_criteria = ?, updated_at = datetime('now')
        WHERE id = ?
        "#,
        params![
            input.title,
            input.content,
            input.duration_minutes,
            input.xp_reward,
            sort_order,
            criteria_column(&input.unlock_criteria),
            id,
        ],
    )?;
    Ok(changes > 0)
}

/// Replace a lesson's unlock criteria
pub fn set_lesson_criteria(
    conn: &Connection,
    id: &str,
    criteria: &Option<UnlockCriteria>,
) -> Result<bool, StorageError> {
    let changes = conn.execute(
        "UPDATE lessons SET unlock_criteria = ?, updated_at = datetime('now') WHERE id = ?",
        params![criteria_column(criteria), id],
    )?;
    Ok(changes > 0)
}

/// Write `sort_order = position` for each lesson id
pub fn set_lesson_order(conn: &Connection, ordered_ids: &[String]) -> Result<(), StorageError> {
    let mut stmt = conn.prepare("UPDATE lessons SET sort_order = ?, updated_at = datetime('now') WHERE id = ?")?;
    for (position, id) in ordered_ids.iter().enumerate() {
        stmt.execute(params![position as i32, id])?;
    }
    Ok(())
}

/// Delete a lesson
pub fn delete_lesson(conn: &Connection, id: &str) -> Result<bool, StorageError> {
    let changes = conn.execute("DELETE FROM lessons WHERE id = ?", params![id])?;
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
        insert_course(&conn, "course", "course", &CourseInput { title: "Course".into(), ..Default::default() })
            .unwrap();
        conn
    }

    #[test]
    fn test_module_append_order() {
        let conn = setup();
        assert_eq!(next_module_order(&conn, "course").unwrap(), 0);
        insert_module(&conn, "m1", "course", 0, &ModuleInput { title: "One".into(), ..Default::default() }).unwrap();
        insert_module(&conn, "m2", "course", 1, &ModuleInput { title: "Two".into(), ..Default::default() }).unwrap();
        assert_eq!(next_module_order(&conn, "course").unwrap(), 2);

        set_module_order(&conn, &["m2".to_string(), "m1".to_string()]).unwrap();
        let ids: Vec<String> = list_modules(&conn, "course").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[test]
    fn test_criteria_round_trip_through_column() {
        let conn = setup();
        let input = ModuleInput {
            title: "Gated".into(),
            unlock_criteria: Some(UnlockCriteria::Xp { min_xp: 50 }),
            ..Default::default()
        };
        insert_module(&conn, "m", "course", 0, &input).unwrap();
        let stored = get_module(&conn, "m").unwrap().unwrap();
        assert_eq!(stored.unlock_criteria.as_deref(), Some(r#"{"type":"xp","minXp":50}"#));

        set_module_criteria(&conn, "m", &None).unwrap();
        assert!(get_module(&conn, "m").unwrap().unwrap().unlock_criteria.is_none());
    }

    #[test]
    fn test_lessons_cascade_with_course() {
        let conn = setup();
        insert_module(&conn, "m", "course", 0, &ModuleInput { title: "M".into(), ..Default::default() }).unwrap();
        insert_lesson(&conn, "l1", "m", 0, &LessonInput { title: "L1".into(), ..Default::default() }).unwrap();
        insert_lesson(&conn, "l2", "m", 1, &LessonInput { title: "L2".into(), ..Default::default() }).unwrap();

        assert_eq!(count_course_lessons(&conn, "course").unwrap(), 2);
        assert_eq!(course_of_lesson(&conn, "l2").unwrap().as_deref(), Some("course"));

        assert!(delete_course(&conn, "course").unwrap());
        assert!(get_lesson(&conn, "l1").unwrap().is_none());
        assert!(get_module(&conn, "m").unwrap().is_none());
    }

    #[test]
    fn test_list_courses_filters() {
        let conn = setup();
        insert_course(
            &conn,
            "pub",
            "pub",
            &CourseInput { title: "Published".into(), is_published: true, ..Default::default() },
        )
        .unwrap();

        let all = list_courses(&conn, &CourseQuery { limit: 10, ..Default::default() }).unwrap();
        assert_eq!(all.len(), 2);
        let published = list_courses(&conn, &CourseQuery { published_only: true, limit: 10, ..Default::default() }).unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, "pub");
    }
}
