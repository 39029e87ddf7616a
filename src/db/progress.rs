//! Learner progress and gamification records
//!
//! Completions, purchases and XP awards are append-only and idempotent: a
//! repeated write for the same key is a no-op and reports `false`.

use std::collections::HashSet;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// XP award reasons
pub mod xp_reasons {
    pub const LESSON_COMPLETED: &str = "lesson_completed";
    pub const COURSE_COMPLETED: &str = "course_completed";
    pub const COURSE_COMPLETION_BONUS: &str = "course_completion_bonus";
}

/// Streak state for a learner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreakRow {
    pub learner_id: String,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_activity_date: Option<NaiveDate>,
}

/// Badge definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeRow {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub xp_threshold: i64,
}

impl BadgeRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            slug: row.get("slug")?,
            description: row.get("description")?,
            xp_threshold: row.get("xp_threshold")?,
        })
    }
}

/// Input for creating a badge
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BadgeInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub xp_threshold: i64,
}

// =============================================================================
// Completions
// =============================================================================

/// Record a lesson completion. Returns false if already recorded.
pub fn record_lesson_completion(conn: &Connection, learner_id: &str, lesson_id: &str) -> Result<bool, StorageError> {
    let changes = conn.execute(
        "INSERT OR IGNORE INTO lesson_completions (learner_id, lesson_id) VALUES (?, ?)",
        params![learner_id, lesson_id],
    )?;
    Ok(changes > 0)
}

/// Lesson ids a learner has completed within one course
pub fn completed_lessons_in_course(
    conn: &Connection,
    learner_id: &str,
    course_id: &str,
) -> Result<HashSet<String>, StorageError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT lc.lesson_id FROM lesson_completions lc
        JOIN lessons l ON l.id = lc.lesson_id
        JOIN modules m ON m.id = l.module_id
        WHERE lc.learner_id = ? AND m.course_id = ?
        "#,
    )?;
    let ids = stmt
        .query_map(params![learner_id, course_id], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(ids)
}

/// Record a course completion. Returns false if already recorded.
pub fn record_course_completion(conn: &Connection, learner_id: &str, course_id: &str) -> Result<bool, StorageError> {
    let changes = conn.execute(
        "INSERT OR IGNORE INTO course_completions (learner_id, course_id) VALUES (?, ?)",
        params![learner_id, course_id],
    )?;
    Ok(changes > 0)
}

/// All courses a learner has completed
pub fn completed_courses(conn: &Connection, learner_id: &str) -> Result<HashSet<String>, StorageError> {
    let mut stmt = conn.prepare("SELECT course_id FROM course_completions WHERE learner_id = ?")?;
    let ids = stmt
        .query_map(params![learner_id], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(ids)
}

// =============================================================================
// Purchases
// =============================================================================

/// Record a purchase. Returns false if already recorded.
pub fn record_purchase(conn: &Connection, learner_id: &str, course_id: &str) -> Result<bool, StorageError> {
    let changes = conn.execute(
        "INSERT OR IGNORE INTO purchases (learner_id, course_id) VALUES (?, ?)",
        params![learner_id, course_id],
    )?;
    Ok(changes > 0)
}

/// All courses a learner has purchased
pub fn purchased_courses(conn: &Connection, learner_id: &str) -> Result<HashSet<String>, StorageError> {
    let mut stmt = conn.prepare("SELECT course_id FROM purchases WHERE learner_id = ?")?;
    let ids = stmt
        .query_map(params![learner_id], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(ids)
}

// =============================================================================
// XP
// =============================================================================

/// Append an XP award. Each (learner, reason, source) pays out once.
pub fn award_xp(
    conn: &Connection,
    learner_id: &str,
    amount: i64,
    reason: &str,
    source_id: &str,
) -> Result<bool, StorageError> {
    let changes = conn.execute(
        "INSERT OR IGNORE INTO xp_ledger (learner_id, amount, reason, source_id) VALUES (?, ?, ?, ?)",
        params![learner_id, amount, reason, source_id],
    )?;
    Ok(changes > 0)
}

/// Sum of all XP awarded to a learner
pub fn total_xp(conn: &Connection, learner_id: &str) -> Result<i64, StorageError> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM xp_ledger WHERE learner_id = ?",
        params![learner_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

// =============================================================================
// Streaks
// =============================================================================

/// Current streak row (zeroed if the learner has no activity)
pub fn get_streak(conn: &Connection, learner_id: &str) -> Result<StreakRow, StorageError> {
    let row = conn
        .query_row(
            "SELECT current_streak, longest_streak, last_activity_date FROM streaks WHERE learner_id = ?",
            params![learner_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((current, longest, last)) = row else {
        return Ok(StreakRow {
            learner_id: learner_id.to_string(),
            ..Default::default()
        });
    };

    let last_activity_date = match last {
        Some(text) => Some(
            NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map_err(|e| StorageError::Internal(format!("Bad streak date '{}': {}", text, e)))?,
        ),
        None => None,
    };

    Ok(StreakRow {
        learner_id: learner_id.to_string(),
        current_streak: current as u32,
        longest_streak: longest as u32,
        last_activity_date,
    })
}

/// Apply one day of activity to a streak
pub fn advance_streak(streak: &StreakRow, today: NaiveDate) -> StreakRow {
    let current = match streak.last_activity_date {
        Some(last) if last == today => streak.current_streak.max(1),
        Some(last) if last.succ_opt() == Some(today) => streak.current_streak + 1,
        // Clock moved backwards; keep the streak as is
        Some(last) if last > today => streak.current_streak,
        _ => 1,
    };

    StreakRow {
        learner_id: streak.learner_id.clone(),
        current_streak: current,
        longest_streak: streak.longest_streak.max(current),
        last_activity_date: match streak.last_activity_date {
            Some(last) if last > today => Some(last),
            _ => Some(today),
        },
    }
}

/// Persist a streak row
pub fn save_streak(conn: &Connection, streak: &StreakRow) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO streaks (learner_id, current_streak, longest_streak, last_activity_date)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(learner_id) DO UPDATE SET
            current_streak = ?2, longest_streak = ?3, last_activity_date = ?4
        "#,
        params![
            streak.learner_id,
            streak.current_streak as i64,
            streak.longest_streak as i64,
            streak.last_activity_date.map(|d| d.format("%Y-%m-%d").to_string()),
        ],
    )?;
    Ok(())
}

// =============================================================================
// Badges
// =============================================================================

/// Insert a badge definition
pub fn insert_badge(conn: &Connection, id: &str, slug: &str, input: &BadgeInput) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO badges (id, name, slug, description, xp_threshold) VALUES (?, ?, ?, ?, ?)",
        params![id, input.name, slug, input.description, input.xp_threshold],
    )?;
    Ok(())
}

/// Get a badge definition
pub fn get_badge(conn: &Connection, id: &str) -> Result<Option<BadgeRow>, StorageError> {
    let row = conn
        .query_row("SELECT * FROM badges WHERE id = ?", params![id], |row| BadgeRow::from_row(row))
        .optional()?;
    Ok(row)
}

/// All badge definitions, lowest threshold first
pub fn list_badges(conn: &Connection) -> Result<Vec<BadgeRow>, StorageError> {
    let mut stmt = conn.prepare("SELECT * FROM badges ORDER BY xp_threshold, name")?;
    let rows = stmt
        .query_map([], |row| BadgeRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Badges a learner holds
pub fn learner_badges(conn: &Connection, learner_id: &str) -> Result<Vec<BadgeRow>, StorageError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT b.* FROM badges b
        JOIN learner_badges lb ON lb.badge_id = b.id
        WHERE lb.learner_id = ?
        ORDER BY b.xp_threshold, b.name
        "#,
    )?;
    let rows = stmt
        .query_map(params![learner_id], |row| BadgeRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Grant every badge whose threshold is reached. Returns newly granted badges.
pub fn award_reached_badges(conn: &Connection, learner_id: &str, total_xp: i64) -> Result<Vec<BadgeRow>, StorageError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT b.* FROM badges b
        WHERE b.xp_threshold <= ?
          AND NOT EXISTS (
            SELECT 1 FROM learner_badges lb WHERE lb.badge_id = b.id AND lb.learner_id = ?
          )
        ORDER BY b.xp_threshold, b.name
        "#,
    )?;
    let reached = stmt
        .query_map(params![total_xp, learner_id], |row| BadgeRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    for badge in &reached {
        conn.execute(
            "INSERT OR IGNORE INTO learner_badges (learner_id, badge_id) VALUES (?, ?)",
            params![learner_id, badge.id],
        )?;
    }

    Ok(reached)
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

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_xp_awards_once_per_source() {
        let conn = setup();
        assert!(award_xp(&conn, "u", 10, xp_reasons::LESSON_COMPLETED, "l1").unwrap());
        assert!(!award_xp(&conn, "u", 10, xp_reasons::LESSON_COMPLETED, "l1").unwrap());
        assert!(award_xp(&conn, "u", 5, xp_reasons::LESSON_COMPLETED, "l2").unwrap());
        assert_eq!(total_xp(&conn, "u").unwrap(), 15);
        assert_eq!(total_xp(&conn, "nobody").unwrap(), 0);
    }

    #[test]
    fn test_purchases_and_course_completions() {
        let conn = setup();
        assert!(record_purchase(&conn, "u", "c1").unwrap());
        assert!(!record_purchase(&conn, "u", "c1").unwrap());
        assert!(record_course_completion(&conn, "u", "c2").unwrap());

        assert!(purchased_courses(&conn, "u").unwrap().contains("c1"));
        assert!(completed_courses(&conn, "u").unwrap().contains("c2"));
        assert!(completed_courses(&conn, "other").unwrap().is_empty());
    }

    #[test]
    fn test_streak_rules() {
        let start = StreakRow { learner_id: "u".into(), ..Default::default() };

        let d1 = advance_streak(&start, day("2026-03-01"));
        assert_eq!((d1.current_streak, d1.longest_streak), (1, 1));

        let same_day = advance_streak(&d1, day("2026-03-01"));
        assert_eq!(same_day.current_streak, 1);

        let d2 = advance_streak(&d1, day("2026-03-02"));
        let d3 = advance_streak(&d2, day("2026-03-03"));
        assert_eq!((d3.current_streak, d3.longest_streak), (3, 3));

        let after_gap = advance_streak(&d3, day("2026-03-07"));
        assert_eq!((after_gap.current_streak, after_gap.longest_streak), (1, 3));
        assert_eq!(after_gap.last_activity_date, Some(day("2026-03-07")));
    }

    #[test]
    fn test_streak_persists() {
        let conn = setup();
        assert_eq!(get_streak(&conn, "u").unwrap().current_streak, 0);

        let s = advance_streak(&get_streak(&conn, "u").unwrap(), day("2026-01-31"));
        save_streak(&conn, &s).unwrap();
        let s = advance_streak(&get_streak(&conn, "u").unwrap(), day("2026-02-01"));
        save_streak(&conn, &s).unwrap();

        let loaded = get_streak(&conn, "u").unwrap();
        assert_eq!(loaded.current_streak, 2);
        assert_eq!(loaded.last_activity_date, Some(day("2026-02-01")));
    }

    #[test]
    fn test_badges_awarded_once_at_threshold() {
        let conn = setup();
        insert_badge(&conn, "b1", "starter", &BadgeInput { name: "Starter".into(), xp_threshold: 10, ..Default::default() }).unwrap();
        insert_badge(&conn, "b2", "pro", &BadgeInput { name: "Pro".into(), xp_threshold: 100, ..Default::default() }).unwrap();

        assert!(award_reached_badges(&conn, "u", 5).unwrap().is_empty());
        let first = award_reached_badges(&conn, "u", 10).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "b1");
        assert!(award_reached_badges(&conn, "u", 50).unwrap().is_empty());

        let later = award_reached_badges(&conn, "u", 150).unwrap();
        assert_eq!(later[0].id, "b2");
        assert_eq!(learner_badges(&conn, "u").unwrap().len(), 2);
        assert_eq!(list_badges(&conn).unwrap().len(), 2);
    }
}
