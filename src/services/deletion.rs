//! Deletion precondition checks
//!
//! A check only reads. Services run it inside the same transaction as the
//! delete so the answer cannot go stale before the row is removed.

use rusqlite::Connection;
use serde::Serialize;

use crate::db::{categories, courses, subcategories};
use crate::error::{DeletionBlocker, DependencyKind, EntityKind, StorageError};

/// Outcome of a deletion precondition check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "blockers", rename_all = "snake_case")]
pub enum DeletionCheck {
    NotFound,
    Allowed,
    Blocked(Vec<DeletionBlocker>),
}

impl DeletionCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, DeletionCheck::Allowed)
    }

    /// Turn a non-allowed outcome into the matching error
    pub fn into_result(self, kind: EntityKind, id: &str) -> Result<(), StorageError> {
        match self {
            DeletionCheck::Allowed => Ok(()),
            DeletionCheck::NotFound => Err(StorageError::not_found(kind, id)),
            DeletionCheck::Blocked(blockers) => Err(StorageError::DependencyBlocked {
                kind,
                id: id.to_string(),
                blockers,
            }),
        }
    }

    fn from_blockers(blockers: Vec<DeletionBlocker>) -> Self {
        if blockers.is_empty() {
            DeletionCheck::Allowed
        } else {
            DeletionCheck::Blocked(blockers)
        }
    }
}

fn blocker(dependency: DependencyKind, count: u64) -> Option<DeletionBlocker> {
    (count > 0).then_some(DeletionBlocker { dependency, count })
}

/// Check whether an entity may be deleted.
///
/// Categories report courses, child categories and subcategories as separate
/// blockers. Subcategories are blocked only by courses. Courses are blocked
/// while modules or lessons of other courses list them as a prerequisite.
/// Other kinds have no restricting references.
pub fn can_delete(conn: &Connection, kind: EntityKind, id: &str) -> Result<DeletionCheck, StorageError> {
    match kind {
        EntityKind::Category => {
            if !categories::category_exists(conn, id)? {
                return Ok(DeletionCheck::NotFound);
            }
            let deps = categories::count_dependents(conn, id)?;
            let blockers = [
                blocker(DependencyKind::Courses, deps.courses),
                blocker(DependencyKind::ChildCategories, deps.children),
                blocker(DependencyKind::Subcategories, deps.subcategories),
            ]
            .into_iter()
            .flatten()
            .collect();
            Ok(DeletionCheck::from_blockers(blockers))
        }
        EntityKind::Subcategory => {
            if subcategories::get_subcategory(conn, id)?.is_none() {
                return Ok(DeletionCheck::NotFound);
            }
            let courses = subcategories::count_courses(conn, id)?;
            Ok(DeletionCheck::from_blockers(
                blocker(DependencyKind::Courses, courses).into_iter().collect(),
            ))
        }
        EntityKind::Course => {
            if courses::get_course(conn, id)?.is_none() {
                return Ok(DeletionCheck::NotFound);
            }
            let refs = courses::count_prerequisite_refs(conn, id)?;
            let blockers = [
                blocker(DependencyKind::PrerequisiteModules, refs.modules),
                blocker(DependencyKind::PrerequisiteLessons, refs.lessons),
            ]
            .into_iter()
            .flatten()
            .collect();
            Ok(DeletionCheck::from_blockers(blockers))
        }
        other => Err(StorageError::InvalidInput(format!(
            "deletion checks are not defined for {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO categories (id, name, slug) VALUES ('root', 'Root', 'root');
            INSERT INTO categories (id, name, slug, parent_id) VALUES ('leaf', 'Leaf', 'leaf', 'root');
            INSERT INTO subcategories (id, name, slug, category_id) VALUES ('sub', 'Sub', 'sub', 'root');
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_missing_entity() {
        let conn = setup();
        assert_eq!(can_delete(&conn, EntityKind::Category, "nope").unwrap(), DeletionCheck::NotFound);
        assert_eq!(can_delete(&conn, EntityKind::Subcategory, "nope").unwrap(), DeletionCheck::NotFound);
    }

    #[test]
    fn test_each_category_blocker_reported() {
        let conn = setup();
        conn.execute(
            "INSERT INTO courses (id, title, slug, category_id) VALUES ('c1', 'C1', 'c1', 'root')",
            [],
        )
        .unwrap();

        let check = can_delete(&conn, EntityKind::Category, "root").unwrap();
        assert_eq!(
            check,
            DeletionCheck::Blocked(vec![
                DeletionBlocker { dependency: DependencyKind::Courses, count: 1 },
                DeletionBlocker { dependency: DependencyKind::ChildCategories, count: 1 },
                DeletionBlocker { dependency: DependencyKind::Subcategories, count: 1 },
            ])
        );
        assert!(can_delete(&conn, EntityKind::Category, "leaf").unwrap().is_allowed());
    }

    #[test]
    fn test_subcategory_blocked_by_courses_only() {
        let conn = setup();
        assert!(can_delete(&conn, EntityKind::Subcategory, "sub").unwrap().is_allowed());

        conn.execute(
            "INSERT INTO courses (id, title, slug, subcategory_id) VALUES ('c1', 'C1', 'c1', 'sub')",
            [],
        )
        .unwrap();
        let err = can_delete(&conn, EntityKind::Subcategory, "sub")
            .unwrap()
            .into_result(EntityKind::Subcategory, "sub")
            .unwrap_err();
        assert!(err.to_string().contains("1 courses"));
    }

    #[test]
    fn test_course_blocked_by_prerequisite_gates_elsewhere() {
        let conn = setup();
        conn.execute_batch(
            r#"
            INSERT INTO courses (id, title, slug) VALUES ('intro', 'Intro', 'intro');
            INSERT INTO courses (id, title, slug) VALUES ('advanced', 'Advanced', 'advanced');
            INSERT INTO courses (id, title, slug) VALUES ('intro-2', 'Intro 2', 'intro-2');
            INSERT INTO modules (id, course_id, title, unlock_criteria)
                VALUES ('self', 'intro', 'Self', '{"type":"prerequisite","courseIds":["intro"]}');
            INSERT INTO modules (id, course_id, title, unlock_criteria)
                VALUES ('m1', 'advanced', 'M1', '{"type":"prerequisite","courseIds":["intro"]}');
            INSERT INTO modules (id, course_id, title, unlock_criteria)
                VALUES ('m2', 'advanced', 'M2', '{"type":"prerequisite","courseIds":["intro-2"]}');
            INSERT INTO lessons (id, module_id, title, unlock_criteria)
                VALUES ('l1', 'm2', 'L1', '{"type":"prerequisite","courseIds":["intro-2","intro"]}');
            INSERT INTO lessons (id, module_id, title, unlock_criteria)
                VALUES ('l2', 'm2', 'L2', '{"type":"prerequisite","courseIds":["intro"');
            "#,
        )
        .unwrap();

        assert_eq!(
            can_delete(&conn, EntityKind::Course, "intro").unwrap(),
            DeletionCheck::Blocked(vec![
                DeletionBlocker { dependency: DependencyKind::PrerequisiteModules, count: 1 },
                DeletionBlocker { dependency: DependencyKind::PrerequisiteLessons, count: 1 },
            ])
        );
        // Gates inside the course itself go with it
        conn.execute("DELETE FROM modules WHERE id = 'm1'", []).unwrap();
        conn.execute("DELETE FROM lessons WHERE id = 'l1'", []).unwrap();
        assert!(can_delete(&conn, EntityKind::Course, "intro").unwrap().is_allowed());

        assert!(can_delete(&conn, EntityKind::Course, "advanced").unwrap().is_allowed());
        assert_eq!(can_delete(&conn, EntityKind::Course, "nope").unwrap(), DeletionCheck::NotFound);
    }

    #[test]
    fn test_check_is_read_only() {
        let conn = setup();
        let before = can_delete(&conn, EntityKind::Category, "root").unwrap();
        let after = can_delete(&conn, EntityKind::Category, "root").unwrap();
        assert_eq!(before, after);
    }
}
