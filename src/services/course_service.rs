//! Course service - catalog entries with ordered modules and lessons
//!
//! Courses attach to the hierarchy through `category_id`/`subcategory_id`.
//! Modules and lessons carry unlock criteria; those are typed on input so
//! nothing malformed is ever written.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{
    categories, courses, subcategories, AcademyDb, CourseInput, CourseQuery, CourseRow, LessonInput,
    LessonRow, ModuleInput, ModuleRow,
};
use crate::error::{ConflictKind, EntityKind, StorageError};
use crate::unlock::UnlockCriteria;

use super::deletion::{self, DeletionCheck};
use super::events::{EventBus, StorageEvent};
use super::validation::{ensure_slug_free, map_write_conflict, optional_text, required_text, resolve_slug, MAX_NAME_LEN};

/// Module with its lessons in display order
#[derive(Debug, Clone, Serialize)]
pub struct ModuleOutline {
    #[serde(flatten)]
    pub module: ModuleRow,
    pub lessons: Vec<LessonRow>,
}

/// Course with its full module/lesson structure
#[derive(Debug, Clone, Serialize)]
pub struct CourseOutline {
    #[serde(flatten)]
    pub course: CourseRow,
    pub modules: Vec<ModuleOutline>,
}

pub struct CourseService {
    db: Arc<AcademyDb>,
    events: Arc<EventBus>,
}

impl CourseService {
    pub fn new(db: Arc<AcademyDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Courses
    // =========================================================================

    pub fn get(&self, id: &str) -> Result<Option<CourseRow>, StorageError> {
        self.db.with_conn(|conn| courses::get_course(conn, id))
    }

    pub fn list(&self, query: &CourseQuery) -> Result<Vec<CourseRow>, StorageError> {
        self.db.with_conn(|conn| courses::list_courses(conn, query))
    }

    /// Course with modules and lessons
    pub fn outline(&self, id: &str) -> Result<CourseOutline, StorageError> {
        self.db.with_conn(|conn| {
            let course = courses::get_course(conn, id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Course, id))?;

            let modules = courses::list_modules(conn, id)?
                .into_iter()
                .map(|module| {
                    let lessons = courses::list_lessons(conn, &module.id)?;
                    Ok(ModuleOutline { module, lessons })
                })
                .collect::<Result<Vec<_>, StorageError>>()?;

            Ok(CourseOutline { course, modules })
        })
    }

    pub fn create(&self, input: CourseInput) -> Result<CourseRow, StorageError> {
        let (input, slug) = normalize_course(input)?;
        let id = input
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let row = self.db.with_transaction(|tx| {
            if courses::get_course(tx, &id)?.is_some() {
                return Err(StorageError::Conflict(ConflictKind::DuplicateId {
                    kind: EntityKind::Course,
                    id: id.clone(),
                }));
            }
            ensure_slug_free(tx, EntityKind::Course, &slug, None)?;
            check_placement(tx, input.category_id.as_deref(), input.subcategory_id.as_deref())?;

            courses::insert_course(tx, &id, &slug, &input)
                .map_err(|e| map_write_conflict(tx, EntityKind::Course, &id, &slug, e))?;

            courses::get_course(tx, &id)?
                .ok_or_else(|| StorageError::Internal(format!("course {} missing after insert", id)))
        })?;

        info!(id = %row.id, slug = %row.slug, "Created course");
        self.events.emit(StorageEvent::CourseCreated {
            id: row.id.clone(),
            title: row.title.clone(),
        });

        Ok(row)
    }

    /// Replace a course's fields. Slug and placement are checked again against
    /// the new values.
    pub fn update(&self, id: &str, input: CourseInput) -> Result<CourseRow, StorageError> {
        let (input, slug) = normalize_course(input)?;

        let row = self.db.with_transaction(|tx| {
            if courses::get_course(tx, id)?.is_none() {
                return Err(StorageError::not_found(EntityKind::Course, id));
            }
            ensure_slug_free(tx, EntityKind::Course, &slug, Some(id))?;
            check_placement(tx, input.category_id.as_deref(), input.subcategory_id.as_deref())?;

            courses::update_course(tx, id, &slug, &input)
                .map_err(|e| map_write_conflict(tx, EntityKind::Course, id, &slug, e))?;

            courses::get_course(tx, id)?
                .ok_or_else(|| StorageError::Internal(format!("course {} missing after update", id)))
        })?;

        info!(id = %id, slug = %row.slug, "Updated course");
        self.events.emit(StorageEvent::CourseUpdated { id: id.to_string() });
        Ok(row)
    }

    pub fn can_delete(&self, id: &str) -> Result<DeletionCheck, StorageError> {
        self.db
            .with_conn(|conn| deletion::can_delete(conn, EntityKind::Course, id))
    }

    /// Delete a course with its modules and lessons. Refused while content in
    /// other courses still lists it as a prerequisite.
    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.db.with_transaction(|tx| {
            deletion::can_delete(tx, EntityKind::Course, id)?.into_result(EntityKind::Course, id)?;
            courses::delete_course(tx, id)?;
            Ok(())
        })?;

        info!(id = %id, "Deleted course");
        self.events.emit(StorageEvent::CourseDeleted { id: id.to_string() });
        Ok(())
    }

    // =========================================================================
    // Modules
    // =========================================================================

    pub fn create_module(&self, course_id: &str, input: ModuleInput) -> Result<ModuleRow, StorageError> {
        let title = required_text("title", &input.title, MAX_NAME_LEN)?;
        let input = ModuleInput {
            id: optional_text("id", &input.id, MAX_NAME_LEN)?,
            description: optional_text("description", &input.description, usize::MAX)?,
            title,
            ..input
        };
        let id = input
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let row = self.db.with_transaction(|tx| {
            if courses::get_course(tx, course_id)?.is_none() {
                return Err(StorageError::not_found(EntityKind::Course, course_id));
            }
            if courses::get_module(tx, &id)?.is_some() {
                return Err(StorageError::Conflict(ConflictKind::DuplicateId {
                    kind: EntityKind::Module,
                    id: id.clone(),
                }));
            }
            if let Some(ref criteria) = input.unlock_criteria {
                check_criteria_refs(tx, criteria)?;
            }

            let sort_order = match input.sort_order {
                Some(order) => order,
                None => courses::next_module_order(tx, course_id)?,
            };
            courses::insert_module(tx, &id, course_id, sort_order, &input)?;

            courses::get_module(tx, &id)?
                .ok_or_else(|| StorageError::Internal(format!("module {} missing after insert", id)))
        })?;

        debug!(id = %row.id, course = %course_id, "Created module");
        self.events.emit(StorageEvent::ModuleCreated {
            id: row.id.clone(),
            course_id: course_id.to_string(),
        });

        Ok(row)
    }

    /// Replace a module's unlock criteria; `None` removes the gate
    pub fn set_module_criteria(
        &self,
        module_id: &str,
        criteria: Option<UnlockCriteria>,
    ) -> Result<ModuleRow, StorageError> {
        self.db.with_transaction(|tx| {
            if let Some(ref criteria) = criteria {
                check_criteria_refs(tx, criteria)?;
            }
            if !courses::set_module_criteria(tx, module_id, &criteria)? {
                return Err(StorageError::not_found(EntityKind::Module, module_id));
            }
            debug!(
                module = %module_id,
                criteria = criteria.as_ref().map_or("none", UnlockCriteria::type_name),
                "Set module criteria"
            );
            courses::get_module(tx, module_id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Module, module_id))
        })
    }

    /// Replace a module's title, description and criteria. The position is
    /// kept unless `sort_order` is given.
    pub fn update_module(&self, module_id: &str, input: ModuleInput) -> Result<ModuleRow, StorageError> {
        let input = ModuleInput {
            title: required_text("title", &input.title, MAX_NAME_LEN)?,
            description: optional_text("description", &input.description, usize::MAX)?,
            ..input
        };

        let row = self.db.with_transaction(|tx| {
            let existing = courses::get_module(tx, module_id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Module, module_id))?;
            if let Some(ref criteria) = input.unlock_criteria {
                check_criteria_refs(tx, criteria)?;
            }

            let sort_order = input.sort_order.unwrap_or(existing.sort_order);
            courses::update_module(tx, module_id, sort_order, &input)?;

            courses::get_module(tx, module_id)?
                .ok_or_else(|| StorageError::Internal(format!("module {} missing after update", module_id)))
        })?;

        debug!(id = %module_id, "Updated module");
        self.events.emit(StorageEvent::ModuleUpdated { id: module_id.to_string() });
        Ok(row)
    }

    pub fn delete_module(&self, module_id: &str) -> Result<(), StorageError> {
        let deleted = self.db.with_conn(|conn| courses::delete_module(conn, module_id))?;
        if !deleted {
            return Err(StorageError::not_found(EntityKind::Module, module_id));
        }
        debug!(id = %module_id, "Deleted module");
        Ok(())
    }

    /// Put a course's modules in the given order.
    ///
    /// `ordered_ids` must name every module of the course exactly once.
    pub fn reorder_modules(&self, course_id: &str, ordered_ids: &[String]) -> Result<Vec<ModuleRow>, StorageError> {
        let modules = self.db.with_transaction(|tx| {
            if courses::get_course(tx, course_id)?.is_none() {
                return Err(StorageError::not_found(EntityKind::Course, course_id));
            }
            let existing: Vec<String> = courses::list_modules(tx, course_id)?
                .into_iter()
                .map(|m| m.id)
                .collect();
            ensure_permutation("module", &existing, ordered_ids)?;

            courses::set_module_order(tx, ordered_ids)?;
            courses::list_modules(tx, course_id)
        })?;

        self.events.emit(StorageEvent::ModulesReordered {
            course_id: course_id.to_string(),
        });
        Ok(modules)
    }

    // =========================================================================
    // Lessons
    // =========================================================================

    pub fn create_lesson(&self, module_id: &str, input: LessonInput) -> Result<LessonRow, StorageError> {
        let input = normalize_lesson(input)?;
        let id = input
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let row = self.db.with_transaction(|tx| {
            if courses::get_module(tx, module_id)?.is_none() {
                return Err(StorageError::not_found(EntityKind::Module, module_id));
            }
            if courses::get_lesson(tx, &id)?.is_some() {
                return Err(StorageError::Conflict(ConflictKind::DuplicateId {
                    kind: EntityKind::Lesson,
                    id: id.clone(),
                }));
            }
            if let Some(ref criteria) = input.unlock_criteria {
                check_criteria_refs(tx, criteria)?;
            }

            let sort_order = match input.sort_order {
                Some(order) => order,
                None => courses::next_lesson_order(tx, module_id)?,
            };
            courses::insert_lesson(tx, &id, module_id, sort_order, &input)?;

            courses::get_lesson(tx, &id)?
                .ok_or_else(|| StorageError::Internal(format!("lesson {} missing after insert", id)))
        })?;

        debug!(id = %row.id, module = %module_id, "Created lesson");
        self.events.emit(StorageEvent::LessonCreated {
            id: row.id.clone(),
            module_id: module_id.to_string(),
        });

        Ok(row)
    }

    pub fn set_lesson_criteria(
        &self,
        lesson_id: &str,
        criteria: Option<UnlockCriteria>,
    ) -> Result<LessonRow, StorageError> {
        self.db.with_transaction(|tx| {
            if let Some(ref criteria) = criteria {
                check_criteria_refs(tx, criteria)?;
            }
            if !courses::set_lesson_criteria(tx, lesson_id, &criteria)? {
                return Err(StorageError::not_found(EntityKind::Lesson, lesson_id));
            }
            debug!(
                lesson = %lesson_id,
                criteria = criteria.as_ref().map_or("none", UnlockCriteria::type_name),
                "Set lesson criteria"
            );
            courses::get_lesson(tx, lesson_id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Lesson, lesson_id))
        })
    }

    /// Replace a lesson's fields, criteria included
    pub fn update_lesson(&self, lesson_id: &str, input: LessonInput) -> Result<LessonRow, StorageError> {
        let input = normalize_lesson(input)?;

        let row = self.db.with_transaction(|tx| {
            let existing = courses::get_lesson(tx, lesson_id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Lesson, lesson_id))?;
            if let Some(ref criteria) = input.unlock_criteria {
                check_criteria_refs(tx, criteria)?;
            }

            let sort_order = input.sort_order.unwrap_or(existing.sort_order);
            courses::update_lesson(tx, lesson_id, sort_order, &input)?;

            courses::get_lesson(tx, lesson_id)?
                .ok_or_else(|| StorageError::Internal(format!("lesson {} missing after update", lesson_id)))
        })?;

        debug!(id = %lesson_id, "Updated lesson");
        self.events.emit(StorageEvent::LessonUpdated { id: lesson_id.to_string() });
        Ok(row)
    }

    pub fn delete_lesson(&self, lesson_id: &str) -> Result<(), StorageError> {
        let deleted = self.db.with_conn(|conn| courses::delete_lesson(conn, lesson_id))?;
        if !deleted {
            return Err(StorageError::not_found(EntityKind::Lesson, lesson_id));
        }
        debug!(id = %lesson_id, "Deleted lesson");
        Ok(())
    }

    /// Put a module's lessons in the given order
    pub fn reorder_lessons(&self, module_id: &str, ordered_ids: &[String]) -> Result<Vec<LessonRow>, StorageError> {
        let lessons = self.db.with_transaction(|tx| {
            if courses::get_module(tx, module_id)?.is_none() {
                return Err(StorageError::not_found(EntityKind::Module, module_id));
            }
            let existing: Vec<String> = courses::list_lessons(tx, module_id)?
                .into_iter()
                .map(|l| l.id)
                .collect();
            ensure_permutation("lesson", &existing, ordered_ids)?;

            courses::set_lesson_order(tx, ordered_ids)?;
            courses::list_lessons(tx, module_id)
        })?;

        self.events.emit(StorageEvent::LessonsReordered {
            module_id: module_id.to_string(),
        });
        Ok(lessons)
    }
}

/// Trimmed course input plus the slug it will be stored under
fn normalize_course(input: CourseInput) -> Result<(CourseInput, String), StorageError> {
    let title = required_text("title", &input.title, MAX_NAME_LEN)?;
    let slug = resolve_slug(&input.slug, &title)?;
    if input.price_cents < 0 {
        return Err(StorageError::InvalidInput("price_cents must be >= 0".into()));
    }
    if input.xp_reward < 0 {
        return Err(StorageError::InvalidInput("xp_reward must be >= 0".into()));
    }

    let input = CourseInput {
        id: optional_text("id", &input.id, MAX_NAME_LEN)?,
        slug: Some(slug.clone()),
        description: optional_text("description", &input.description, usize::MAX)?,
        category_id: optional_text("category_id", &input.category_id, MAX_NAME_LEN)?,
        subcategory_id: optional_text("subcategory_id", &input.subcategory_id, MAX_NAME_LEN)?,
        title,
        ..input
    };
    Ok((input, slug))
}

fn normalize_lesson(input: LessonInput) -> Result<LessonInput, StorageError> {
    let title = required_text("title", &input.title, MAX_NAME_LEN)?;
    if input.xp_reward < 0 {
        return Err(StorageError::InvalidInput("xp_reward must be >= 0".into()));
    }
    if input.duration_minutes < 0 {
        return Err(StorageError::InvalidInput("duration_minutes must be >= 0".into()));
    }
    Ok(LessonInput {
        id: optional_text("id", &input.id, MAX_NAME_LEN)?,
        content: optional_text("content", &input.content, usize::MAX)?,
        title,
        ..input
    })
}

/// Category and subcategory must exist, and agree when both are given
fn check_placement(
    conn: &rusqlite::Connection,
    category_id: Option<&str>,
    subcategory_id: Option<&str>,
) -> Result<(), StorageError> {
    if let Some(category_id) = category_id {
        if !categories::category_exists(conn, category_id)? {
            return Err(StorageError::not_found(EntityKind::Category, category_id));
        }
    }

    if let Some(subcategory_id) = subcategory_id {
        let parent = subcategories::parent_category_of(conn, subcategory_id)?
            .ok_or_else(|| StorageError::not_found(EntityKind::Subcategory, subcategory_id))?;
        if let Some(category_id) = category_id {
            if parent != category_id {
                return Err(StorageError::InvalidInput(format!(
                    "subcategory '{}' belongs to category '{}', not '{}'",
                    subcategory_id, parent, category_id
                )));
            }
        }
    }

    Ok(())
}

/// Prerequisite criteria may only name courses that exist
fn check_criteria_refs(conn: &rusqlite::Connection, criteria: &UnlockCriteria) -> Result<(), StorageError> {
    if let UnlockCriteria::Prerequisite { course_ids } = criteria {
        for course_id in course_ids {
            if courses::get_course(conn, course_id)?.is_none() {
                return Err(StorageError::not_found(EntityKind::Course, course_id));
            }
        }
    }
    Ok(())
}

/// `proposed` must contain each id of `existing` exactly once
fn ensure_permutation(what: &str, existing: &[String], proposed: &[String]) -> Result<(), StorageError> {
    let mut seen = HashSet::with_capacity(proposed.len());
    for id in proposed {
        if !seen.insert(id.as_str()) {
            return Err(StorageError::InvalidInput(format!("{} '{}' listed more than once", what, id)));
        }
    }

    let current: HashSet<&str> = existing.iter().map(String::as_str).collect();
    if let Some(unknown) = proposed.iter().find(|id| !current.contains(id.as_str())) {
        return Err(StorageError::InvalidInput(format!("{} '{}' is not part of this parent", what, unknown)));
    }
    if let Some(missing) = existing.iter().find(|id| !seen.contains(id.as_str())) {
        return Err(StorageError::InvalidInput(format!("order is missing {} '{}'", what, missing)));
    }

    Ok(())
}
