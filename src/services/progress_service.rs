//! Progress service - learner access, completions and gamification
//!
//! Access is evaluated from current progress on every request and never
//! cached, so a completion or purchase is visible to the very next check.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::progress::{self, xp_reasons, BadgeInput, BadgeRow, StreakRow};
use crate::db::{courses, AcademyDb, LessonRow, ModuleRow};
use crate::error::{ConflictKind, EntityKind, StorageError};
use crate::unlock::{Access, CriteriaPolicy, LearnerState, LockReason, StoredCriteria};

use super::events::{EventBus, StorageEvent};
use super::validation::{ensure_slug_free, map_write_conflict, optional_text, required_text, resolve_slug, MAX_NAME_LEN};

/// Everything known about a learner's progress
#[derive(Debug, Clone, Serialize)]
pub struct LearnerProfile {
    pub learner_id: String,
    #[serde(flatten)]
    pub state: LearnerState,
    pub streak: StreakRow,
    pub badges: Vec<BadgeRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LessonAccess {
    pub lesson_id: String,
    pub title: String,
    pub completed: bool,
    pub access: Access,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleAccess {
    pub module_id: String,
    pub title: String,
    pub access: Access,
    pub lessons: Vec<LessonAccess>,
}

/// Per-learner view of a course with every module and lesson evaluated
#[derive(Debug, Clone, Serialize)]
pub struct CourseAccess {
    pub course_id: String,
    pub purchased: bool,
    pub completed: bool,
    pub modules: Vec<ModuleAccess>,
}

/// Result of completing a lesson
#[derive(Debug, Clone, Serialize)]
pub struct LessonCompletion {
    pub lesson_id: String,
    pub course_id: String,
    /// False when the lesson was already completed
    pub newly_completed: bool,
    pub xp_awarded: i64,
    pub course_completed: bool,
    pub total_xp: i64,
    pub streak: StreakRow,
    pub badges_awarded: Vec<BadgeRow>,
}

/// Result of completing a course directly
#[derive(Debug, Clone, Serialize)]
pub struct CourseCompletion {
    pub course_id: String,
    pub newly_completed: bool,
    pub xp_awarded: i64,
    pub total_xp: i64,
    pub badges_awarded: Vec<BadgeRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseRecord {
    pub learner_id: String,
    pub course_id: String,
    pub newly_recorded: bool,
}

pub struct ProgressService {
    db: Arc<AcademyDb>,
    events: Arc<EventBus>,
    policy: CriteriaPolicy,
    course_completion_bonus_xp: i64,
}

impl ProgressService {
    pub fn new(
        db: Arc<AcademyDb>,
        events: Arc<EventBus>,
        policy: CriteriaPolicy,
        course_completion_bonus_xp: i64,
    ) -> Self {
        Self {
            db,
            events,
            policy,
            course_completion_bonus_xp,
        }
    }

    pub fn policy(&self) -> CriteriaPolicy {
        self.policy
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Evaluate a descriptor against an explicit learner state. Unreadable
    /// descriptors are handled by the configured policy.
    pub fn evaluate(&self, criteria: &StoredCriteria, learner: &LearnerState, owning_course_id: &str) -> Access {
        self.policy.evaluate(criteria, learner, owning_course_id)
    }

    pub fn learner_state(&self, learner_id: &str) -> Result<LearnerState, StorageError> {
        let learner_id = learner_key(learner_id)?;
        self.db.with_conn(|conn| load_state(conn, &learner_id))
    }

    pub fn profile(&self, learner_id: &str) -> Result<LearnerProfile, StorageError> {
        let learner_id = learner_key(learner_id)?;
        self.db.with_conn(|conn| {
            Ok(LearnerProfile {
                state: load_state(conn, &learner_id)?,
                streak: progress::get_streak(conn, &learner_id)?,
                badges: progress::learner_badges(conn, &learner_id)?,
                learner_id: learner_id.clone(),
            })
        })
    }

    /// Evaluate every module and lesson of a course for one learner
    pub fn course_access(&self, learner_id: &str, course_id: &str) -> Result<CourseAccess, StorageError> {
        let learner_id = learner_key(learner_id)?;
        self.db.with_conn(|conn| {
            if courses::get_course(conn, course_id)?.is_none() {
                return Err(StorageError::not_found(EntityKind::Course, course_id));
            }

            let state = load_state(conn, &learner_id)?;
            let done = progress::completed_lessons_in_course(conn, &learner_id, course_id)?;

            let mut modules = Vec::new();
            for module in courses::list_modules(conn, course_id)? {
                let module_access = self.module_access(&module, &state);
                let lessons = courses::list_lessons(conn, &module.id)?
                    .into_iter()
                    .map(|lesson| LessonAccess {
                        access: self.lesson_access(&module_access, &lesson, &state, course_id),
                        completed: done.contains(&lesson.id),
                        lesson_id: lesson.id,
                        title: lesson.title,
                    })
                    .collect();

                modules.push(ModuleAccess {
                    module_id: module.id,
                    title: module.title,
                    access: module_access,
                    lessons,
                });
            }

            Ok(CourseAccess {
                course_id: course_id.to_string(),
                purchased: state.purchased_course_ids.contains(course_id),
                completed: state.completed_course_ids.contains(course_id),
                modules,
            })
        })
    }

    fn module_access(&self, module: &ModuleRow, state: &LearnerState) -> Access {
        let stored = StoredCriteria::parse(module.unlock_criteria.as_deref());
        self.policy.evaluate(&stored, state, &module.course_id)
    }

    /// A lesson is reachable only when its module is unlocked too
    fn lesson_access(&self, module_access: &Access, lesson: &LessonRow, state: &LearnerState, course_id: &str) -> Access {
        if !module_access.is_unlocked() {
            return Access::Locked(LockReason::ModuleLocked);
        }
        let stored = StoredCriteria::parse(lesson.unlock_criteria.as_deref());
        self.policy.evaluate(&stored, state, course_id)
    }

    // =========================================================================
    // Completions
    // =========================================================================

    pub fn complete_lesson(&self, learner_id: &str, lesson_id: &str) -> Result<LessonCompletion, StorageError> {
        self.complete_lesson_on(learner_id, lesson_id, Utc::now().date_naive())
    }

    /// Complete a lesson with activity dated `today`.
    ///
    /// Locked lessons are refused. Repeating a completion changes nothing.
    pub fn complete_lesson_on(
        &self,
        learner_id: &str,
        lesson_id: &str,
        today: NaiveDate,
    ) -> Result<LessonCompletion, StorageError> {
        let learner_id = learner_key(learner_id)?;

        let outcome = self.db.with_transaction(|tx| {
            let lesson = courses::get_lesson(tx, lesson_id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Lesson, lesson_id))?;
            let module = courses::get_module(tx, &lesson.module_id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Module, &lesson.module_id))?;
            let course_id = module.course_id.clone();

            let state = load_state(tx, &learner_id)?;
            let module_access = self.module_access(&module, &state);
            if let Access::Locked(reason) = self.lesson_access(&module_access, &lesson, &state, &course_id) {
                return Err(StorageError::Locked {
                    kind: EntityKind::Lesson,
                    id: lesson_id.to_string(),
                    reason,
                });
            }

            let newly_completed = progress::record_lesson_completion(tx, &learner_id, lesson_id)?;
            let mut xp_awarded = 0;
            let mut streak = progress::get_streak(tx, &learner_id)?;
            let mut course_completed = false;

            if newly_completed {
                if lesson.xp_reward > 0
                    && progress::award_xp(tx, &learner_id, lesson.xp_reward, xp_reasons::LESSON_COMPLETED, lesson_id)?
                {
                    xp_awarded += lesson.xp_reward;
                }

                streak = progress::advance_streak(&streak, today);
                progress::save_streak(tx, &streak)?;

                let total = courses::count_course_lessons(tx, &course_id)?;
                let done = progress::completed_lessons_in_course(tx, &learner_id, &course_id)?.len() as u64;
                if total > 0 && done >= total {
                    let (newly, xp) = self.finish_course(tx, &learner_id, &course_id)?;
                    course_completed = newly;
                    xp_awarded += xp;
                }
            }

            let total_xp = progress::total_xp(tx, &learner_id)?;
            let badges_awarded = progress::award_reached_badges(tx, &learner_id, total_xp)?;

            Ok(LessonCompletion {
                lesson_id: lesson_id.to_string(),
                course_id,
                newly_completed,
                xp_awarded,
                course_completed,
                total_xp,
                streak,
                badges_awarded,
            })
        })?;

        if outcome.newly_completed {
            debug!(learner = %learner_id, lesson = %lesson_id, xp = outcome.xp_awarded, "Lesson completed");
            self.events.emit(StorageEvent::LessonCompleted {
                learner_id: learner_id.clone(),
                lesson_id: lesson_id.to_string(),
                xp_awarded: outcome.xp_awarded,
            });
        }
        if outcome.course_completed {
            self.events.emit(StorageEvent::CourseCompleted {
                learner_id: learner_id.clone(),
                course_id: outcome.course_id.clone(),
            });
        }
        self.emit_badges(&learner_id, &outcome.badges_awarded);

        Ok(outcome)
    }

    /// Mark a course completed regardless of lesson progress
    pub fn complete_course(&self, learner_id: &str, course_id: &str) -> Result<CourseCompletion, StorageError> {
        let learner_id = learner_key(learner_id)?;

        let outcome = self.db.with_transaction(|tx| {
            if courses::get_course(tx, course_id)?.is_none() {
                return Err(StorageError::not_found(EntityKind::Course, course_id));
            }
            let (newly_completed, xp_awarded) = self.finish_course(tx, &learner_id, course_id)?;
            let total_xp = progress::total_xp(tx, &learner_id)?;
            let badges_awarded = progress::award_reached_badges(tx, &learner_id, total_xp)?;

            Ok(CourseCompletion {
                course_id: course_id.to_string(),
                newly_completed,
                xp_awarded,
                total_xp,
                badges_awarded,
            })
        })?;

        if outcome.newly_completed {
            self.events.emit(StorageEvent::CourseCompleted {
                learner_id: learner_id.clone(),
                course_id: course_id.to_string(),
            });
        }
        self.emit_badges(&learner_id, &outcome.badges_awarded);

        Ok(outcome)
    }

    /// Record the completion and pay out course XP once
    fn finish_course(&self, conn: &Connection, learner_id: &str, course_id: &str) -> Result<(bool, i64), StorageError> {
        if !progress::record_course_completion(conn, learner_id, course_id)? {
            return Ok((false, 0));
        }

        let reward = courses::get_course(conn, course_id)?
            .map(|c| c.xp_reward)
            .unwrap_or(0);

        let mut awarded = 0;
        if reward > 0 && progress::award_xp(conn, learner_id, reward, xp_reasons::COURSE_COMPLETED, course_id)? {
            awarded += reward;
        }
        let bonus = self.course_completion_bonus_xp;
        if bonus > 0
            && progress::award_xp(conn, learner_id, bonus, xp_reasons::COURSE_COMPLETION_BONUS, course_id)?
        {
            awarded += bonus;
        }

        info!(learner = %learner_id, course = %course_id, xp = awarded, "Course completed");
        Ok((true, awarded))
    }

    // =========================================================================
    // Purchases
    // =========================================================================

    pub fn record_purchase(&self, learner_id: &str, course_id: &str) -> Result<PurchaseRecord, StorageError> {
        let learner_id = learner_key(learner_id)?;

        let newly_recorded = self.db.with_transaction(|tx| {
            if courses::get_course(tx, course_id)?.is_none() {
                return Err(StorageError::not_found(EntityKind::Course, course_id));
            }
            progress::record_purchase(tx, &learner_id, course_id)
        })?;

        if newly_recorded {
            info!(learner = %learner_id, course = %course_id, "Purchase recorded");
            self.events.emit(StorageEvent::CoursePurchased {
                learner_id: learner_id.clone(),
                course_id: course_id.to_string(),
            });
        }

        Ok(PurchaseRecord {
            learner_id,
            course_id: course_id.to_string(),
            newly_recorded,
        })
    }

    // =========================================================================
    // Badges
    // =========================================================================

    pub fn list_badges(&self) -> Result<Vec<BadgeRow>, StorageError> {
        self.db.with_conn(progress::list_badges)
    }

    pub fn create_badge(&self, input: BadgeInput) -> Result<BadgeRow, StorageError> {
        let name = required_text("name", &input.name, MAX_NAME_LEN)?;
        let slug = resolve_slug(&input.slug, &name)?;
        if input.xp_threshold < 0 {
            return Err(StorageError::InvalidInput("xp_threshold must be >= 0".into()));
        }
        let input = BadgeInput {
            id: optional_text("id", &input.id, MAX_NAME_LEN)?,
            description: optional_text("description", &input.description, usize::MAX)?,
            slug: Some(slug.clone()),
            name,
            ..input
        };
        let id = input
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.db.with_transaction(|tx| {
            if progress::get_badge(tx, &id)?.is_some() {
                return Err(StorageError::Conflict(ConflictKind::DuplicateId {
                    kind: EntityKind::Badge,
                    id: id.clone(),
                }));
            }
            ensure_slug_free(tx, EntityKind::Badge, &slug, None)?;
            progress::insert_badge(tx, &id, &slug, &input)
                .map_err(|e| map_write_conflict(tx, EntityKind::Badge, &id, &slug, e))?;
            progress::get_badge(tx, &id)?
                .ok_or_else(|| StorageError::Internal(format!("badge {} missing after insert", id)))
        })
    }

    fn emit_badges(&self, learner_id: &str, badges: &[BadgeRow]) {
        for badge in badges {
            self.events.emit(StorageEvent::BadgeAwarded {
                learner_id: learner_id.to_string(),
                badge_id: badge.id.clone(),
            });
        }
    }
}

fn learner_key(learner_id: &str) -> Result<String, StorageError> {
    required_text("learner_id", learner_id, MAX_NAME_LEN)
}

fn load_state(conn: &Connection, learner_id: &str) -> Result<LearnerState, StorageError> {
    Ok(LearnerState {
        completed_course_ids: progress::completed_courses(conn, learner_id)?,
        total_xp: progress::total_xp(conn, learner_id)?,
        purchased_course_ids: progress::purchased_courses(conn, learner_id)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CourseInput, LessonInput, ModuleInput};
    use crate::services::CourseService;
    use crate::unlock::UnlockCriteria;

    struct Fixture {
        courses: CourseService,
        progress: ProgressService,
    }

    fn fixture_with(policy: CriteriaPolicy) -> Fixture {
        let db = Arc::new(AcademyDb::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new());
        Fixture {
            courses: CourseService::new(db.clone(), events.clone()),
            progress: ProgressService::new(db, events, policy, 25),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CriteriaPolicy::FailClosed)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    /// Course `id` with one module `{id}-m` holding the given lessons
    fn course_with_lessons(f: &Fixture, id: &str, lessons: &[(&str, i64)], criteria: Option<UnlockCriteria>) {
        f.courses
            .create(CourseInput {
                id: Some(id.into()),
                title: format!("Course {}", id),
                xp_reward: 100,
                ..Default::default()
            })
            .unwrap();
        let module_id = format!("{}-m", id);
        f.courses
            .create_module(
                id,
                ModuleInput {
                    id: Some(module_id.clone()),
                    title: "Module".into(),
                    unlock_criteria: criteria,
                    ..Default::default()
                },
            )
            .unwrap();
        for (lesson_id, xp) in lessons {
            f.courses
                .create_lesson(
                    &module_id,
                    LessonInput {
                        id: Some(lesson_id.to_string()),
                        title: lesson_id.to_string(),
                        xp_reward: *xp,
                        ..Default::default()
                    },
                )
                .unwrap();
        }
    }

    #[test]
    fn test_lesson_completion_is_idempotent() {
        let f = fixture();
        course_with_lessons(&f, "c1", &[("l1", 10), ("l2", 10)], None);

        let first = f.progress.complete_lesson_on("ann", "l1", day(1)).unwrap();
        assert!(first.newly_completed);
        assert_eq!(first.xp_awarded, 10);

        let again = f.progress.complete_lesson_on("ann", "l1", day(1)).unwrap();
        assert!(!again.newly_completed);
        assert_eq!(again.xp_awarded, 0);
        assert_eq!(again.total_xp, 10);
    }

    #[test]
    fn test_last_lesson_completes_course_and_pays_bonus() {
        let f = fixture();
        course_with_lessons(&f, "c1", &[("l1", 10), ("l2", 5)], None);

        f.progress.complete_lesson_on("ann", "l1", day(1)).unwrap();
        let last = f.progress.complete_lesson_on("ann", "l2", day(1)).unwrap();
        assert!(last.course_completed);
        // lesson 5 + course 100 + bonus 25
        assert_eq!(last.xp_awarded, 130);
        assert_eq!(last.total_xp, 140);

        let state = f.progress.learner_state("ann").unwrap();
        assert!(state.completed_course_ids.contains("c1"));
    }

    #[test]
    fn test_prerequisite_unlocks_after_completion() {
        let f = fixture();
        course_with_lessons(&f, "basics", &[("b1", 0)], None);
        course_with_lessons(
            &f,
            "advanced",
            &[("a1", 0)],
            Some(UnlockCriteria::Prerequisite { course_ids: vec!["basics".into()] }),
        );

        let before = f.progress.course_access("ann", "advanced").unwrap();
        assert!(!before.modules[0].access.is_unlocked());
        assert_eq!(before.modules[0].lessons[0].access, Access::Locked(LockReason::ModuleLocked));

        let err = f.progress.complete_lesson_on("ann", "a1", day(1)).unwrap_err();
        assert!(matches!(err, StorageError::Locked { kind: EntityKind::Lesson, .. }));

        f.progress.complete_lesson_on("ann", "b1", day(1)).unwrap();

        let after = f.progress.course_access("ann", "advanced").unwrap();
        assert!(after.modules[0].access.is_unlocked());
        assert!(after.modules[0].lessons[0].access.is_unlocked());
        f.progress.complete_lesson_on("ann", "a1", day(1)).unwrap();
    }

    #[test]
    fn test_purchase_gate_uses_owning_course() {
        let f = fixture();
        course_with_lessons(&f, "paid", &[("p1", 0)], Some(UnlockCriteria::Purchase { required: true }));

        assert!(!f.progress.course_access("ann", "paid").unwrap().modules[0].access.is_unlocked());

        let record = f.progress.record_purchase("ann", "paid").unwrap();
        assert!(record.newly_recorded);
        assert!(!f.progress.record_purchase("ann", "paid").unwrap().newly_recorded);

        let view = f.progress.course_access("ann", "paid").unwrap();
        assert!(view.purchased);
        assert!(view.modules[0].access.is_unlocked());
    }

    #[test]
    fn test_malformed_stored_criteria_follow_policy() {
        for (policy, unlocked) in [(CriteriaPolicy::FailClosed, false), (CriteriaPolicy::FailOpen, true)] {
            let f = fixture_with(policy);
            course_with_lessons(&f, "c1", &[("l1", 0)], None);
            f.progress
                .db
                .with_conn(|conn| {
                    conn.execute("UPDATE modules SET unlock_criteria = '{\"type\":\"bogus\"}'", [])?;
                    Ok(())
                })
                .unwrap();

            let view = f.progress.course_access("ann", "c1").unwrap();
            assert_eq!(view.modules[0].access.is_unlocked(), unlocked);
        }
    }

    #[test]
    fn test_explicit_evaluation_uses_policy() {
        let unknown = StoredCriteria::from_value(&serde_json::json!({"type": "quiz"}));
        let learner = LearnerState::default();

        let open = fixture_with(CriteriaPolicy::FailOpen);
        assert!(open.progress.evaluate(&unknown, &learner, "c").is_unlocked());

        let closed = fixture();
        assert_eq!(
            closed.progress.evaluate(&unknown, &learner, "c"),
            Access::Locked(LockReason::InvalidCriteria)
        );

        let xp = StoredCriteria::Valid(UnlockCriteria::Xp { min_xp: 5 });
        assert!(!closed.progress.evaluate(&xp, &learner, "c").is_unlocked());
    }

    #[test]
    fn test_streak_and_badges() {
        let f = fixture();
        course_with_lessons(&f, "c1", &[("l1", 30), ("l2", 30), ("l3", 30), ("l4", 30)], None);
        f.progress
            .create_badge(BadgeInput { name: "Rising Star".into(), xp_threshold: 50, ..Default::default() })
            .unwrap();

        let d1 = f.progress.complete_lesson_on("ann", "l1", day(1)).unwrap();
        assert_eq!(d1.streak.current_streak, 1);
        assert!(d1.badges_awarded.is_empty());

        let d2 = f.progress.complete_lesson_on("ann", "l2", day(2)).unwrap();
        assert_eq!(d2.streak.current_streak, 2);
        assert_eq!(d2.badges_awarded.len(), 1);
        assert_eq!(d2.badges_awarded[0].slug, "rising-star");

        // Gap resets the streak, longest is kept
        let d5 = f.progress.complete_lesson_on("ann", "l3", day(5)).unwrap();
        assert_eq!(d5.streak.current_streak, 1);
        assert_eq!(d5.streak.longest_streak, 2);
        assert!(d5.badges_awarded.is_empty());

        let profile = f.progress.profile("ann").unwrap();
        assert_eq!(profile.badges.len(), 1);
        assert_eq!(profile.state.total_xp, 90);
    }

    #[test]
    fn test_zero_lesson_course_never_auto_completes_but_can_be_completed() {
        let f = fixture();
        course_with_lessons(&f, "empty", &[], None);
        assert!(!f.progress.learner_state("ann").unwrap().completed_course_ids.contains("empty"));

        let done = f.progress.complete_course("ann", "empty").unwrap();
        assert!(done.newly_completed);
        assert_eq!(done.xp_awarded, 125);
        assert!(!f.progress.complete_course("ann", "empty").unwrap().newly_completed);
    }

    #[test]
    fn test_unknown_targets() {
        let f = fixture();
        assert!(matches!(
            f.progress.complete_lesson_on("ann", "ghost", day(1)).unwrap_err(),
            StorageError::NotFound { kind: EntityKind::Lesson, .. }
        ));
        assert!(matches!(
            f.progress.record_purchase("ann", "ghost").unwrap_err(),
            StorageError::NotFound { kind: EntityKind::Course, .. }
        ));
        assert!(matches!(f.progress.learner_state("  ").unwrap_err(), StorageError::InvalidInput(_)));
    }
}
