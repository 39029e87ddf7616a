//! Subcategory service
//!
//! Subcategories hang off exactly one category and carry no hierarchy of
//! their own, so there is no cycle guard here.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::db::slugs::{self, SlugAvailability};
use crate::db::{categories, courses, subcategories, AcademyDb, SubcategoryInput, SubcategoryQuery, SubcategoryRow};
use crate::error::{ConflictKind, EntityKind, StorageError};
use crate::slug::validate_slug;

use super::deletion::{self, DeletionCheck};
use super::events::{EventBus, StorageEvent};
use super::validation::{
    check_reserved_id, ensure_slug_free, map_write_conflict, optional_text, required_text,
    resolve_slug, MAX_META_DESCRIPTION_LEN, MAX_META_TITLE_LEN, MAX_NAME_LEN, SUBCATEGORY_RESERVED_IDS,
};

pub struct SubcategoryService {
    db: Arc<AcademyDb>,
    events: Arc<EventBus>,
}

impl SubcategoryService {
    pub fn new(db: Arc<AcademyDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, id: &str) -> Result<Option<SubcategoryRow>, StorageError> {
        self.db.with_conn(|conn| subcategories::get_subcategory(conn, id))
    }

    pub fn list(&self, query: &SubcategoryQuery) -> Result<Vec<SubcategoryRow>, StorageError> {
        self.db.with_conn(|conn| subcategories::list_subcategories(conn, query))
    }

    pub fn is_slug_available(&self, slug: &str, exclude_id: Option<&str>) -> Result<SlugAvailability, StorageError> {
        validate_slug(slug)?;
        self.db
            .with_conn(|conn| slugs::check_slug(conn, EntityKind::Subcategory, slug, exclude_id))
    }

    pub fn can_delete(&self, id: &str) -> Result<DeletionCheck, StorageError> {
        self.db
            .with_conn(|conn| deletion::can_delete(conn, EntityKind::Subcategory, id))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    pub fn create(&self, input: SubcategoryInput) -> Result<SubcategoryRow, StorageError> {
        let (input, slug) = self.normalize(input)?;
        let id = input
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let row = self.db.with_transaction(|tx| {
            if subcategories::get_subcategory(tx, &id)?.is_some() {
                return Err(StorageError::Conflict(ConflictKind::DuplicateId {
                    kind: EntityKind::Subcategory,
                    id: id.clone(),
                }));
            }
            ensure_slug_free(tx, EntityKind::Subcategory, &slug, None)?;
            if !categories::category_exists(tx, &input.category_id)? {
                return Err(StorageError::not_found(EntityKind::Category, &input.category_id));
            }

            subcategories::insert_subcategory(tx, &id, &slug, &input)
                .map_err(|e| map_write_conflict(tx, EntityKind::Subcategory, &id, &slug, e))?;

            subcategories::get_subcategory(tx, &id)?
                .ok_or_else(|| StorageError::Internal(format!("subcategory {} missing after insert", id)))
        })?;

        info!(id = %row.id, category = %row.category_id, "Created subcategory");
        self.events.emit(StorageEvent::SubcategoryCreated {
            id: row.id.clone(),
            category_id: row.category_id.clone(),
        });

        Ok(row)
    }

    /// Replace a subcategory's fields. Moving it to another category moves
    /// its courses along so their placement stays consistent.
    pub fn update(&self, id: &str, input: SubcategoryInput) -> Result<SubcategoryRow, StorageError> {
        let (input, slug) = self.normalize(input)?;

        let row = self.db.with_transaction(|tx| {
            let existing = subcategories::get_subcategory(tx, id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Subcategory, id))?;
            ensure_slug_free(tx, EntityKind::Subcategory, &slug, Some(id))?;
            if !categories::category_exists(tx, &input.category_id)? {
                return Err(StorageError::not_found(EntityKind::Category, &input.category_id));
            }

            subcategories::update_subcategory(tx, id, &slug, &input)
                .map_err(|e| map_write_conflict(tx, EntityKind::Subcategory, id, &slug, e))?;

            if existing.category_id != input.category_id {
                let moved = courses::reassign_subcategory_courses(tx, id, &input.category_id)?;
                debug!(id = %id, category = %input.category_id, courses = moved, "Moved subcategory");
            }

            subcategories::get_subcategory(tx, id)?
                .ok_or_else(|| StorageError::Internal(format!("subcategory {} missing after update", id)))
        })?;

        info!(id = %id, "Updated subcategory");
        self.events.emit(StorageEvent::SubcategoryUpdated { id: id.to_string() });
        Ok(row)
    }

    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.db.with_transaction(|tx| {
            deletion::can_delete(tx, EntityKind::Subcategory, id)?
                .into_result(EntityKind::Subcategory, id)?;
            subcategories::delete_subcategory(tx, id)?;
            Ok(())
        })?;

        info!(id = %id, "Deleted subcategory");
        self.events.emit(StorageEvent::SubcategoryDeleted { id: id.to_string() });
        Ok(())
    }

    fn normalize(&self, input: SubcategoryInput) -> Result<(SubcategoryInput, String), StorageError> {
        let name = required_text("name", &input.name, MAX_NAME_LEN)?;
        let slug = resolve_slug(&input.slug, &name)?;
        let category_id = required_text("category_id", &input.category_id, MAX_NAME_LEN)?;

        let id = optional_text("id", &input.id, MAX_NAME_LEN)?;
        check_reserved_id(id.as_deref(), SUBCATEGORY_RESERVED_IDS)?;

        let normalized = SubcategoryInput {
            id,
            slug: Some(slug.clone()),
            description: optional_text("description", &input.description, usize::MAX)?,
            icon: optional_text("icon", &input.icon, MAX_NAME_LEN)?,
            color: optional_text("color", &input.color, MAX_NAME_LEN)?,
            image: optional_text("image", &input.image, usize::MAX)?,
            meta_title: optional_text("meta_title", &input.meta_title, MAX_META_TITLE_LEN)?,
            meta_description: optional_text(
                "meta_description",
                &input.meta_description,
                MAX_META_DESCRIPTION_LEN,
            )?,
            name,
            category_id,
            ..input
        };

        Ok((normalized, slug))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CategoryInput, CourseInput};
    use crate::services::{CategoryService, CourseService};

    fn services() -> (CategoryService, SubcategoryService) {
        let db = Arc::new(AcademyDb::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let cats = CategoryService::new(db.clone(), events.clone());
        cats.create(CategoryInput {
            id: Some("cat".into()),
            name: "Programming".into(),
            is_active: true,
            ..Default::default()
        })
        .unwrap();
        (cats, SubcategoryService::new(db, events))
    }

    fn input(id: &str, name: &str) -> SubcategoryInput {
        SubcategoryInput {
            id: Some(id.into()),
            name: name.into(),
            category_id: "cat".into(),
            is_active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_requires_existing_category() {
        let (_, svc) = services();
        let mut orphan = input("s1", "Rust");
        orphan.category_id = "ghost".into();
        let err = svc.create(orphan).unwrap_err();
        assert!(matches!(err, StorageError::NotFound { kind: EntityKind::Category, .. }));

        let row = svc.create(input("s1", "Rust")).unwrap();
        assert_eq!(row.slug, "rust");
    }

    #[test]
    fn test_slug_scoped_to_subcategories() {
        let (_, svc) = services();
        // "programming" is a category slug, not a subcategory one
        assert!(svc.is_slug_available("programming", None).unwrap().available);

        svc.create(input("s1", "Rust")).unwrap();
        assert!(svc.is_slug_available("rust", Some("s1")).unwrap().available);

        let err = svc.create(input("s2", "Rust")).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(ConflictKind::SlugTaken { .. })));
    }

    #[test]
    fn test_category_blocked_by_subcategory_until_removed() {
        let (cats, svc) = services();
        svc.create(input("s1", "Rust")).unwrap();

        assert!(cats.delete("cat").is_err());
        svc.delete("s1").unwrap();
        cats.delete("cat").unwrap();
    }

    #[test]
    fn test_moving_subcategory_moves_its_courses() {
        let (cats, svc) = services();
        cats.create(CategoryInput {
            id: Some("data".into()),
            name: "Data".into(),
            is_active: true,
            ..Default::default()
        })
        .unwrap();
        svc.create(input("rust", "Rust")).unwrap();
        let courses = CourseService::new(svc.db.clone(), svc.events.clone());
        courses
            .create(CourseInput {
                id: Some("c1".into()),
                title: "Rust 101".into(),
                category_id: Some("cat".into()),
                subcategory_id: Some("rust".into()),
                ..Default::default()
            })
            .unwrap();

        let mut moved = input("rust", "Rust");
        moved.category_id = "data".into();
        assert_eq!(svc.update("rust", moved).unwrap().category_id, "data");

        let course = courses.get("c1").unwrap().unwrap();
        assert_eq!(course.category_id.as_deref(), Some("data"));
        // The old category no longer pins anything
        cats.delete("cat").unwrap();
    }

    #[test]
    fn test_update_renames() {
        let (_, svc) = services();
        svc.create(input("s1", "Rust")).unwrap();
        let row = svc.update("s1", input("s1", "Rust Advanced")).unwrap();
        assert_eq!(row.slug, "rust-advanced");
        assert!(matches!(
            svc.update("missing", input("missing", "X")).unwrap_err(),
            StorageError::NotFound { .. }
        ));
    }
}
