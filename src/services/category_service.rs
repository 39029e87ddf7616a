//! Category service - business logic for the category hierarchy
//!
//! Every mutation runs its checks and its write in one immediate transaction.
//! Update checks run in a fixed order and stop at the first failure:
//! slug uniqueness, self reference, parent existence, cycle guard.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::slugs::{self, SlugAvailability};
use crate::db::{categories, AcademyDb, CategoryInput, CategoryQuery, CategoryRow};
use crate::error::{ConflictKind, EntityKind, StorageError};
use crate::hierarchy::TreeNode;
use crate::slug::validate_slug;

use super::deletion::{self, DeletionCheck};
use super::events::{EventBus, StorageEvent};
use super::validation::{
    check_reserved_id, ensure_slug_free, map_write_conflict, optional_text, required_text,
    resolve_slug, CATEGORY_RESERVED_IDS, MAX_META_DESCRIPTION_LEN, MAX_META_TITLE_LEN, MAX_NAME_LEN,
};

/// Compact category data carried by tree nodes
#[derive(Debug, Clone, Default, Serialize)]
pub struct CategorySummary {
    pub name: String,
    pub slug: String,
    pub is_active: bool,
    pub is_featured: bool,
    pub sort_order: i32,
    pub course_count: u64,
}

impl From<&CategoryRow> for CategorySummary {
    fn from(row: &CategoryRow) -> Self {
        Self {
            name: row.name.clone(),
            slug: row.slug.clone(),
            is_active: row.is_active,
            is_featured: row.is_featured,
            sort_order: row.sort_order,
            course_count: row.course_count,
        }
    }
}

/// Category service for business logic
pub struct CategoryService {
    db: Arc<AcademyDb>,
    events: Arc<EventBus>,
}

impl CategoryService {
    pub fn new(db: Arc<AcademyDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, id: &str) -> Result<Option<CategoryRow>, StorageError> {
        self.db.with_conn(|conn| categories::get_category(conn, id))
    }

    pub fn get_by_slug(&self, slug: &str) -> Result<Option<CategoryRow>, StorageError> {
        self.db.with_conn(|conn| categories::get_category_by_slug(conn, slug))
    }

    pub fn list(&self, query: &CategoryQuery) -> Result<Vec<CategoryRow>, StorageError> {
        self.db.with_conn(|conn| categories::list_categories(conn, query))
    }

    /// Whole hierarchy as nested nodes, roots and siblings in display order
    pub fn tree(&self) -> Result<Vec<TreeNode<CategorySummary>>, StorageError> {
        self.db.with_conn(|conn| {
            let tree = categories::load_tree(conn)?;
            let rows: HashMap<String, CategoryRow> = categories::list_categories(
                conn,
                &CategoryQuery { limit: u32::MAX, ..Default::default() },
            )?
            .into_iter()
            .map(|row| (row.id.clone(), row))
            .collect();

            Ok(tree.to_nodes(|id| rows.get(id).map(CategorySummary::from).unwrap_or_default()))
        })
    }

    /// Ancestors of a category ordered root first, ending with the category
    pub fn breadcrumb(&self, id: &str) -> Result<Vec<CategoryRow>, StorageError> {
        self.db.with_conn(|conn| {
            let tree = categories::load_tree(conn)?;
            if !tree.contains(id) {
                return Err(StorageError::not_found(EntityKind::Category, id));
            }

            let mut chain = tree.ancestors(id);
            chain.reverse();
            chain.push(id.to_string());

            let mut rows = Vec::with_capacity(chain.len());
            for ancestor in &chain {
                if let Some(row) = categories::get_category(conn, ancestor)? {
                    rows.push(row);
                }
            }
            Ok(rows)
        })
    }

    /// True if `proposed_parent_id` is `category_id` or one of its descendants
    pub fn would_create_cycle(&self, category_id: &str, proposed_parent_id: &str) -> Result<bool, StorageError> {
        if category_id == proposed_parent_id {
            return Ok(true);
        }
        let tree = self.db.with_conn(categories::load_tree)?;
        Ok(tree.would_create_cycle(category_id, proposed_parent_id))
    }

    /// Check slug format, then whether another category holds it
    pub fn is_slug_available(&self, slug: &str, exclude_id: Option<&str>) -> Result<SlugAvailability, StorageError> {
        validate_slug(slug)?;
        self.db
            .with_conn(|conn| slugs::check_slug(conn, EntityKind::Category, slug, exclude_id))
    }

    pub fn can_delete(&self, id: &str) -> Result<DeletionCheck, StorageError> {
        self.db
            .with_conn(|conn| deletion::can_delete(conn, EntityKind::Category, id))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Create a category. The cycle guard is not needed: a new row has no
    /// descendants.
    pub fn create(&self, input: CategoryInput) -> Result<CategoryRow, StorageError> {
        let (input, slug) = self.normalize(input)?;
        let id = input
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let row = self.db.with_transaction(|tx| {
            if categories::category_exists(tx, &id)? {
                return Err(StorageError::Conflict(ConflictKind::DuplicateId {
                    kind: EntityKind::Category,
                    id: id.clone(),
                }));
            }

            ensure_slug_free(tx, EntityKind::Category, &slug, None)?;

            if let Some(parent_id) = input.parent_id.as_deref() {
                if parent_id == id {
                    return Err(StorageError::Conflict(ConflictKind::SelfParent { id: id.clone() }));
                }
                if !categories::category_exists(tx, parent_id)? {
                    return Err(StorageError::not_found(EntityKind::Category, parent_id));
                }
            }

            categories::insert_category(tx, &id, &slug, &input)
                .map_err(|e| map_write_conflict(tx, EntityKind::Category, &id, &slug, e))?;

            categories::get_category(tx, &id)?
                .ok_or_else(|| StorageError::Internal(format!("category {} missing after insert", id)))
        })?;

        info!(id = %row.id, slug = %row.slug, parent = ?row.parent_id, "Created category");
        self.events.emit(StorageEvent::CategoryCreated {
            id: row.id.clone(),
            slug: row.slug.clone(),
            parent_id: row.parent_id.clone(),
        });

        Ok(row)
    }

    /// Replace a category's editable fields, possibly moving it in the tree
    pub fn update(&self, id: &str, input: CategoryInput) -> Result<CategoryRow, StorageError> {
        let (input, slug) = self.normalize(input)?;

        let (row, parent_changed) = self.db.with_transaction(|tx| {
            let existing = categories::get_category(tx, id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Category, id))?;

            ensure_slug_free(tx, EntityKind::Category, &slug, Some(id))?;

            let parent_changed = existing.parent_id != input.parent_id;

            if let Some(parent_id) = input.parent_id.as_deref() {
                if parent_id == id {
                    return Err(StorageError::Conflict(ConflictKind::SelfParent { id: id.to_string() }));
                }
                if !categories::category_exists(tx, parent_id)? {
                    return Err(StorageError::not_found(EntityKind::Category, parent_id));
                }
                if parent_changed {
                    let tree = categories::load_tree(tx)?;
                    if tree.would_create_cycle(id, parent_id) {
                        debug!(id = %id, parent = %parent_id, "Rejected reparent: cycle");
                        return Err(StorageError::Conflict(ConflictKind::CyclicParent {
                            id: id.to_string(),
                            parent_id: parent_id.to_string(),
                        }));
                    }
                }
            }

            categories::update_category(tx, id, &slug, &input)
                .map_err(|e| map_write_conflict(tx, EntityKind::Category, id, &slug, e))?;

            let row = categories::get_category(tx, id)?
                .ok_or_else(|| StorageError::Internal(format!("category {} missing after update", id)))?;
            Ok((row, parent_changed))
        })?;

        info!(id = %id, slug = %row.slug, parent_changed, "Updated category");
        self.events.emit(StorageEvent::CategoryUpdated {
            id: id.to_string(),
            parent_changed,
        });

        Ok(row)
    }

    /// Delete a category that nothing references
    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.db.with_transaction(|tx| {
            deletion::can_delete(tx, EntityKind::Category, id)?
                .into_result(EntityKind::Category, id)?;
            categories::delete_category(tx, id)?;
            Ok(())
        })?;

        info!(id = %id, "Deleted category");
        self.events.emit(StorageEvent::CategoryDeleted { id: id.to_string() });
        Ok(())
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn normalize(&self, input: CategoryInput) -> Result<(CategoryInput, String), StorageError> {
        let name = required_text("name", &input.name, MAX_NAME_LEN)?;
        let slug = resolve_slug(&input.slug, &name)?;

        let id = optional_text("id", &input.id, MAX_NAME_LEN)?;
        check_reserved_id(id.as_deref(), CATEGORY_RESERVED_IDS)?;

        let normalized = CategoryInput {
            id,
            slug: Some(slug.clone()),
            description: optional_text("description", &input.description, usize::MAX)?,
            icon: optional_text("icon", &input.icon, MAX_NAME_LEN)?,
            color: optional_text("color", &input.color, MAX_NAME_LEN)?,
            image: optional_text("image", &input.image, usize::MAX)?,
            parent_id: optional_text("parent_id", &input.parent_id, MAX_NAME_LEN)?,
            meta_title: optional_text("meta_title", &input.meta_title, MAX_META_TITLE_LEN)?,
            meta_description: optional_text(
                "meta_description",
                &input.meta_description,
                MAX_META_DESCRIPTION_LEN,
            )?,
            name,
            ..input
        };

        Ok((normalized, slug))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CategoryService {
        let db = Arc::new(AcademyDb::open_in_memory().unwrap());
        CategoryService::new(db, Arc::new(EventBus::new()))
    }

    fn input(id: &str, parent: Option<&str>) -> CategoryInput {
        CategoryInput {
            id: Some(id.to_string()),
            name: format!("Category {}", id),
            parent_id: parent.map(|p| p.to_string()),
            is_active: true,
            ..Default::default()
        }
    }

    fn chain(svc: &CategoryService) {
        svc.create(input("a", None)).unwrap();
        svc.create(input("b", Some("a"))).unwrap();
        svc.create(input("c", Some("b"))).unwrap();
    }

    #[test]
    fn test_create_derives_slug_and_id() {
        let svc = service();
        let row = svc
            .create(CategoryInput { name: "  Web Development ".into(), is_active: true, ..Default::default() })
            .unwrap();
        assert_eq!(row.name, "Web Development");
        assert_eq!(row.slug, "web-development");
        assert!(Uuid::parse_str(&row.id).is_ok());
    }

    #[test]
    fn test_reparent_root_under_descendant_rejected() {
        let svc = service();
        chain(&svc);

        let err = svc.update("a", input("a", Some("c"))).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(ConflictKind::CyclicParent { .. })));
        // Nothing was written
        assert_eq!(svc.get("a").unwrap().unwrap().parent_id, None);
    }

    #[test]
    fn test_self_parent_rejected() {
        let svc = service();
        svc.create(input("a", None)).unwrap();

        let err = svc.update("a", input("a", Some("a"))).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(ConflictKind::SelfParent { .. })));

        let err = svc.create(input("z", Some("z"))).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(ConflictKind::SelfParent { .. })));
    }

    #[test]
    fn test_clearing_parent_always_allowed() {
        let svc = service();
        chain(&svc);
        let row = svc.update("c", input("c", None)).unwrap();
        assert_eq!(row.parent_id, None);
    }

    #[test]
    fn test_missing_parent_is_not_found() {
        let svc = service();
        let err = svc.create(input("a", Some("ghost"))).unwrap_err();
        assert!(matches!(err, StorageError::NotFound { kind: EntityKind::Category, .. }));
    }

    #[test]
    fn test_slug_checked_before_parent() {
        let svc = service();
        svc.create(input("a", None)).unwrap();
        svc.create(input("b", None)).unwrap();

        // Both the slug and the parent are bad; slug wins
        let mut bad = input("b", Some("b"));
        bad.slug = Some("category-a".into());
        let err = svc.update("b", bad).unwrap_err();
        match err {
            StorageError::Conflict(ConflictKind::SlugTaken { conflicting_id, .. }) => {
                assert_eq!(conflicting_id, "a")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_slug_availability_excludes_self() {
        let svc = service();
        svc.create(input("a", None)).unwrap();
        svc.create(input("b", None)).unwrap();

        assert!(svc.is_slug_available("category-a", Some("a")).unwrap().available);
        let other = svc.is_slug_available("category-a", Some("b")).unwrap();
        assert!(!other.available);
        assert_eq!(other.conflict.unwrap().id, "a");
        assert!(svc.is_slug_available("Not Valid", None).is_err());
    }

    #[test]
    fn test_update_keeps_own_slug() {
        let svc = service();
        svc.create(input("a", None)).unwrap();
        let mut same = input("a", None);
        same.description = Some("now described".into());
        let row = svc.update("a", same).unwrap();
        assert_eq!(row.slug, "category-a");
        assert_eq!(row.description.as_deref(), Some("now described"));
    }

    #[test]
    fn test_route_words_rejected_as_ids() {
        let svc = service();
        for word in ["tree", "slug-check", "by-slug"] {
            let err = svc.create(input(word, None)).unwrap_err();
            assert!(matches!(err, StorageError::InvalidInput(_)), "{}", word);
        }
        assert!(svc.list(&CategoryQuery { limit: 10, ..Default::default() }).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let svc = service();
        svc.create(input("a", None)).unwrap();
        let mut again = input("a", None);
        again.slug = Some("other".into());
        let err = svc.create(again).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(ConflictKind::DuplicateId { .. })));
    }

    #[test]
    fn test_delete_blocked_then_allowed() {
        let svc = service();
        chain(&svc);

        let err = svc.delete("b").unwrap_err();
        match err {
            StorageError::DependencyBlocked { blockers, .. } => {
                assert_eq!(blockers.len(), 1);
                assert_eq!(blockers[0].dependency, crate::error::DependencyKind::ChildCategories);
            }
            other => panic!("unexpected {:?}", other),
        }

        svc.delete("c").unwrap();
        svc.delete("b").unwrap();
        assert!(svc.get("b").unwrap().is_none());
        assert!(matches!(svc.delete("b").unwrap_err(), StorageError::NotFound { .. }));
    }

    #[test]
    fn test_tree_and_breadcrumb() {
        let svc = service();
        chain(&svc);
        svc.create(input("d", None)).unwrap();

        let tree = svc.tree().unwrap();
        assert_eq!(tree.len(), 2);
        let a = tree.iter().find(|n| n.id == "a").unwrap();
        assert_eq!(a.data.slug, "category-a");
        assert_eq!(a.children[0].children[0].id, "c");

        let crumbs: Vec<String> = svc.breadcrumb("c").unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(crumbs, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_query_is_idempotent() {
        let svc = service();
        chain(&svc);
        assert!(svc.would_create_cycle("a", "c").unwrap());
        assert!(svc.would_create_cycle("a", "c").unwrap());
        assert!(!svc.would_create_cycle("c", "a").unwrap());
    }

    #[tokio::test]
    async fn test_update_emits_parent_changed() {
        let svc = service();
        let mut rx = svc.events.subscribe();
        svc.create(input("a", None)).unwrap();
        svc.create(input("b", None)).unwrap();
        svc.update("b", input("b", Some("a"))).unwrap();

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(StorageEvent::CategoryUpdated { id: "b".into(), parent_changed: true })
        );
    }
}
