//! Error types for academy-storage

use serde::Serialize;
use thiserror::Error;

use crate::unlock::LockReason;

/// Kind of entity an error or check refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Category,
    Subcategory,
    Course,
    Module,
    Lesson,
    Badge,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Category => "category",
            EntityKind::Subcategory => "subcategory",
            EntityKind::Course => "course",
            EntityKind::Module => "module",
            EntityKind::Lesson => "lesson",
            EntityKind::Badge => "badge",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dependency that prevents an entity from being deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Courses,
    ChildCategories,
    Subcategories,
    PrerequisiteModules,
    PrerequisiteLessons,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Courses => f.write_str("courses"),
            DependencyKind::ChildCategories => f.write_str("child categories"),
            DependencyKind::Subcategories => f.write_str("subcategories"),
            DependencyKind::PrerequisiteModules => f.write_str("modules gated on it"),
            DependencyKind::PrerequisiteLessons => f.write_str("lessons gated on it"),
        }
    }
}

/// A single blocking dependency with how many rows reference the entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionBlocker {
    pub dependency: DependencyKind,
    pub count: u64,
}

impl std::fmt::Display for DeletionBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.count, self.dependency)
    }
}

/// Conflicts with existing state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ConflictKind {
    SlugTaken {
        kind: EntityKind,
        slug: String,
        conflicting_id: String,
        conflicting_name: String,
    },
    SelfParent {
        id: String,
    },
    CyclicParent {
        id: String,
        parent_id: String,
    },
    DuplicateId {
        kind: EntityKind,
        id: String,
    },
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::SlugTaken { kind, slug, conflicting_id, conflicting_name } => write!(
                f,
                "slug '{}' is already used by {} '{}' ({})",
                slug, kind, conflicting_name, conflicting_id
            ),
            ConflictKind::SelfParent { id } => {
                write!(f, "category '{}' cannot be its own parent", id)
            }
            ConflictKind::CyclicParent { id, parent_id } => write!(
                f,
                "category '{}' is a descendant of '{}'; using it as parent would create a cycle",
                parent_id, id
            ),
            ConflictKind::DuplicateId { kind, id } => {
                write!(f, "{} '{}' already exists", kind, id)
            }
        }
    }
}

fn join_blockers(blockers: &[DeletionBlocker]) -> String {
    blockers
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Conflict: {0}")]
    Conflict(ConflictKind),

    #[error("Cannot delete {kind} '{id}': still referenced by {}", join_blockers(.blockers))]
    DependencyBlocked {
        kind: EntityKind,
        id: String,
        blockers: Vec<DeletionBlocker>,
    },

    #[error("{kind} '{id}' is locked: {reason}")]
    Locked {
        kind: EntityKind,
        id: String,
        reason: LockReason,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        StorageError::NotFound { kind, id: id.into() }
    }

    /// True for failures of the system rather than of the caller's input
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_)
                | StorageError::Database(_)
                | StorageError::Config(_)
                | StorageError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_blocked_message_names_each_blocker() {
        let err = StorageError::DependencyBlocked {
            kind: EntityKind::Category,
            id: "cat-1".into(),
            blockers: vec![
                DeletionBlocker { dependency: DependencyKind::Courses, count: 2 },
                DeletionBlocker { dependency: DependencyKind::Subcategories, count: 1 },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Cannot delete category 'cat-1': still referenced by 2 courses, 1 subcategories"
        );
    }

    #[test]
    fn test_slug_conflict_message_identifies_owner() {
        let err = StorageError::Conflict(ConflictKind::SlugTaken {
            kind: EntityKind::Category,
            slug: "rust".into(),
            conflicting_id: "cat-9".into(),
            conflicting_name: "Rust".into(),
        });
        let msg = err.to_string();
        assert!(msg.contains("cat-9"));
        assert!(msg.contains("Rust"));
        assert!(!err.is_internal());
    }
}
