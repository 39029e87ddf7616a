//! Service layer for academy-storage
//!
//! Services encapsulate business logic between HTTP handlers and repositories.
//! Each service wraps database operations with:
//! - Input validation and normalization
//! - Ordered precondition checks (slug, self reference, parent, cycle)
//! - Transaction boundaries
//! - Event emission for audit logging
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! Service Layer (business logic)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod response;
pub mod events;
pub mod deletion;
pub mod validation;
pub mod category_service;
pub mod subcategory_service;
pub mod course_service;
pub mod progress_service;

// Re-exports
pub use response::*;
pub use events::{EventBus, EventListener, StorageEvent};
pub use deletion::DeletionCheck;
pub use category_service::CategoryService;
pub use subcategory_service::SubcategoryService;
pub use course_service::CourseService;
pub use progress_service::ProgressService;

use crate::config::Config;
use crate::db::AcademyDb;
use std::sync::Arc;

/// Service container for dependency injection
///
/// Holds all services with the shared database handle and event bus.
/// Pass this to HttpServer for handler access.
pub struct Services {
    pub categories: Arc<CategoryService>,
    pub subcategories: Arc<SubcategoryService>,
    pub courses: Arc<CourseService>,
    pub progress: Arc<ProgressService>,
    pub events: Arc<EventBus>,
    pub db: Arc<AcademyDb>,
}

impl Services {
    /// Create all services with shared database
    pub fn new(db: Arc<AcademyDb>, config: &Config) -> Self {
        let events = Arc::new(EventBus::new());

        Self {
            categories: Arc::new(CategoryService::new(db.clone(), events.clone())),
            subcategories: Arc::new(SubcategoryService::new(db.clone(), events.clone())),
            courses: Arc::new(CourseService::new(db.clone(), events.clone())),
            progress: Arc::new(ProgressService::new(
                db.clone(),
                events.clone(),
                config.criteria_policy,
                config.course_completion_bonus_xp,
            )),
            events,
            db,
        }
    }
}
