//! SQLite database module for the catalog, hierarchy and learner progress
//!
//! ## Tables
//!
//! - `categories` - Category hierarchy (self-referencing `parent_id`)
//! - `subcategories` - Subcategories, each attached to one category
//! - `courses`, `modules`, `lessons` - Catalog; modules and lessons carry
//!   unlock criteria JSON
//! - `lesson_completions`, `course_completions`, `purchases` - Learner facts
//! - `xp_ledger`, `streaks`, `badges`, `learner_badges` - Gamification
//!
//! Repository functions take `&Connection` so services can run several of
//! them inside one transaction.

pub mod schema;
pub mod categories;
pub mod subcategories;
pub mod courses;
pub mod progress;
pub mod slugs;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::StorageError;

/// SQLite database for the academy
pub struct AcademyDb {
    conn: Mutex<Connection>,
}

impl AcademyDb {
    /// Open or create the database file
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)?;

        // WAL for concurrent readers; foreign keys drive lesson/module cascades
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read with shared access to the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Run checks and writes as one atomic unit.
    ///
    /// Uses `BEGIN IMMEDIATE` so the write lock is held from the first read;
    /// nothing checked inside `f` can change before commit. Any `Err` rolls
    /// back.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, StorageError> {
                let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
                Ok(n as u64)
            };

            Ok(DbStats {
                category_count: count("categories")?,
                subcategory_count: count("subcategories")?,
                course_count: count("courses")?,
                module_count: count("modules")?,
                lesson_count: count("lessons")?,
                badge_count: count("badges")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub category_count: u64,
    pub subcategory_count: u64,
    pub course_count: u64,
    pub module_count: u64,
    pub lesson_count: u64,
    pub badge_count: u64,
}

/// True for a UNIQUE/PRIMARY KEY/FOREIGN KEY violation
pub(crate) fn is_constraint_violation(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Empty strings from forms become NULL
pub(crate) fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// Re-exports
pub use categories::{CategoryInput, CategoryQuery, CategoryRow};
pub use subcategories::{SubcategoryInput, SubcategoryQuery, SubcategoryRow};
pub use courses::{CourseInput, CourseQuery, CourseRow, LessonInput, LessonRow, ModuleInput, ModuleRow};
