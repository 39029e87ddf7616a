//! Academy Storage - course catalog, category hierarchy and learner progress
//!
//! Backs an online-learning platform: a self-referencing category tree with
//! subcategories, courses split into ordered modules and lessons, and
//! per-learner completions, purchases, XP, streaks and badges.
//!
//! ## Integrity rules
//!
//! | Rule | Enforced by |
//! |------|-------------|
//! | Category parent graph stays acyclic | `hierarchy::CategoryTree::would_create_cycle` |
//! | Nothing referenced is deleted | `services::deletion::can_delete` |
//! | Slugs unique per entity kind | `db::slugs` + unique indexes |
//! | Gated content needs its criteria met | `unlock::UnlockCriteria` |
//!
//! All check-then-write sequences run inside one immediate SQLite
//! transaction, so concurrent writers cannot interleave.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/academy-storage/
//! ├── academy.db             # SQLite database (WAL mode)
//! └── config.toml            # Configuration
//! ```

pub mod config;
pub mod error;
pub mod slug;
pub mod hierarchy;
pub mod unlock;
pub mod db;
pub mod services;
pub mod http;

// Re-exports
pub use config::Config;
pub use error::StorageError;
pub use db::AcademyDb;
pub use hierarchy::{CategoryTree, TreeNode};
pub use unlock::{Access, CriteriaPolicy, LearnerState, LockReason, UnlockCriteria};
pub use services::Services;
pub use http::HttpServer;
