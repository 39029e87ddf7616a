//! Event system for catalog and progress operations
//!
//! Services emit an event after every committed mutation. Listeners use them
//! for audit logging and cache invalidation in front-ends.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Events emitted by services
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    // Hierarchy events
    CategoryCreated {
        id: String,
        slug: String,
        parent_id: Option<String>,
    },
    CategoryUpdated {
        id: String,
        parent_changed: bool,
    },
    CategoryDeleted {
        id: String,
    },
    SubcategoryCreated {
        id: String,
        category_id: String,
    },
    SubcategoryUpdated {
        id: String,
    },
    SubcategoryDeleted {
        id: String,
    },

    // Catalog events
    CourseCreated {
        id: String,
        title: String,
    },
    CourseUpdated {
        id: String,
    },
    CourseDeleted {
        id: String,
    },
    ModuleCreated {
        id: String,
        course_id: String,
    },
    ModuleUpdated {
        id: String,
    },
    ModulesReordered {
        course_id: String,
    },
    LessonCreated {
        id: String,
        module_id: String,
    },
    LessonUpdated {
        id: String,
    },
    LessonsReordered {
        module_id: String,
    },

    // Learner events
    LessonCompleted {
        learner_id: String,
        lesson_id: String,
        xp_awarded: i64,
    },
    CourseCompleted {
        learner_id: String,
        course_id: String,
    },
    CoursePurchased {
        learner_id: String,
        course_id: String,
    },
    BadgeAwarded {
        learner_id: String,
        badge_id: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn on_event(&self, event: &StorageEvent);
}

/// Event bus for broadcasting storage events
pub struct EventBus {
    sender: broadcast::Sender<StorageEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: StorageEvent) {
        trace!(event = ?event, "Emitting storage event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &StorageEvent) {
        match event {
            StorageEvent::CategoryCreated { id, slug, parent_id } => {
                info!(id = %id, slug = %slug, parent = ?parent_id, "Category created");
            }
            StorageEvent::CategoryUpdated { id, parent_changed } => {
                info!(id = %id, parent_changed, "Category updated");
            }
            StorageEvent::CategoryDeleted { id } => {
                info!(id = %id, "Category deleted");
            }
            StorageEvent::CourseDeleted { id } => {
                info!(id = %id, "Course deleted");
            }
            StorageEvent::CourseCompleted { learner_id, course_id } => {
                debug!(learner = %learner_id, course = %course_id, "Course completed");
            }
            StorageEvent::BadgeAwarded { learner_id, badge_id } => {
                debug!(learner = %learner_id, badge = %badge_id, "Badge awarded");
            }
            _ => {
                trace!(event = ?event, "Storage event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(StorageEvent::CategoryCreated {
            id: "cat-1".into(),
            slug: "programming".into(),
            parent_id: None,
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            StorageEvent::CategoryCreated { id, slug, .. } => {
                assert_eq!(id, "cat-1");
                assert_eq!(slug, "programming");
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        // Should not panic even with no subscribers
        bus.emit(StorageEvent::CategoryDeleted { id: "x".into() });
    }
}
