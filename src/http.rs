//! HTTP API for the academy catalog and learner progress
//!
//! JSON in, JSON out. Routes:
//!
//! ## Hierarchy
//! - `GET|POST /categories`, `GET /categories/tree`, `GET /categories/slug-check`,
//!   `GET /categories/by-slug/{slug}`
//! - `GET|PUT|DELETE /categories/{id}`
//! - `GET /categories/{id}/deletable`, `GET /categories/{id}/breadcrumb`,
//!   `GET /categories/{id}/cycle-check?parent_id=`
//! - `GET|POST /subcategories`, `GET /subcategories/slug-check`
//! - `GET|PUT|DELETE /subcategories/{id}`, `GET /subcategories/{id}/deletable`
//!
//! ## Catalog
//! - `GET|POST /courses`, `GET|PUT|DELETE /courses/{id}`, `GET /courses/{id}/deletable`
//! - `POST /courses/{id}/modules`, `PUT /courses/{id}/modules/order`
//! - `POST /modules/{id}/lessons`, `PUT /modules/{id}/lessons/order`
//! - `PUT /modules/{id}/criteria`, `PUT|DELETE /modules/{id}`
//! - `PUT /lessons/{id}/criteria`, `PUT|DELETE /lessons/{id}`
//!
//! ## Learners
//! - `POST /unlock/evaluate`
//! - `GET /learners/{id}/state`, `GET /learners/{id}/courses/{course}/access`
//! - `POST /learners/{id}/lessons/{lesson}/complete`
//! - `POST /learners/{id}/courses/{course}/complete`
//! - `POST /learners/{id}/purchases`
//! - `GET|POST /badges`
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST http://localhost:8095/categories \
//!      -d '{"name": "Programming"}'
//!
//! curl -X PUT http://localhost:8095/categories/abc \
//!      -d '{"name": "Programming", "parent_id": "def"}'
//!
//! curl http://localhost:8095/categories/slug-check?slug=programming&exclude_id=abc
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::db::progress::BadgeInput;
use crate::db::{
    CategoryInput, CategoryQuery, CourseInput, CourseQuery, LessonInput, ModuleInput, SubcategoryInput,
    SubcategoryQuery,
};
use crate::error::{EntityKind, StorageError};
use crate::services::{created, error_response, method_not_allowed, no_content, not_found, ok, Services};
use crate::unlock::{LearnerState, StoredCriteria, UnlockCriteria};

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// First path segments this server answers for
const RESOURCES: &[&str] = &[
    "health",
    "stats",
    "categories",
    "subcategories",
    "courses",
    "modules",
    "lessons",
    "unlock",
    "learners",
    "badges",
];

#[derive(Debug, Deserialize)]
struct OrderInput {
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CriteriaInput {
    #[serde(default)]
    criteria: Option<UnlockCriteria>,
}

#[derive(Debug, Deserialize)]
struct EvaluateInput {
    /// Read leniently; unknown shapes go through the criteria policy
    #[serde(default)]
    criteria: serde_json::Value,
    #[serde(default)]
    learner: LearnerState,
    #[serde(default)]
    course_id: String,
}

#[derive(Debug, Deserialize)]
struct PurchaseInput {
    course_id: String,
}

/// Decoded query string
struct Params(HashMap<String, String>);

impl Params {
    fn parse(query: Option<&str>) -> Self {
        let map = query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Params(map)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).filter(|v| !v.is_empty()).cloned()
    }

    fn required(&self, key: &str) -> Result<String, StorageError> {
        self.get(key)
            .ok_or_else(|| StorageError::InvalidInput(format!("query parameter '{}' is required", key)))
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.0.get(key).map(String::as_str), Some("true") | Some("1") | Some(""))
    }

    fn number(&self, key: &str, default: u32) -> Result<u32, StorageError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| StorageError::InvalidInput(format!("'{}' must be a non-negative integer", key))),
        }
    }
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    bind_addr: SocketAddr,
    default_page_size: u32,
}

impl HttpServer {
    pub fn new(services: Arc<Services>, bind_addr: SocketAddr, default_page_size: u32) -> Self {
        Self {
            services,
            bind_addr,
            default_page_size,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), StorageError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
        debug!(method = %req.method(), path = %req.uri().path(), "Incoming request");

        match self.route(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if !e.is_internal() {
                    debug!(error = %e, "Request rejected");
                }
                Ok(error_response(e))
            }
        }
    }

    /// Route requests to handlers
    async fn route(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, StorageError> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let params = Params::parse(req.uri().query());
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let svc = &self.services;

        let response = match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => ok(&serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "criteria_policy": svc.progress.policy(),
            })),
            (&Method::GET, ["stats"]) => ok(&svc.db.stats()?),

            // Categories
            (&Method::GET, ["categories"]) => ok(&svc.categories.list(&self.category_query(&params)?)?),
            (&Method::POST, ["categories"]) => {
                created(&svc.categories.create(read_json::<CategoryInput>(req).await?)?)
            }
            (&Method::GET, ["categories", "tree"]) => ok(&svc.categories.tree()?),
            (&Method::GET, ["categories", "slug-check"]) => {
                let slug = params.required("slug")?;
                let exclude_id = params.get("exclude_id");
                ok(&svc.categories.is_slug_available(&slug, exclude_id.as_deref())?)
            }
            (&Method::GET, ["categories", "by-slug", slug]) => ok(&svc
                .categories
                .get_by_slug(slug)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Category, *slug))?),
            (&Method::GET, ["categories", id]) => ok(&svc
                .categories
                .get(id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Category, *id))?),
            (&Method::PUT, ["categories", id]) => {
                ok(&svc.categories.update(id, read_json::<CategoryInput>(req).await?)?)
            }
            (&Method::DELETE, ["categories", id]) => {
                svc.categories.delete(id)?;
                no_content()
            }
            (&Method::GET, ["categories", id, "deletable"]) => ok(&svc.categories.can_delete(id)?),
            (&Method::GET, ["categories", id, "breadcrumb"]) => ok(&svc.categories.breadcrumb(id)?),
            (&Method::GET, ["categories", id, "cycle-check"]) => {
                let parent_id = params.required("parent_id")?;
                let cycle = svc.categories.would_create_cycle(id, &parent_id)?;
                ok(&serde_json::json!({ "would_create_cycle": cycle }))
            }

            // Subcategories
            (&Method::GET, ["subcategories"]) => {
                let query = SubcategoryQuery {
                    category_id: params.get("category_id"),
                    active_only: params.flag("active_only"),
                    limit: params.number("limit", self.default_page_size)?,
                    offset: params.number("offset", 0)?,
                };
                ok(&svc.subcategories.list(&query)?)
            }
            (&Method::POST, ["subcategories"]) => {
                created(&svc.subcategories.create(read_json::<SubcategoryInput>(req).await?)?)
            }
            (&Method::GET, ["subcategories", "slug-check"]) => {
                let slug = params.required("slug")?;
                let exclude_id = params.get("exclude_id");
                ok(&svc.subcategories.is_slug_available(&slug, exclude_id.as_deref())?)
            }
            (&Method::GET, ["subcategories", id]) => ok(&svc
                .subcategories
                .get(id)?
                .ok_or_else(|| StorageError::not_found(EntityKind::Subcategory, *id))?),
            (&Method::PUT, ["subcategories", id]) => {
                ok(&svc.subcategories.update(id, read_json::<SubcategoryInput>(req).await?)?)
            }
            (&Method::DELETE, ["subcategories", id]) => {
                svc.subcategories.delete(id)?;
                no_content()
            }
            (&Method::GET, ["subcategories", id, "deletable"]) => ok(&svc.subcategories.can_delete(id)?),

            // Courses, modules, lessons
            (&Method::GET, ["courses"]) => {
                let query = CourseQuery {
                    category_id: params.get("category_id"),
                    subcategory_id: params.get("subcategory_id"),
                    published_only: params.flag("published_only"),
                    limit: params.number("limit", self.default_page_size)?,
                    offset: params.number("offset", 0)?,
                };
                ok(&svc.courses.list(&query)?)
            }
            (&Method::POST, ["courses"]) => created(&svc.courses.create(read_json::<CourseInput>(req).await?)?),
            (&Method::GET, ["courses", id]) => ok(&svc.courses.outline(id)?),
            (&Method::PUT, ["courses", id]) => ok(&svc.courses.update(id, read_json::<CourseInput>(req).await?)?),
            (&Method::DELETE, ["courses", id]) => {
                svc.courses.delete(id)?;
                no_content()
            }
            (&Method::GET, ["courses", id, "deletable"]) => ok(&svc.courses.can_delete(id)?),
            (&Method::POST, ["courses", id, "modules"]) => {
                created(&svc.courses.create_module(id, read_json::<ModuleInput>(req).await?)?)
            }
            (&Method::PUT, ["courses", id, "modules", "order"]) => {
                let order = read_json::<OrderInput>(req).await?;
                ok(&svc.courses.reorder_modules(id, &order.ids)?)
            }
            (&Method::POST, ["modules", id, "lessons"]) => {
                created(&svc.courses.create_lesson(id, read_json::<LessonInput>(req).await?)?)
            }
            (&Method::PUT, ["modules", id, "lessons", "order"]) => {
                let order = read_json::<OrderInput>(req).await?;
                ok(&svc.courses.reorder_lessons(id, &order.ids)?)
            }
            (&Method::PUT, ["modules", id, "criteria"]) => {
                let input = read_json::<CriteriaInput>(req).await?;
                ok(&svc.courses.set_module_criteria(id, input.criteria)?)
            }
            (&Method::PUT, ["modules", id]) => {
                ok(&svc.courses.update_module(id, read_json::<ModuleInput>(req).await?)?)
            }
            (&Method::DELETE, ["modules", id]) => {
                svc.courses.delete_module(id)?;
                no_content()
            }
            (&Method::PUT, ["lessons", id, "criteria"]) => {
                let input = read_json::<CriteriaInput>(req).await?;
                ok(&svc.courses.set_lesson_criteria(id, input.criteria)?)
            }
            (&Method::PUT, ["lessons", id]) => {
                ok(&svc.courses.update_lesson(id, read_json::<LessonInput>(req).await?)?)
            }
            (&Method::DELETE, ["lessons", id]) => {
                svc.courses.delete_lesson(id)?;
                no_content()
            }

            // Unlock evaluation and learner progress
            (&Method::POST, ["unlock", "evaluate"]) => {
                let input = read_json::<EvaluateInput>(req).await?;
                let criteria = StoredCriteria::from_value(&input.criteria);
                let access = svc.progress.evaluate(&criteria, &input.learner, &input.course_id);
                ok(&serde_json::json!({
                    "unlocked": access.is_unlocked(),
                    "access": access,
                }))
            }
            (&Method::GET, ["learners", learner, "state"]) => ok(&svc.progress.profile(learner)?),
            (&Method::GET, ["learners", learner, "courses", course, "access"]) => {
                ok(&svc.progress.course_access(learner, course)?)
            }
            (&Method::POST, ["learners", learner, "lessons", lesson, "complete"]) => {
                ok(&svc.progress.complete_lesson(learner, lesson)?)
            }
            (&Method::POST, ["learners", learner, "courses", course, "complete"]) => {
                ok(&svc.progress.complete_course(learner, course)?)
            }
            (&Method::POST, ["learners", learner, "purchases"]) => {
                let input = read_json::<PurchaseInput>(req).await?;
                created(&svc.progress.record_purchase(learner, &input.course_id)?)
            }

            // Badges
            (&Method::GET, ["badges"]) => ok(&svc.progress.list_badges()?),
            (&Method::POST, ["badges"]) => created(&svc.progress.create_badge(read_json::<BadgeInput>(req).await?)?),

            (_, [first, ..]) if RESOURCES.contains(first) => method_not_allowed(),
            _ => not_found("Not Found"),
        };

        Ok(response)
    }

    fn category_query(&self, params: &Params) -> Result<CategoryQuery, StorageError> {
        Ok(CategoryQuery {
            parent_id: params.get("parent_id"),
            roots_only: params.flag("roots_only"),
            active_only: params.flag("active_only"),
            featured_only: params.flag("featured_only"),
            search: params.get("search"),
            limit: params.number("limit", self.default_page_size)?,
            offset: params.number("offset", 0)?,
        })
    }
}

/// Read and decode a JSON request body
async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, StorageError> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| StorageError::InvalidInput(format!("Failed to read body: {}", e)))?
        .to_bytes();

    if body.is_empty() {
        return Err(StorageError::InvalidInput("request body is required".into()));
    }

    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unlock::CriteriaPolicy;

    #[test]
    fn test_params_parsing() {
        let params = Params::parse(Some("slug=intro%20x&exclude_id=&roots_only=true&limit=5"));
        assert_eq!(params.get("slug").as_deref(), Some("intro x"));
        // Empty value counts as absent
        assert_eq!(params.get("exclude_id"), None);
        assert!(params.flag("roots_only"));
        assert!(!params.flag("active_only"));
        assert_eq!(params.number("limit", 50).unwrap(), 5);
        assert_eq!(params.number("offset", 0).unwrap(), 0);
        assert!(params.required("missing").is_err());
    }

    #[test]
    fn test_params_reject_bad_number() {
        let params = Params::parse(Some("limit=-1"));
        assert!(matches!(params.number("limit", 50), Err(StorageError::InvalidInput(_))));
    }

    #[test]
    fn test_evaluate_input_defaults() {
        let input: EvaluateInput =
            serde_json::from_str(r#"{"criteria": {"type": "xp", "minXp": 100}, "learner": {"totalXP": 99}}"#)
                .unwrap();
        let criteria = StoredCriteria::from_value(&input.criteria);
        assert!(!CriteriaPolicy::FailOpen.evaluate(&criteria, &input.learner, &input.course_id).is_unlocked());
        assert_eq!(input.course_id, "");
    }

    #[test]
    fn test_evaluate_input_accepts_unknown_criteria() {
        let input: EvaluateInput =
            serde_json::from_str(r#"{"criteria": {"type": "quiz"}, "learner": {}}"#).unwrap();
        let criteria = StoredCriteria::from_value(&input.criteria);
        let open = CriteriaPolicy::FailOpen.evaluate(&criteria, &input.learner, &input.course_id);
        let closed = CriteriaPolicy::FailClosed.evaluate(&criteria, &input.learner, &input.course_id);
        assert!(open.is_unlocked());
        assert!(!closed.is_unlocked());
    }
}
