//! HTTP response building helpers
//!
//! Handlers return `Response<Full<Bytes>>` built through these helpers so
//! every error body has the same shape: `{"error": "...", ...details}`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::error::StorageError;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// 200 OK
pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

/// 201 Created
pub fn created<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, body)
}

/// 204 No Content
pub fn no_content() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": message }))
}

pub fn bad_request(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, &serde_json::json!({ "error": message }))
}

pub fn method_not_allowed() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &serde_json::json!({ "error": "Method not allowed" }),
    )
}

/// Convert a StorageError to an appropriate HTTP response.
///
/// Caller errors carry their full reason. System failures are logged and
/// answered with a generic message.
pub fn error_response(error: StorageError) -> Response<Full<Bytes>> {
    match &error {
        StorageError::InvalidInput(msg) => bad_request(msg),
        StorageError::Json(e) => bad_request(&format!("Invalid JSON: {}", e)),
        StorageError::NotFound { kind, id } => json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({
                "error": error.to_string(),
                "kind": kind,
                "id": id,
            }),
        ),
        StorageError::Conflict(conflict) => json_response(
            StatusCode::CONFLICT,
            &serde_json::json!({
                "error": error.to_string(),
                "conflict": conflict,
            }),
        ),
        StorageError::DependencyBlocked { kind, id, blockers } => json_response(
            StatusCode::CONFLICT,
            &serde_json::json!({
                "error": error.to_string(),
                "kind": kind,
                "id": id,
                "blockers": blockers,
            }),
        ),
        StorageError::Locked { kind, id, reason } => json_response(
            StatusCode::FORBIDDEN,
            &serde_json::json!({
                "error": error.to_string(),
                "kind": kind,
                "id": id,
                "lock": reason,
            }),
        ),
        StorageError::Io(_)
        | StorageError::Database(_)
        | StorageError::Config(_)
        | StorageError::Internal(_) => {
            error!(error = %error, "Request failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &serde_json::json!({ "error": "Internal server error" }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConflictKind, DeletionBlocker, DependencyKind, EntityKind};
    use http_body_util::BodyExt;

    async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_ok_response() {
        let resp = ok(&serde_json::json!({"test": true}));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_response(StorageError::InvalidInput("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(StorageError::not_found(EntityKind::Category, "x")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(StorageError::Conflict(ConflictKind::SelfParent { id: "x".into() })).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_response(StorageError::Internal("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_blocked_body_lists_blockers() {
        let resp = error_response(StorageError::DependencyBlocked {
            kind: EntityKind::Category,
            id: "cat-1".into(),
            blockers: vec![DeletionBlocker { dependency: DependencyKind::Courses, count: 1 }],
        });
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert_eq!(body["blockers"][0]["dependency"], "courses");
        assert_eq!(body["blockers"][0]["count"], 1);
    }

    #[tokio::test]
    async fn test_internal_detail_is_hidden() {
        let resp = error_response(StorageError::Internal("secret path /var/db".into()));
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Internal server error");
    }
}
