//! Pieces shared by every route group: the error type and request guards.

use axum::{
    Json,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::errors::{BuilderError, QueueError, RemoteError};

/// Header carrying the caller's comma separated roles.
pub const ROLES_HEADER: &str = "x-buildq-roles";
pub const ADMIN_ROLE: &str = "system/admin";

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), "request failed: {}", message);
        }
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<BuilderError> for ApiError {
    fn from(err: BuilderError) -> Self {
        let message = err.to_string();
        match err {
            BuilderError::InvalidRequest(_) => ApiError::BadRequest(message),
            BuilderError::UnknownBuilder(_) | BuilderError::TaskNotFound(_) => {
                ApiError::NotFound(message)
            }
            BuilderError::QueueFull { .. } | BuilderError::NotRunning(_) => {
                ApiError::Unavailable(message)
            }
            BuilderError::InvalidSettings(_) | BuilderError::Other(_) => ApiError::Internal(message),
        }
    }
}

impl From<RemoteError> for ApiError {
    fn from(err: RemoteError) -> Self {
        match err {
            // Client errors of the remote server are the caller's problem too.
            RemoteError::Service { status, message, .. } => match status {
                400 => ApiError::BadRequest(message),
                403 => ApiError::Forbidden(message),
                404 => ApiError::NotFound(message),
                409 => ApiError::Conflict(message),
                503 => ApiError::Unavailable(message),
                _ => ApiError::BadGateway(message),
            },
            RemoteError::BuilderNotFound { .. } => ApiError::NotFound(err.to_string()),
            RemoteError::Transport { .. } => ApiError::BadGateway(err.to_string()),
            RemoteError::InvalidResponse { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let message = err.to_string();
        match err {
            QueueError::InvalidRequest(_) => ApiError::BadRequest(message),
            QueueError::TaskNotFound(_) | QueueError::ServerNotRegistered(_) => {
                ApiError::NotFound(message)
            }
            QueueError::QueueFull(_) | QueueError::NoBuilderAvailable { .. } => {
                ApiError::Unavailable(message)
            }
            QueueError::Selection(_) => ApiError::Internal(message),
            QueueError::Remote(remote) => remote.into(),
        }
    }
}

// ── Guards ────────────────────────────────────────────────────────────

/// Rejects callers whose role header lacks `role`.
pub fn require_role(headers: &HeaderMap, role: &str) -> Result<(), ApiError> {
    let granted = headers
        .get_all(ROLES_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|r| r.trim() == role);
    if granted {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!("role '{}' required", role)))
    }
}

/// Rejects artifact paths that could escape the sources directory.
pub fn check_relative_path(path: &str) -> Result<(), ApiError> {
    let candidate = std::path::Path::new(path);
    let escapes = path.is_empty()
        || candidate.is_absolute()
        || candidate
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir));
    if escapes {
        return Err(ApiError::BadRequest(format!("Invalid path: '{}'", path)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_role_header() {
        let mut headers = HeaderMap::new();
        assert!(require_role(&headers, ADMIN_ROLE).is_err());

        headers.insert(ROLES_HEADER, HeaderValue::from_static("workspace/developer"));
        assert!(matches!(
            require_role(&headers, ADMIN_ROLE),
            Err(ApiError::Forbidden(_))
        ));

        headers.insert(
            ROLES_HEADER,
            HeaderValue::from_static("workspace/developer, system/admin"),
        );
        assert!(require_role(&headers, ADMIN_ROLE).is_ok());
    }

    #[test]
    fn test_relative_paths() {
        assert!(check_relative_path("target/app.jar").is_ok());
        assert!(check_relative_path("./out/a.bin").is_ok());
        assert!(check_relative_path("../secret").is_err());
        assert!(check_relative_path("a/../../b").is_err());
        assert!(check_relative_path("/etc/passwd").is_err());
        assert!(check_relative_path("").is_err());
    }

    #[test]
    fn test_error_mapping() {
        let full: ApiError = BuilderError::QueueFull {
            builder: "maven".into(),
            capacity: 1,
        }
        .into();
        assert!(matches!(full, ApiError::Unavailable(_)));

        let missing: ApiError = QueueError::TaskNotFound(4).into();
        assert!(matches!(missing, ApiError::NotFound(_)));

        let remote: ApiError = QueueError::Remote(RemoteError::Service {
            status: 500,
            message: "boom".into(),
            payload: None,
        })
        .into();
        assert!(matches!(remote, ApiError::BadGateway(ref m) if m == "boom"));

        let passthrough: ApiError = RemoteError::Service {
            status: 409,
            message: "not finished".into(),
            payload: None,
        }
        .into();
        assert!(matches!(passthrough, ApiError::Conflict(_)));
    }

    #[test]
    fn test_error_response_status() {
        let response = ApiError::Forbidden("no".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = ApiError::Unavailable("busy".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
