use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use crate::actors::ActorError;
use crate::resources::ResourceError;
use crate::volumes::VolumeError;
use crate::workloads::WorkloadError;

/// An error returned to API clients as a plain-text body.
///
/// Controller errors become 500 with the error text; only lookups of ids
/// that don't exist and unparsable path parameters get their own status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<WorkloadError> for ApiError {
    fn from(e: WorkloadError) -> Self {
        match e {
            WorkloadError::NotFound(_) => Self::not_found(e.to_string()),
            e => Self::internal(e.to_string()),
        }
    }
}

impl From<VolumeError> for ApiError {
    fn from(e: VolumeError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<ResourceError> for ApiError {
    fn from(e: ResourceError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<ActorError> for ApiError {
    fn from(e: ActorError) -> Self {
        Self::internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "Request failed");
        }
        let mut response = (self.status, self.message).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_errors_are_internal() {
        let err: ApiError = WorkloadError::AlreadyExists("web".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "workload web already exists");
    }

    #[test]
    fn test_not_found_keeps_status() {
        let err: ApiError = WorkloadError::NotFound("0123456789abcdef".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
