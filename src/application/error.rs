use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::admin::cache::AdminCacheError, cache::CacheStoreError,
    domain::error::DomainError, infra::error::InfraError,
};

/// Error chain attached to a failed response for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let messages = std::iter::successors(Some(error), |&current| current.source())
            .map(ToString::to_string)
            .collect();
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Rejection with a fixed public message and a detailed report for logging.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

fn admin_status(error: &AdminCacheError) -> (StatusCode, &'static str) {
    match error {
        AdminCacheError::Forbidden => (StatusCode::FORBIDDEN, "Operator credentials required"),
        AdminCacheError::InvalidToken => (StatusCode::FORBIDDEN, "Invalid or missing form token"),
        AdminCacheError::UnknownAction(_) | AdminCacheError::InvalidResourceId(_) => {
            (StatusCode::BAD_REQUEST, "Invalid cache action")
        }
        AdminCacheError::Store(_) | AdminCacheError::Log(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Cache storage failure")
        }
        AdminCacheError::Catalog(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Resource catalog unavailable")
        }
    }
}

impl From<AdminCacheError> for HttpError {
    fn from(error: AdminCacheError) -> Self {
        let (status, public_message) = admin_status(&error);
        HttpError::from_error(
            "infra::http::admin_cache_error_to_http_error",
            status,
            public_message,
            &error,
        )
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Store(#[from] CacheStoreError),
    #[error(transparent)]
    Admin(#[from] AdminCacheError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Domain(DomainError::Validation { .. }) => StatusCode::BAD_REQUEST,
            AppError::Admin(err) => admin_status(err).0,
            AppError::Infra(InfraError::Upstream { .. }) => StatusCode::BAD_GATEWAY,
            AppError::Infra(_)
            | AppError::Store(_)
            | AppError::Domain(DomainError::Invariant { .. })
            | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Domain(DomainError::Validation { .. }) => "Request could not be processed",
            AppError::Admin(err) => admin_status(err).1,
            AppError::Infra(InfraError::Upstream { .. }) => "Upstream unavailable",
            AppError::Infra(InfraError::Configuration { .. }) => "Service misconfigured",
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start",
            AppError::Infra(InfraError::Io(_)) | AppError::Store(_) => "I/O failure during request",
            AppError::Domain(DomainError::Invariant { .. }) | AppError::Unexpected(_) => {
                "Unexpected error occurred"
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}
