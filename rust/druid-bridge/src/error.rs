use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("druid request failed: {0}")]
    Transport(String),

    #[error("druid returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("unexpected druid response: {0}")]
    UnexpectedResponse(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Transport(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Transport(_)
            | ServiceError::Upstream { .. }
            | ServiceError::UnexpectedResponse(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !matches!(self, ServiceError::InvalidRequest(_) | ServiceError::Auth) {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_error_kind() {
        let cases = [
            (ServiceError::Auth, StatusCode::UNAUTHORIZED),
            (
                ServiceError::InvalidRequest("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServiceError::Transport("refused".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ServiceError::Upstream {
                    status: 500,
                    body: "boom".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                ServiceError::UnexpectedResponse("not an array".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ServiceError::Internal(anyhow::anyhow!("bug")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
