use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use mds_core::{Error, ErrorKind};

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "code": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Internal | ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{ code, message, details? }` with the status of the error's kind.
pub fn error_response(err: &Error) -> Response {
    let mut body = json!({
        "code": err.kind().code(),
        "message": err.message(),
    });
    if !err.details().is_empty() {
        body["details"] = json!(err.details());
    }
    (status_of(err.kind()), axum::Json(body)).into_response()
}
