use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use color_eyre::eyre;

/// Error wrapper so plugin-channel handlers can use `?` on anything that
/// converts into an eyre report.
pub struct AppError(eyre::Error);

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self.0, "plugin channel request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<eyre::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
