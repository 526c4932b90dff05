//! Stream router
//!
//! Maps a request's method, path and content type onto the response
//! strategy that answers it.

use super::stream::StreamMode;

/// Where a request goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `GET /test`
    Test,
    /// `GET /stream`
    ServerStream,
    /// `POST /stream` with an ndjson body
    BidiStream,
    /// Everything else
    NotFound,
}

impl Route {
    /// Response strategy for this route
    pub fn mode(&self) -> StreamMode {
        match self {
            Route::Test | Route::NotFound => StreamMode::Unary,
            Route::ServerStream => StreamMode::ServerStream,
            Route::BidiStream => StreamMode::BidiStream,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Route::Test => "test",
            Route::ServerStream => "server-stream",
            Route::BidiStream => "bidi-stream",
            Route::NotFound => "not-found",
        }
    }
}

/// Pick the route for a request
///
/// The query string is ignored. The duplex echo needs a content type
/// mentioning `ndjson`; a plain `POST /stream` is not found.
pub fn route(method: &str, path: &str, content_type: Option<&str>) -> Route {
    let path = path.split('?').next().unwrap_or(path);

    match (method, path) {
        ("GET", "/test") => Route::Test,
        ("GET", "/stream") => Route::ServerStream,
        ("POST", "/stream") if content_type.is_some_and(is_ndjson) => Route::BidiStream,
        _ => Route::NotFound,
    }
}

fn is_ndjson(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("ndjson")
}
