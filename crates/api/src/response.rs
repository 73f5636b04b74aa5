//! Shared response envelope types for API handlers.
//!
//! JSON responses use a `{ "data": ... }` envelope. Progress streams are the
//! exception: they are served as `text/event-stream`.

use serde::Serialize;

/// Standard `{ "data": T }` response envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}
