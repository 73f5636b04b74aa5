//! Request handlers.
//!
//! Handlers delegate to `plumb_core` and `plumb_pipeline` and map errors via
//! [`AppError`](crate::error::AppError).

pub mod pipelines;
