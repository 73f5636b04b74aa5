//! Plumb pipeline daemon library.
//!
//! Exposes the building blocks (config, state, error handling, routes,
//! progress streaming) so integration tests and the binary entrypoint can
//! both access them.

pub mod config;
pub mod error;
pub mod handlers;
pub mod progress;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
