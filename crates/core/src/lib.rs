//! Domain building blocks for the plumb pipeline daemon.
//!
//! Everything here is free of HTTP server concerns so it can be exercised
//! directly from tests and reused by the pipeline and API crates:
//!
//! - [`plugin`]: plugin slots, configuration documents, pipeline definitions.
//! - [`config_source`]: [`ConfigResolver`] for inline, `file:` and `http(s):` sources.
//! - [`replicate`]: [`DirectoryReplicator`] for copying workspaces.
//! - [`process`]: [`ProcessRunner`] for external tooling.

pub mod config_source;
pub mod error;
pub mod plugin;
pub mod process;
pub mod replicate;

pub use config_source::{ConfigResolver, ConfigSource, ResolveError};
pub use error::CoreError;
pub use plugin::{ConfigurationDocument, PipelineDefinition, PluginRef, PluginSlot, PluginSlots};
pub use process::{ExecError, ExecOptions, ProcessRunner};
pub use replicate::{DirectoryReplicator, ReplicateError};
