use std::path::PathBuf;

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `6927`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`). Applies until the
    /// response headers are sent, so progress streams are not cut off.
    pub request_timeout_secs: u64,
    /// How long shutdown waits for queued pipeline runs to drain (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Root directory holding one workspace per pipeline job.
    pub workspace_dir: PathBuf,
    /// Command invoked once per plugin stage.
    pub plugin_command: String,
    /// Per-stage timeout in seconds; `None` lets stages run indefinitely.
    pub stage_timeout_secs: Option<u64>,
    /// Upper bound on file handles open at once while copying workspaces.
    pub replicate_max_open_files: usize,
    /// Directory from which clients may load `file:` configurations. Unset
    /// means `file:` references are refused over HTTP.
    pub config_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                    |
    /// |----------------------------|----------------------------|
    /// | `HOST`                     | `0.0.0.0`                  |
    /// | `PORT`                     | `6927`                     |
    /// | `CORS_ORIGINS`             | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS`     | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`    | `30`                       |
    /// | `WORKSPACE_DIR`            | `./workspace`              |
    /// | `PLUGIN_COMMAND`           | `plumb-plugin`             |
    /// | `STAGE_TIMEOUT_SECS`       | unset (no timeout)         |
    /// | `REPLICATE_MAX_OPEN_FILES` | `64`                       |
    /// | `CONFIG_DIR`               | unset (no `file:` configs) |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "6927".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        let workspace_dir = std::env::var("WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./workspace"));

        let plugin_command =
            std::env::var("PLUGIN_COMMAND").unwrap_or_else(|_| "plumb-plugin".into());

        let stage_timeout_secs: Option<u64> = std::env::var("STAGE_TIMEOUT_SECS").ok().map(|v| {
            v.parse()
                .expect("STAGE_TIMEOUT_SECS must be a valid u64")
        });

        let replicate_max_open_files: usize = std::env::var("REPLICATE_MAX_OPEN_FILES")
            .unwrap_or_else(|_| plumb_core::replicate::DEFAULT_MAX_OPEN_FILES.to_string())
            .parse()
            .expect("REPLICATE_MAX_OPEN_FILES must be a valid usize");

        let config_dir = std::env::var("CONFIG_DIR").ok().map(PathBuf::from);

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            workspace_dir,
            plugin_command,
            stage_timeout_secs,
            replicate_max_open_files,
            config_dir,
        }
    }
}
