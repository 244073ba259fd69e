//! Configuration structures and loading

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// System paths and settings
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Docker configuration
    #[serde(default)]
    pub docker: DockerConfiguration,

    /// Image policy
    #[serde(default)]
    pub policy: PolicyConfiguration,

    /// Execution engine tuning
    #[serde(default)]
    pub execution: ExecutionConfiguration,

    /// Lifecycle: drain, GC, warm pool
    #[serde(default)]
    pub lifecycle: LifecycleConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        // Resolve relative paths against the config file's parent directory,
        // or the current working directory if it has no parent
        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.system.resolve_paths(&base_dir);

        // Ensure directories exist
        std::fs::create_dir_all(&config.system.data_directory)?;
        if let Some(parent) = config.system.state_db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(config)
    }

    /// Built-in defaults rooted at a throwaway directory; test fixtures
    /// build on this.
    pub fn default_for_tests(data_dir: PathBuf) -> Self {
        let mut config = Configuration {
            debug: true,
            api: ApiConfiguration::default(),
            system: SystemConfiguration::default(),
            docker: DockerConfiguration::default(),
            policy: PolicyConfiguration::default(),
            execution: ExecutionConfiguration::default(),
            lifecycle: LifecycleConfiguration::default(),
        };
        config.system.state_db_path = data_dir.join("state.db");
        config.system.data_directory = data_dir;
        config
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfiguration {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Maximum request body size in bytes (tar imports, file writes)
    #[serde(default = "default_upload_limit_bytes")]
    pub upload_limit_bytes: usize,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            upload_limit_bytes: default_upload_limit_bytes(),
        }
    }
}

fn default_api_host() -> String {
    "127.0.0.1".into()
}

fn default_api_port() -> u16 {
    8744
}

fn default_upload_limit_bytes() -> usize {
    256 * 1024 * 1024
}

/// System paths and settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfiguration {
    /// Directory holding per-container workspace directories
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// Path to the durable state database
    #[serde(default = "default_state_db_path")]
    pub state_db_path: PathBuf,

    /// Mount point of the workspace inside containers
    #[serde(default = "default_workspace_mount_path")]
    pub workspace_mount_path: String,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            state_db_path: default_state_db_path(),
            workspace_mount_path: default_workspace_mount_path(),
        }
    }
}

impl SystemConfiguration {
    /// Resolve relative paths to absolute paths based on the given base directory.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        self.data_directory = Self::resolve_path(&self.data_directory, base_dir);
        self.state_db_path = Self::resolve_path(&self.state_db_path, base_dir);
    }

    fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            let resolved = base_dir.join(path);
            resolved
                .canonicalize()
                .unwrap_or_else(|_| Self::normalize_path(&resolved))
        }
    }

    /// Normalize `.` and `..` components without requiring the path to exist
    fn normalize_path(path: &Path) -> PathBuf {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    components.pop();
                }
                Component::CurDir => {}
                c => components.push(c),
            }
        }
        components.iter().collect()
    }
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("/var/lib/devbench/workspaces")
}

fn default_state_db_path() -> PathBuf {
    PathBuf::from("/var/lib/devbench/state.db")
}

fn default_workspace_mount_path() -> String {
    "/workspace".into()
}

/// Docker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerConfiguration {
    /// Socket path override; local defaults when unset
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Network mode applied to every sandbox
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket_path: None,
            network_mode: default_network_mode(),
        }
    }
}

fn default_network_mode() -> String {
    "bridge".into()
}

/// Image policy configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfiguration {
    /// Registry hostnames images may come from; empty means Docker Hub only
    #[serde(default)]
    pub allowed_registries: Vec<String>,

    /// Optional explicit allow-list of image references
    #[serde(default)]
    pub allowed_images: Vec<String>,

    /// Image used by the warm pool
    #[serde(default = "default_image")]
    pub default_image: String,
}

impl Default for PolicyConfiguration {
    fn default() -> Self {
        Self {
            allowed_registries: Vec::new(),
            allowed_images: Vec::new(),
            default_image: default_image(),
        }
    }
}

fn default_image() -> String {
    "python:3.11-slim".into()
}

/// Execution engine tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfiguration {
    /// Concurrent running executions allowed per container
    #[serde(default = "default_concurrent_execs")]
    pub concurrent_execs_per_container: usize,

    /// Per-execution output ring buffer budget in bytes
    #[serde(default = "default_output_budget")]
    pub exec_output_budget_bytes: usize,

    /// Maximum payload bytes returned by a single poll
    #[serde(default = "default_poll_chunk")]
    pub exec_poll_chunk_bytes: usize,

    /// Timeout applied when a request omits one
    #[serde(default = "default_exec_timeout")]
    pub default_exec_timeout_seconds: u64,

    /// Container memory limit in bytes (0 = unlimited)
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: i64,

    /// Container CPU allowance in whole-core units (0 = unlimited)
    #[serde(default = "default_cpu_limit")]
    pub cpus: f64,

    /// Container PID limit
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

impl Default for ExecutionConfiguration {
    fn default() -> Self {
        Self {
            concurrent_execs_per_container: default_concurrent_execs(),
            exec_output_budget_bytes: default_output_budget(),
            exec_poll_chunk_bytes: default_poll_chunk(),
            default_exec_timeout_seconds: default_exec_timeout(),
            memory_limit_bytes: default_memory_limit(),
            cpus: default_cpu_limit(),
            pids_limit: default_pids_limit(),
        }
    }
}

fn default_concurrent_execs() -> usize {
    4
}

fn default_output_budget() -> usize {
    64 * 1024 * 1024
}

fn default_poll_chunk() -> usize {
    1024 * 1024
}

fn default_exec_timeout() -> u64 {
    600
}

fn default_memory_limit() -> i64 {
    2 * 1024 * 1024 * 1024
}

fn default_cpu_limit() -> f64 {
    2.0
}

fn default_pids_limit() -> i64 {
    256
}

/// Lifecycle configuration: shutdown drain, GC, warm pool
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfiguration {
    /// Seconds in-flight executions get to finish during shutdown
    #[serde(default = "default_drain_grace")]
    pub drain_grace_seconds: u64,

    /// Age in days after which orphaned transient containers are removed
    #[serde(default = "default_transient_gc_days")]
    pub transient_gc_days: u64,

    /// Whether the warm pool runs
    #[serde(default)]
    pub warm_pool_enabled: bool,

    /// Warm pool target size
    #[serde(default = "default_warm_pool_size")]
    pub warm_pool_size: usize,
}

impl Default for LifecycleConfiguration {
    fn default() -> Self {
        Self {
            drain_grace_seconds: default_drain_grace(),
            transient_gc_days: default_transient_gc_days(),
            warm_pool_enabled: false,
            warm_pool_size: default_warm_pool_size(),
        }
    }
}

fn default_drain_grace() -> u64 {
    60
}

fn default_transient_gc_days() -> u64 {
    7
}

fn default_warm_pool_size() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Configuration = toml::from_str("").unwrap();
        assert_eq!(config.api.port, 8744);
        assert_eq!(config.execution.concurrent_execs_per_container, 4);
        assert_eq!(config.execution.exec_output_budget_bytes, 64 * 1024 * 1024);
        assert_eq!(config.lifecycle.drain_grace_seconds, 60);
        assert_eq!(config.system.workspace_mount_path, "/workspace");
        assert_eq!(config.docker.network_mode, "bridge");
        assert!(!config.lifecycle.warm_pool_enabled);
    }

    #[test]
    fn test_partial_override() {
        let config: Configuration = toml::from_str(
            r#"
            [execution]
            concurrent_execs_per_container = 8

            [lifecycle]
            warm_pool_enabled = true
            warm_pool_size = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.execution.concurrent_execs_per_container, 8);
        assert!(config.lifecycle.warm_pool_enabled);
        assert_eq!(config.lifecycle.warm_pool_size, 3);
        // untouched sections keep defaults
        assert_eq!(config.api.port, 8744);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: std::result::Result<Configuration, _> = toml::from_str(
            r#"
            [execution]
            concurent_execs_per_container = 8
            "#,
        );
        assert!(result.is_err());

        let result: std::result::Result<Configuration, _> = toml::from_str("banana = true");
        assert!(result.is_err());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            SystemConfiguration::normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
