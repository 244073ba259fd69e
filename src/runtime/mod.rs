//! Container runtime abstraction
//!
//! A narrow, capability-oriented surface over the container daemon. The
//! trait carries no policy; it translates daemon calls and normalizes
//! daemon errors into a stable taxonomy.

pub mod docker;
#[cfg(test)]
pub mod fake;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use docker::DockerRuntime;

/// Label marking every container owned by this daemon.
pub const NAMESPACE_LABEL: &str = "devbench";
/// Label carrying the opaque container id, so the runtime alone can
/// recover identity across restarts.
pub const CONTAINER_ID_LABEL: &str = "devbench.container_id";
/// Label recording persistent-vs-transient.
pub const PERSISTENT_LABEL: &str = "devbench.persistent";
/// Label marking warm-pool members.
pub const WARM_LABEL: &str = "devbench.warm";

/// Error type for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("not found in runtime: {0}")]
    NotFound(String),

    #[error("runtime conflict: {0}")]
    Conflict(String),

    #[error("runtime api error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Everything needed to create one sandbox container.
///
/// The adapter applies the hardened defaults itself: non-root user,
/// dropped capabilities, read-only root filesystem with a tmpfs `/tmp`,
/// never privileged, and the workspace bind mount as the only writable
/// path. The sandbox idles on `sleep infinity` until exec'd into.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Runtime-side container name
    pub name: String,

    /// Image reference, already past policy resolution
    pub image: String,

    /// Opaque container id, recorded as a label
    pub container_id: String,

    /// Whether this sandbox survives age-based GC
    pub persistent: bool,

    /// Whether this sandbox belongs to the warm pool
    pub warm: bool,

    /// Host directory bind-mounted as the workspace
    pub workspace_source: PathBuf,

    /// Mount point inside the container, typically `/workspace`
    pub workspace_target: String,

    /// Docker network mode
    pub network_mode: String,

    /// Memory limit in bytes (0 = unlimited)
    pub memory_limit_bytes: i64,

    /// CPU allowance in whole-core units (0 = unlimited)
    pub cpus: f64,

    /// PID limit
    pub pids_limit: i64,
}

/// A container as the runtime reports it.
#[derive(Debug, Clone)]
pub struct RuntimeContainer {
    pub runtime_id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub created_at_unix: i64,
    pub labels: HashMap<String, String>,
}

impl RuntimeContainer {
    /// Opaque container id recovered from labels, if present.
    pub fn labeled_container_id(&self) -> Option<&str> {
        self.labels.get(CONTAINER_ID_LABEL).map(|s| s.as_str())
    }

    pub fn labeled_persistent(&self) -> bool {
        self.labels.get(PERSISTENT_LABEL).map(|v| v == "true").unwrap_or(false)
    }

    pub fn labeled_warm(&self) -> bool {
        self.labels.get(WARM_LABEL).map(|v| v == "true").unwrap_or(false)
    }
}

/// One command to run inside a container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub as_root: bool,
}

/// Point-in-time view of a runtime exec.
#[derive(Debug, Clone, Default)]
pub struct ExecProbe {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub pid: Option<i64>,
}

/// Point-in-time resource reading for a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub cpu_ns: u64,
    pub mem_bytes: u64,
    pub mem_peak_bytes: u64,
}

/// One chunk of exec output. Within a stream, chunks arrive in order;
/// interleaving between the two streams is by arrival.
#[derive(Debug, Clone)]
pub enum ExecOutput {
    Stdout(Bytes),
    Stderr(Bytes),
}

pub type OutputStream = BoxStream<'static, RuntimeResult<ExecOutput>>;

/// Capability surface over the container daemon.
///
/// All methods are async and never block the calling task on daemon I/O.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check daemon reachability.
    async fn ping(&self) -> RuntimeResult<()>;

    // ========================================================================
    // Container lifecycle
    // ========================================================================

    /// Create the container (without starting it), returning the daemon id.
    async fn create(&self, spec: &CreateSpec) -> RuntimeResult<String>;

    async fn start(&self, runtime_id: &str) -> RuntimeResult<()>;

    /// Stop with a graceful timeout; already-stopped is not an error.
    async fn stop(&self, runtime_id: &str, timeout_seconds: i64) -> RuntimeResult<()>;

    /// Remove the container and its anonymous volumes; absent is not an error.
    async fn remove(&self, runtime_id: &str, force: bool) -> RuntimeResult<()>;

    async fn inspect(&self, runtime_id: &str) -> RuntimeResult<RuntimeContainer>;

    /// List all containers (running or not) carrying the given label.
    async fn list_labeled(&self, label: &str) -> RuntimeResult<Vec<RuntimeContainer>>;

    // ========================================================================
    // Execution
    // ========================================================================

    async fn exec_create(&self, runtime_id: &str, spec: &ExecSpec) -> RuntimeResult<String>;

    /// Start the exec and return its interleaved output stream.
    async fn exec_start(&self, exec_id: &str) -> RuntimeResult<OutputStream>;

    async fn exec_inspect(&self, exec_id: &str) -> RuntimeResult<ExecProbe>;

    /// Deliver a signal to a process inside the container.
    async fn signal_exec(&self, runtime_id: &str, pid: i64, signal: &str) -> RuntimeResult<()>;

    // ========================================================================
    // Accounting
    // ========================================================================

    async fn stats_snapshot(&self, runtime_id: &str) -> RuntimeResult<StatsSnapshot>;
}
