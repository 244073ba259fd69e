//! Audit event bus and counters
//!
//! A broadcast channel carries structured audit events from well-defined
//! hook points; atomic counters back the `status` diagnostics surface.
//! Events never carry env values or file contents.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::database::ExecState;

/// Events published through the audit bus
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// A sandbox was created and started
    ContainerSpawned {
        container_id: String,
        image: String,
        persistent: bool,
        /// Fulfilled from the warm pool rather than a cold spawn
        from_warm_pool: bool,
    },

    /// An existing runtime container was adopted at boot
    ContainerAdopted { container_id: String },

    /// A sandbox was stopped and removed
    ContainerKilled { container_id: String, force: bool },

    /// A client session attached
    ClientAttached {
        container_id: String,
        client_name: String,
    },

    /// A command started inside a sandbox
    ExecStarted {
        exec_id: String,
        container_id: String,
    },

    /// A command reached a terminal state
    ExecFinished {
        exec_id: String,
        container_id: String,
        status: ExecState,
        exit_code: Option<i64>,
    },

    /// A workspace file was written
    FileWritten {
        container_id: String,
        path: String,
        size: u64,
    },

    /// A workspace path was deleted
    FileDeleted { container_id: String, path: String },

    /// A workspace subtree was exported as an archive
    ArchiveExported { container_id: String, path: String },

    /// An archive was imported into a workspace
    ArchiveImported {
        container_id: String,
        path: String,
        entries: usize,
    },

    /// A reconciliation pass finished
    ReconcilePass {
        adopted: usize,
        removed: usize,
        marked_stopped: usize,
    },

    /// Shutdown drain started
    DrainStarted,

    /// Shutdown drain finished
    DrainFinished { cancelled: usize },
}

/// Event bus for broadcasting audit events to multiple subscribers
///
/// Uses tokio broadcast channels; subscribers that fall behind will lose
/// messages (lagged).
pub struct EventBus {
    sender: broadcast::Sender<AuditEvent>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<AuditEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    /// Subscribe to the event bus
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no subscribers, the event is silently dropped.
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: AuditEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}

/// Process-wide counters surfaced by the `status` admin tool
#[derive(Debug, Default)]
pub struct Counters {
    pub containers_spawned: AtomicU64,
    pub containers_adopted: AtomicU64,
    pub containers_killed: AtomicU64,
    pub warm_claims: AtomicU64,
    pub execs_started: AtomicU64,
    pub execs_failed: AtomicU64,
    pub frames_appended: AtomicU64,
    pub frames_evicted: AtomicU64,
    pub polls_served: AtomicU64,
    pub fs_reads: AtomicU64,
    pub fs_writes: AtomicU64,
    pub fs_deletes: AtomicU64,
    pub path_violations: AtomicU64,
    pub archives_exported: AtomicU64,
    pub archives_imported: AtomicU64,
    pub reconcile_passes: AtomicU64,
}

/// Serializable point-in-time view of [`Counters`]
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub containers_spawned: u64,
    pub containers_adopted: u64,
    pub containers_killed: u64,
    pub warm_claims: u64,
    pub execs_started: u64,
    pub execs_failed: u64,
    pub frames_appended: u64,
    pub frames_evicted: u64,
    pub polls_served: u64,
    pub fs_reads: u64,
    pub fs_writes: u64,
    pub fs_deletes: u64,
    pub path_violations: u64,
    pub archives_exported: u64,
    pub archives_imported: u64,
    pub reconcile_passes: u64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            containers_spawned: load(&self.containers_spawned),
            containers_adopted: load(&self.containers_adopted),
            containers_killed: load(&self.containers_killed),
            warm_claims: load(&self.warm_claims),
            execs_started: load(&self.execs_started),
            execs_failed: load(&self.execs_failed),
            frames_appended: load(&self.frames_appended),
            frames_evicted: load(&self.frames_evicted),
            polls_served: load(&self.polls_served),
            fs_reads: load(&self.fs_reads),
            fs_writes: load(&self.fs_writes),
            fs_deletes: load(&self.fs_deletes),
            path_violations: load(&self.path_violations),
            archives_exported: load(&self.archives_exported),
            archives_imported: load(&self.archives_imported),
            reconcile_passes: load(&self.reconcile_passes),
        }
    }
}
