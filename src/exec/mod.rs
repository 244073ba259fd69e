//! Execution engine
//!
//! Runs commands inside sandboxes asynchronously: a per-container
//! semaphore bounds concurrency, a reader task pumps daemon output into a
//! bounded ring buffer, and clients follow along by cursor. Terminal
//! transitions persist status, exit code and usage in one transaction.

pub mod ring;

pub use ring::{ExitInfo, Frame, PollResult, RingBuffer, StreamKind};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::database::{Database, ExecRow, ExecState, ExecUsage};
use crate::error::{DaemonError, Result};
use crate::events::{AuditEvent, Counters, EventBus};
use crate::runtime::{ContainerRuntime, ExecOutput, ExecProbe, ExecSpec, OutputStream, StatsSnapshot};

/// Grace between the polite signal and SIGKILL.
const ESCALATION_GRACE: Duration = Duration::from_secs(5);
/// How long after SIGKILL the reader waits before abandoning the stream.
const ABANDON_GRACE: Duration = Duration::from_secs(10);
/// Retired ring buffers are kept this long for late pollers.
const RING_RETENTION_SECONDS: i64 = 24 * 60 * 60;

/// Input for starting one execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Container id or alias
    pub target: String,
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    /// Never persisted or logged
    pub env: Vec<(String, String)>,
    pub as_root: bool,
    pub timeout_seconds: Option<u64>,
    pub idempotency_key: Option<String>,
}

/// Live state of one execution: its ring, cancellation token and
/// completion signal. Retained for a grace window after termination so
/// late pollers can still replay output.
pub struct ExecHandle {
    pub exec_id: String,
    pub container_id: String,
    ring: Arc<RingBuffer>,
    cancel: CancellationToken,
    finished: CancellationToken,
    shutdown: AtomicBool,
    retired_at: parking_lot::Mutex<Option<i64>>,
}

impl ExecHandle {
    fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    config: Arc<Configuration>,
    events: EventBus,
    counters: Arc<Counters>,
    live: DashMap<String, Arc<ExecHandle>>,
    slots: DashMap<String, Arc<Semaphore>>,
}

impl ExecutionEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<Database>,
        config: Arc<Configuration>,
        events: EventBus,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            runtime,
            db,
            config,
            events,
            counters,
            live: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Start an execution. Returns once it is persisted and scheduled,
    /// not once it completes.
    pub async fn start(self: &Arc<Self>, req: ExecRequest) -> Result<ExecRow> {
        if req.argv.is_empty() {
            return Err(DaemonError::InvalidRequest("cmd must not be empty".into()));
        }

        let now = chrono::Utc::now().timestamp();
        let exec_id = new_exec_id();

        // Claim the idempotency key before any runtime side effect; the
        // claim is atomic under the connection lock, so of any set of
        // racing callers exactly one runs the exec and the rest get the
        // winner's id.
        let claimed = match &req.idempotency_key {
            Some(key) => match self.db.idempotency().await.claim(key, &exec_id, now)? {
                crate::database::ClaimOutcome::Claimed => true,
                crate::database::ClaimOutcome::Existing(existing) => {
                    return self.existing_exec(key, existing).await;
                }
            },
            None => false,
        };

        let result = self.start_claimed(req.clone(), exec_id.clone(), now).await;
        if result.is_err() && claimed {
            // Free the key so a retry is not pinned to this failure
            if let Some(key) = &req.idempotency_key {
                if let Err(e) = self.db.idempotency().await.release(key, &exec_id) {
                    warn!(%key, "failed to release idempotency claim: {}", e);
                }
            }
        }
        result
    }

    /// The side-effecting part of [`start`], entered with the
    /// idempotency key (if any) already claimed for `exec_id`.
    async fn start_claimed(
        self: &Arc<Self>,
        req: ExecRequest,
        exec_id: String,
        now: i64,
    ) -> Result<ExecRow> {
        let container = self
            .db
            .containers()
            .await
            .resolve(&req.target)?
            .ok_or_else(|| DaemonError::NotFound(format!("container {}", req.target)))?;
        if container.status != crate::database::ContainerStatus::Running {
            return Err(DaemonError::Runtime(format!(
                "container {} is not running",
                container.id
            )));
        }
        let runtime_id = container
            .runtime_id
            .clone()
            .ok_or_else(|| DaemonError::internal("running container without runtime id"))?;

        // Non-blocking slot acquisition; at capacity the request fails
        let slot = self
            .slots
            .entry(container.id.clone())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(
                    self.config.execution.concurrent_execs_per_container,
                ))
            })
            .clone();
        let permit = slot
            .try_acquire_owned()
            .map_err(|_| DaemonError::ConcurrencyLimit(container.id.clone()))?;

        let timeout_seconds = req
            .timeout_seconds
            .unwrap_or(self.config.execution.default_exec_timeout_seconds);

        // Create and start the runtime exec before persisting anything, so
        // a daemon failure leaves neither an orphan exec nor a stale row.
        let spec = ExecSpec {
            argv: req.argv.clone(),
            cwd: req.cwd.clone(),
            env: req.env.clone(),
            as_root: req.as_root,
        };
        let runtime_exec_id = self.runtime.exec_create(&runtime_id, &spec).await?;
        let stream = self.runtime.exec_start(&runtime_exec_id).await?;
        let stats_start = self
            .runtime
            .stats_snapshot(&runtime_id)
            .await
            .unwrap_or_default();

        let row = ExecRow {
            id: exec_id.clone(),
            container_id: container.id.clone(),
            argv: req.argv,
            cwd: req.cwd,
            as_root: req.as_root,
            timeout_seconds: timeout_seconds as i64,
            status: ExecState::Running,
            exit_code: None,
            usage: None,
            failure_reason: None,
            started_at: now,
            ended_at: None,
        };
        self.db.execs().await.insert(&row)?;

        let handle = Arc::new(ExecHandle {
            exec_id: exec_id.clone(),
            container_id: container.id.clone(),
            ring: Arc::new(RingBuffer::new(self.config.execution.exec_output_budget_bytes)),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            shutdown: AtomicBool::new(false),
            retired_at: parking_lot::Mutex::new(None),
        });
        self.live.insert(exec_id.clone(), handle.clone());

        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .run_exec(
                    handle,
                    stream,
                    runtime_exec_id,
                    runtime_id,
                    stats_start,
                    Duration::from_secs(timeout_seconds),
                    permit,
                )
                .await;
        });

        Counters::incr(&self.counters.execs_started);
        self.events.publish(AuditEvent::ExecStarted {
            exec_id: exec_id.clone(),
            container_id: container.id.clone(),
        });
        info!(exec_id, container_id = %container.id, "execution started");

        Ok(row)
    }

    /// Resolve another caller's claim to its execution row. The winner
    /// may still be between claiming and persisting, so missing rows get
    /// a short bounded wait; a claim that disappears means the winner
    /// failed and released it.
    async fn existing_exec(&self, key: &str, mut exec_id: String) -> Result<ExecRow> {
        for _ in 0..50 {
            {
                let execs = self.db.execs().await;
                if let Some(row) = execs.get(&exec_id)? {
                    return Ok(row);
                }
            }
            let now = chrono::Utc::now().timestamp();
            match self.db.idempotency().await.lookup(key, now)? {
                Some(current) => exec_id = current,
                None => {
                    return Err(DaemonError::Runtime(
                        "a concurrent request with this idempotency key failed; retry".into(),
                    ))
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(DaemonError::NotFound(format!("execution {}", exec_id)))
    }

    /// Reader task: pumps daemon output into the ring, enforces timeout
    /// and cancellation with signal escalation, then performs the single
    /// terminal transition.
    #[allow(clippy::too_many_arguments)]
    async fn run_exec(
        self: Arc<Self>,
        handle: Arc<ExecHandle>,
        mut stream: OutputStream,
        runtime_exec_id: String,
        runtime_id: String,
        stats_start: StatsSnapshot,
        timeout: Duration,
        permit: OwnedSemaphorePermit,
    ) {
        let started = tokio::time::Instant::now();
        let timeout_sleep = tokio::time::sleep(timeout);
        tokio::pin!(timeout_sleep);

        let mut timed_out = false;
        let mut cancel_requested = false;
        let mut stream_error: Option<String> = None;
        // Signal escalation deadlines: TERM -> KILL -> abandon
        let mut kill_at: Option<tokio::time::Instant> = None;
        let mut abandon_at: Option<tokio::time::Instant> = None;

        loop {
            let escalate = async move {
                match (kill_at, abandon_at) {
                    (Some(t), _) => tokio::time::sleep_until(t).await,
                    (None, Some(t)) => tokio::time::sleep_until(t).await,
                    (None, None) => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                _ = handle.cancel.cancelled(), if !cancel_requested && !timed_out => {
                    cancel_requested = true;
                    let _ = self.db.execs().await.set_cancelling(&handle.exec_id);
                    self.signal(&runtime_exec_id, &runtime_id, "TERM").await;
                    kill_at = Some(tokio::time::Instant::now() + ESCALATION_GRACE);
                }

                _ = &mut timeout_sleep, if !timed_out && !cancel_requested => {
                    timed_out = true;
                    debug!(exec_id = %handle.exec_id, "execution exceeded its timeout");
                    self.signal(&runtime_exec_id, &runtime_id, "TERM").await;
                    kill_at = Some(tokio::time::Instant::now() + ESCALATION_GRACE);
                }

                _ = escalate, if kill_at.is_some() || abandon_at.is_some() => {
                    if kill_at.take().is_some() {
                        self.signal(&runtime_exec_id, &runtime_id, "KILL").await;
                        abandon_at = Some(tokio::time::Instant::now() + ABANDON_GRACE);
                    } else {
                        abandon_at = None;
                        stream_error = Some("process survived SIGKILL; abandoning stream".into());
                        break;
                    }
                }

                item = stream.next() => match item {
                    Some(Ok(output)) => {
                        let (kind, data) = match output {
                            ExecOutput::Stdout(b) => (StreamKind::Stdout, b),
                            ExecOutput::Stderr(b) => (StreamKind::Stderr, b),
                        };
                        if let Some((_, evicted)) = handle.ring.push(kind, data) {
                            Counters::incr(&self.counters.frames_appended);
                            if evicted > 0 {
                                Counters::add(&self.counters.frames_evicted, evicted as u64);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        stream_error = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
        }

        // The stream has settled; read the exit code, giving the daemon a
        // moment to record it.
        let mut probe = ExecProbe::default();
        for _ in 0..5 {
            match self.runtime.exec_inspect(&runtime_exec_id).await {
                Ok(p) if !p.running => {
                    probe = p;
                    break;
                }
                Ok(p) => {
                    probe = p;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    debug!(exec_id = %handle.exec_id, "exec inspect failed: {}", e);
                    break;
                }
            }
        }

        let stats_end = self
            .runtime
            .stats_snapshot(&runtime_id)
            .await
            .unwrap_or(stats_start);
        let usage = ExecUsage {
            cpu_ms: stats_end.cpu_ns.saturating_sub(stats_start.cpu_ns) / 1_000_000,
            mem_peak_bytes: stats_end.mem_peak_bytes,
            wall_ms: started.elapsed().as_millis() as u64,
            timed_out,
        };

        let (status, failure_reason) = if cancel_requested {
            (ExecState::Cancelled, None)
        } else if timed_out {
            (ExecState::TimedOut, None)
        } else if let Some(reason) = stream_error {
            (ExecState::Failed, Some(reason))
        } else {
            (ExecState::Exited, None)
        };

        let now = chrono::Utc::now().timestamp();
        match self.db.execs().await.finish(
            &handle.exec_id,
            status,
            probe.exit_code,
            usage,
            failure_reason.as_deref(),
            now,
        ) {
            Ok(true) => {}
            Ok(false) => warn!(exec_id = %handle.exec_id, "terminal transition rejected; row already terminal"),
            Err(e) => warn!(exec_id = %handle.exec_id, "failed to persist terminal state: {}", e),
        }

        let reason = if handle.shutdown.load(Ordering::Relaxed) {
            Some("shutdown")
        } else {
            None
        };
        handle.ring.push_terminal(ExitInfo {
            exit_code: probe.exit_code,
            usage,
            reason,
        });

        if status == ExecState::Failed {
            Counters::incr(&self.counters.execs_failed);
        }
        self.events.publish(AuditEvent::ExecFinished {
            exec_id: handle.exec_id.clone(),
            container_id: handle.container_id.clone(),
            status,
            exit_code: probe.exit_code,
        });

        *handle.retired_at.lock() = Some(now);
        handle.finished.cancel();
        drop(permit);

        info!(
            exec_id = %handle.exec_id,
            status = %status,
            exit_code = ?probe.exit_code,
            wall_ms = usage.wall_ms,
            "execution finished"
        );
    }

    async fn signal(&self, runtime_exec_id: &str, runtime_id: &str, signal: &str) {
        match self.runtime.exec_inspect(runtime_exec_id).await {
            Ok(probe) if probe.running => {
                if let Some(pid) = probe.pid {
                    if let Err(e) = self.runtime.signal_exec(runtime_id, pid, signal).await {
                        warn!(runtime_exec_id, signal, "failed to signal process: {}", e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => debug!(runtime_exec_id, "inspect before signal failed: {}", e),
        }
    }

    /// Request cancellation. Safe to repeat: once terminal, the current
    /// row is returned unchanged.
    pub async fn cancel(&self, exec_id: &str) -> Result<ExecRow> {
        let row = self
            .db
            .execs()
            .await
            .get(exec_id)?
            .ok_or_else(|| DaemonError::NotFound(format!("execution {}", exec_id)))?;
        if row.status.is_terminal() {
            return Ok(row);
        }

        let handle = self.live.get(exec_id).map(|e| e.value().clone());
        if let Some(handle) = handle {
            self.db.execs().await.set_cancelling(exec_id)?;
            handle.cancel.cancel();
        }

        let row = self
            .db
            .execs()
            .await
            .get(exec_id)?
            .ok_or_else(|| DaemonError::NotFound(format!("execution {}", exec_id)))?;
        Ok(row)
    }

    /// Poll output frames after the given cursor. Ring buffers are not
    /// durable: an exec whose ring is gone (restart or retention expiry)
    /// reports `not_found` even when its database row remains.
    pub async fn poll(&self, exec_id: &str, after_seq: u64) -> Result<PollResult> {
        let handle = self
            .live
            .get(exec_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| DaemonError::NotFound(format!("execution {}", exec_id)))?;

        Counters::incr(&self.counters.polls_served);
        Ok(handle
            .ring
            .poll(after_seq, self.config.execution.exec_poll_chunk_bytes))
    }

    /// Cancel every live execution of a container; used by kill.
    pub fn cancel_all_for(&self, container_id: &str) -> usize {
        let mut cancelled = 0;
        for entry in self.live.iter() {
            let handle = entry.value();
            if handle.container_id == container_id && !handle.is_finished() {
                handle.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Forget the per-container semaphore after the container is gone.
    pub fn release_container(&self, container_id: &str) {
        self.slots.remove(container_id);
    }

    /// Number of executions still running.
    pub fn active_count(&self) -> usize {
        self.live.iter().filter(|e| !e.value().is_finished()).count()
    }

    /// Drain for shutdown: wait for in-flight executions up to `grace`,
    /// then cancel the rest (their terminal frame carries `shutdown`).
    /// Returns how many had to be cancelled.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        let handles: Vec<_> = self.live.iter().map(|e| e.value().clone()).collect();

        for handle in &handles {
            if handle.is_finished() {
                continue;
            }
            tokio::select! {
                _ = handle.finished.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let stragglers: Vec<_> = handles.iter().filter(|h| !h.is_finished()).collect();
        let cancelled = stragglers.len();
        for handle in &stragglers {
            handle.shutdown.store(true, Ordering::Relaxed);
            let _ = self.db.execs().await.set_cancelling(&handle.exec_id);
            handle.cancel.cancel();
        }

        // Bounded wait for the cancellations to settle
        let settle = tokio::time::Instant::now() + ESCALATION_GRACE + Duration::from_secs(2);
        for handle in stragglers {
            if handle.is_finished() {
                continue;
            }
            tokio::select! {
                _ = handle.finished.cancelled() => {}
                _ = tokio::time::sleep_until(settle) => break,
            }
        }

        cancelled
    }

    /// Drop ring buffers whose retention window has passed.
    pub fn purge_retired(&self, now: i64) -> usize {
        let expired: Vec<String> = self
            .live
            .iter()
            .filter(|e| {
                let retired = *e.value().retired_at.lock();
                retired.map(|t| now - t > RING_RETENTION_SECONDS).unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect();

        for exec_id in &expired {
            self.live.remove(exec_id);
        }
        expired.len()
    }
}

fn new_exec_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("e_{}", &id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::database::{ContainerRow, ContainerStatus};
    use crate::runtime::fake::{ExecScript, FakeRuntime};

    struct Fixture {
        engine: Arc<ExecutionEngine>,
        runtime: Arc<FakeRuntime>,
        db: Arc<Database>,
    }

    async fn fixture(limit: usize) -> Fixture {
        let runtime = Arc::new(FakeRuntime::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut config = Configuration::default_for_tests(std::env::temp_dir());
        config.execution.concurrent_execs_per_container = limit;
        let config = Arc::new(config);
        let counters = Arc::new(Counters::default());
        let engine = Arc::new(ExecutionEngine::new(
            runtime.clone(),
            db.clone(),
            config,
            EventBus::new(),
            counters,
        ));

        let runtime_id = runtime.add_container("c_1", "python:3.11-slim", false, false, true, 0);
        db.containers()
            .await
            .insert(&ContainerRow {
                id: "c_1".into(),
                runtime_id: Some(runtime_id),
                alias: Some("w1".into()),
                image: "python:3.11-slim".into(),
                persistent: false,
                warm: false,
                status: ContainerStatus::Running,
                ttl_seconds: None,
                workspace_dir: "c_1".into(),
                created_at: 0,
                last_seen_at: 0,
            })
            .unwrap();

        Fixture { engine, runtime, db }
    }

    fn request(key: Option<&str>) -> ExecRequest {
        ExecRequest {
            target: "c_1".into(),
            argv: vec!["sh".into(), "-c".into(), "true".into()],
            cwd: None,
            env: Vec::new(),
            as_root: false,
            timeout_seconds: Some(30),
            idempotency_key: key.map(String::from),
        }
    }

    async fn wait_terminal(fx: &Fixture, exec_id: &str) -> ExecRow {
        for _ in 0..500 {
            let row = fx.db.execs().await.get(exec_id).unwrap().unwrap();
            if row.status.is_terminal() {
                return row;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} never reached a terminal state", exec_id);
    }

    #[tokio::test]
    async fn test_happy_path_frames_and_terminal() {
        let fx = fixture(4).await;
        fx.runtime.push_script(ExecScript {
            frames: vec![
                ExecOutput::Stdout(Bytes::from_static(b"hello")),
                ExecOutput::Stderr(Bytes::from_static(b"world")),
            ],
            exit_code: 0,
            hang: false,
        });

        let row = fx.engine.start(request(None)).await.unwrap();
        assert_eq!(row.status, ExecState::Running);

        let row = wait_terminal(&fx, &row.id).await;
        assert_eq!(row.status, ExecState::Exited);
        assert_eq!(row.exit_code, Some(0));
        assert!(row.ended_at.is_some());
        assert!(row.usage.is_some());

        let result = fx.engine.poll(&row.id, 0).await.unwrap();
        assert!(result.complete);
        assert_eq!(result.frames.len(), 3);
        assert_eq!(result.frames[0].seq, 1);
        assert_eq!(result.frames[0].stream, StreamKind::Stdout);
        assert_eq!(&result.frames[0].data[..], b"hello");
        assert_eq!(result.frames[1].stream, StreamKind::Stderr);
        assert_eq!(&result.frames[1].data[..], b"world");
        assert_eq!(result.frames[2].stream, StreamKind::Control);
        assert_eq!(result.frames[2].exit.as_ref().unwrap().exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_concurrency_limit_rejects() {
        let fx = fixture(1).await;
        fx.runtime.push_script(ExecScript {
            hang: true,
            ..Default::default()
        });

        let first = fx.engine.start(request(None)).await.unwrap();

        let err = fx.engine.start(request(None)).await.unwrap_err();
        assert_eq!(err.code(), "concurrency_limit");

        // Cancelling the first frees the slot
        fx.engine.cancel(&first.id).await.unwrap();
        wait_terminal(&fx, &first.id).await;

        fx.runtime.push_script(ExecScript::default());
        fx.engine.start(request(None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_idempotency_key_reuses_exec() {
        let fx = fixture(4).await;
        fx.runtime.push_script(ExecScript::default());

        let first = fx.engine.start(request(Some("k-42"))).await.unwrap();
        wait_terminal(&fx, &first.id).await;

        let second = fx.engine.start(request(Some("k-42"))).await.unwrap();
        assert_eq!(first.id, second.id);
        // No second runtime exec was created
        assert_eq!(fx.runtime.exec_create_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_idempotent_starts_share_one_exec() {
        let fx = fixture(4).await;
        fx.runtime.push_script(ExecScript::default());
        // A second script would only be consumed if the loser also ran
        fx.runtime.push_script(ExecScript {
            exit_code: 99,
            ..Default::default()
        });

        let e1 = fx.engine.clone();
        let e2 = fx.engine.clone();
        let (a, b) = tokio::join!(
            e1.start(request(Some("k-42"))),
            e2.start(request(Some("k-42")))
        );
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.id, b.id);
        // The loser performed no runtime side effects
        assert_eq!(fx.runtime.exec_create_count(), 1);
        assert_eq!(fx.db.execs().await.list(None, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_releases_idempotency_claim() {
        let fx = fixture(4).await;
        fx.runtime.set_fail_exec_create(true);

        let err = fx.engine.start(request(Some("k-9"))).await.unwrap_err();
        assert_eq!(err.code(), "runtime_error");

        // The key is free again, so a retry runs fresh work
        fx.runtime.set_fail_exec_create(false);
        fx.runtime.push_script(ExecScript::default());
        let row = fx.engine.start(request(Some("k-9"))).await.unwrap();
        let row = wait_terminal(&fx, &row.id).await;
        assert_eq!(row.status, ExecState::Exited);
    }

    #[tokio::test]
    async fn test_exec_start_failure_leaves_no_row() {
        let fx = fixture(4).await;
        fx.runtime.set_fail_exec_create(true);

        let err = fx.engine.start(request(None)).await.unwrap_err();
        assert_eq!(err.code(), "runtime_error");
        assert!(fx.db.execs().await.list(None, None).unwrap().is_empty());

        // The slot was released with the failed attempt
        fx.runtime.set_fail_exec_create(false);
        fx.runtime.push_script(ExecScript::default());
        fx.engine.start(request(None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let fx = fixture(4).await;
        fx.runtime.push_script(ExecScript {
            frames: vec![ExecOutput::Stdout(Bytes::from_static(b"busy"))],
            hang: true,
            ..Default::default()
        });

        let row = fx.engine.start(request(None)).await.unwrap();
        fx.engine.cancel(&row.id).await.unwrap();

        let row = wait_terminal(&fx, &row.id).await;
        assert_eq!(row.status, ExecState::Cancelled);

        // Second cancel is a no-op returning the terminal row
        let again = fx.engine.cancel(&row.id).await.unwrap();
        assert_eq!(again.status, ExecState::Cancelled);
        assert_eq!(again.ended_at, row.ended_at);

        let result = fx.engine.poll(&row.id, 0).await.unwrap();
        assert!(result.complete);
        assert_eq!(result.frames.last().unwrap().stream, StreamKind::Control);
    }

    #[tokio::test]
    async fn test_timeout_terminates() {
        let fx = fixture(4).await;
        fx.runtime.push_script(ExecScript {
            hang: true,
            ..Default::default()
        });

        let mut req = request(None);
        req.timeout_seconds = Some(0);
        let row = fx.engine.start(req).await.unwrap();

        let row = wait_terminal(&fx, &row.id).await;
        assert_eq!(row.status, ExecState::TimedOut);
        assert!(row.usage.unwrap().timed_out);
        // Observed exit code comes from the signal
        assert_eq!(row.exit_code, Some(143));
    }

    #[tokio::test]
    async fn test_poll_unknown_exec_not_found() {
        let fx = fixture(4).await;
        let err = fx.engine.poll("e_missing", 0).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_drain_cancels_stragglers_with_shutdown_frame() {
        let fx = fixture(4).await;
        fx.runtime.push_script(ExecScript {
            hang: true,
            ..Default::default()
        });

        let row = fx.engine.start(request(None)).await.unwrap();
        let cancelled = fx.engine.drain(Duration::from_millis(50)).await;
        assert_eq!(cancelled, 1);

        let row = wait_terminal(&fx, &row.id).await;
        assert_eq!(row.status, ExecState::Cancelled);

        let result = fx.engine.poll(&row.id, 0).await.unwrap();
        let terminal = result.frames.last().unwrap();
        assert_eq!(terminal.stream, StreamKind::Control);
        assert_eq!(terminal.exit.as_ref().unwrap().reason, Some("shutdown"));
    }
}
