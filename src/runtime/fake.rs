//! In-memory runtime used by unit tests

use std::collections::{HashMap, VecDeque};

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ContainerRuntime, CreateSpec, ExecOutput, ExecProbe, ExecSpec, OutputStream, RuntimeContainer,
    RuntimeError, RuntimeResult, StatsSnapshot, CONTAINER_ID_LABEL, NAMESPACE_LABEL,
    PERSISTENT_LABEL, WARM_LABEL,
};

/// Scripted behavior for the next exec started against the fake.
pub struct ExecScript {
    pub frames: Vec<ExecOutput>,
    pub exit_code: i64,
    /// Keep the output stream open until a signal arrives.
    pub hang: bool,
}

impl Default for ExecScript {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            exit_code: 0,
            hang: false,
        }
    }
}

struct FakeExec {
    runtime_id: String,
    pid: i64,
    running: bool,
    exit_code: Option<i64>,
    script: Option<ExecScript>,
    hang_tx: Option<mpsc::UnboundedSender<RuntimeResult<ExecOutput>>>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, RuntimeContainer>,
    scripts: VecDeque<ExecScript>,
    execs: HashMap<String, FakeExec>,
    created_specs: Vec<CreateSpec>,
    removed: Vec<String>,
    seq: u64,
    stats_calls: u64,
    unavailable: bool,
    fail_exec_create: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: ExecScript) {
        self.state.lock().scripts.push_back(script);
    }

    pub fn set_unavailable(&self, value: bool) {
        self.state.lock().unavailable = value;
    }

    pub fn set_fail_exec_create(&self, value: bool) {
        self.state.lock().fail_exec_create = value;
    }

    /// Seed a container as if it already existed in the runtime.
    pub fn add_container(
        &self,
        container_id: &str,
        image: &str,
        persistent: bool,
        warm: bool,
        running: bool,
        created_at_unix: i64,
    ) -> String {
        let mut state = self.state.lock();
        state.seq += 1;
        let runtime_id = format!("rt_{}", state.seq);

        let mut labels = HashMap::new();
        labels.insert(NAMESPACE_LABEL.to_string(), "true".to_string());
        labels.insert(CONTAINER_ID_LABEL.to_string(), container_id.to_string());
        labels.insert(PERSISTENT_LABEL.to_string(), persistent.to_string());
        if warm {
            labels.insert(WARM_LABEL.to_string(), "true".to_string());
        }

        state.containers.insert(
            runtime_id.clone(),
            RuntimeContainer {
                runtime_id: runtime_id.clone(),
                name: format!("devbench-{}", container_id),
                image: image.to_string(),
                running,
                created_at_unix,
                labels,
            },
        );
        runtime_id
    }

    pub fn created_specs(&self) -> Vec<CreateSpec> {
        self.state.lock().created_specs.clone()
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    pub fn exec_create_count(&self) -> usize {
        let state = self.state.lock();
        state.execs.len()
    }

    pub fn container_running(&self, runtime_id: &str) -> Option<bool> {
        self.state.lock().containers.get(runtime_id).map(|c| c.running)
    }

    fn check_available(state: &FakeState) -> RuntimeResult<()> {
        if state.unavailable {
            return Err(RuntimeError::Unavailable("fake runtime offline".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        Self::check_available(&self.state.lock())
    }

    async fn create(&self, spec: &CreateSpec) -> RuntimeResult<String> {
        // Suspend once so racing callers genuinely interleave in tests
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.created_specs.push(spec.clone());
        state.seq += 1;
        let runtime_id = format!("rt_{}", state.seq);

        let mut labels = HashMap::new();
        labels.insert(NAMESPACE_LABEL.to_string(), "true".to_string());
        labels.insert(CONTAINER_ID_LABEL.to_string(), spec.container_id.clone());
        labels.insert(PERSISTENT_LABEL.to_string(), spec.persistent.to_string());
        if spec.warm {
            labels.insert(WARM_LABEL.to_string(), "true".to_string());
        }

        state.containers.insert(
            runtime_id.clone(),
            RuntimeContainer {
                runtime_id: runtime_id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                running: false,
                created_at_unix: 0,
                labels,
            },
        );
        Ok(runtime_id)
    }

    async fn start(&self, runtime_id: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        match state.containers.get_mut(runtime_id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(runtime_id.to_string())),
        }
    }

    async fn stop(&self, runtime_id: &str, _timeout_seconds: i64) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if let Some(c) = state.containers.get_mut(runtime_id) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, runtime_id: &str, _force: bool) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.containers.remove(runtime_id);
        state.removed.push(runtime_id.to_string());
        Ok(())
    }

    async fn inspect(&self, runtime_id: &str) -> RuntimeResult<RuntimeContainer> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        state
            .containers
            .get(runtime_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))
    }

    async fn list_labeled(&self, label: &str) -> RuntimeResult<Vec<RuntimeContainer>> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        Ok(state
            .containers
            .values()
            .filter(|c| c.labels.get(key).map(|v| v == value).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn exec_create(&self, runtime_id: &str, _spec: &ExecSpec) -> RuntimeResult<String> {
        // Suspend once so racing callers genuinely interleave in tests
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if state.fail_exec_create {
            return Err(RuntimeError::Api("daemon returned 500: boom".into()));
        }
        if !state.containers.contains_key(runtime_id) {
            return Err(RuntimeError::NotFound(runtime_id.to_string()));
        }

        let script = state.scripts.pop_front().unwrap_or_default();
        state.seq += 1;
        let exec_id = format!("fx_{}", state.seq);
        let pid = 1000 + state.seq as i64;
        state.execs.insert(
            exec_id.clone(),
            FakeExec {
                runtime_id: runtime_id.to_string(),
                pid,
                running: true,
                exit_code: None,
                script: Some(script),
                hang_tx: None,
            },
        );
        Ok(exec_id)
    }

    async fn exec_start(&self, exec_id: &str) -> RuntimeResult<OutputStream> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;

        let exec = state
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| RuntimeError::NotFound(exec_id.to_string()))?;
        let script = exec
            .script
            .take()
            .ok_or_else(|| RuntimeError::Conflict("exec already started".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for frame in script.frames {
            let _ = tx.send(Ok(frame));
        }
        if script.hang {
            // Stream stays open until signal_exec closes it
            exec.hang_tx = Some(tx);
        } else {
            exec.running = false;
            exec.exit_code = Some(script.exit_code);
        }

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(stream)
    }

    async fn exec_inspect(&self, exec_id: &str) -> RuntimeResult<ExecProbe> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| RuntimeError::NotFound(exec_id.to_string()))?;
        Ok(ExecProbe {
            running: exec.running,
            exit_code: exec.exit_code,
            pid: Some(exec.pid),
        })
    }

    async fn signal_exec(&self, runtime_id: &str, pid: i64, signal: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        for exec in state.execs.values_mut() {
            if exec.runtime_id == runtime_id && exec.pid == pid && exec.running {
                exec.running = false;
                exec.exit_code = Some(if signal == "KILL" { 137 } else { 143 });
                // Closing the sender ends the output stream
                exec.hang_tx = None;
            }
        }
        Ok(())
    }

    async fn stats_snapshot(&self, _runtime_id: &str) -> RuntimeResult<StatsSnapshot> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.stats_calls += 1;
        Ok(StatsSnapshot {
            cpu_ns: state.stats_calls * 25_000_000,
            mem_bytes: 12 * 1024 * 1024,
            mem_peak_bytes: 16 * 1024 * 1024,
        })
    }
}
