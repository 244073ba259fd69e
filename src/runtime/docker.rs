//! Docker implementation of the container runtime

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, info, warn};

use super::{
    ContainerRuntime, CreateSpec, ExecOutput, ExecProbe, ExecSpec, OutputStream, RuntimeContainer,
    RuntimeError, RuntimeResult, StatsSnapshot, CONTAINER_ID_LABEL, NAMESPACE_LABEL,
    PERSISTENT_LABEL, WARM_LABEL,
};

/// Non-root user every sandbox process runs as.
const SANDBOX_USER: &str = "1000:1000";
/// tmpfs mounted at /tmp since the root filesystem is read-only.
const TMPFS_OPTS: &str = "rw,noexec,nosuid,size=268435456";

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using local platform defaults.
    pub fn connect() -> RuntimeResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(normalize)?;
        Ok(Self { client })
    }

    /// Connect to an explicit socket path.
    pub fn connect_socket(socket_path: &str) -> RuntimeResult<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(normalize)?;
        Ok(Self { client })
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(normalize(e));
            }
        }
        Ok(())
    }

    fn labels_for(spec: &CreateSpec) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(NAMESPACE_LABEL.to_string(), "true".to_string());
        labels.insert(CONTAINER_ID_LABEL.to_string(), spec.container_id.clone());
        labels.insert(PERSISTENT_LABEL.to_string(), spec.persistent.to_string());
        if spec.warm {
            labels.insert(WARM_LABEL.to_string(), "true".to_string());
        }
        labels
    }
}

/// Normalize daemon errors into the stable taxonomy. Anything the daemon
/// did not answer itself is a transport failure, i.e. the runtime is
/// unavailable.
fn normalize(e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api(format!("daemon returned {}: {}", status_code, message)),
        e @ bollard::errors::Error::JsonDataError { .. } => RuntimeError::Api(e.to_string()),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.client.ping().await.map_err(normalize)?;
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec) -> RuntimeResult<String> {
        self.pull_image(&spec.image).await?;

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}",
                spec.workspace_source.display(),
                spec.workspace_target
            )]),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([("/tmp".to_string(), TMPFS_OPTS.to_string())])),
            cap_drop: Some(vec!["ALL".to_string()]),
            privileged: Some(false),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            network_mode: Some(spec.network_mode.clone()),
            memory: (spec.memory_limit_bytes > 0).then_some(spec.memory_limit_bytes),
            nano_cpus: (spec.cpus > 0.0).then_some((spec.cpus * 1_000_000_000.0) as i64),
            pids_limit: (spec.pids_limit > 0).then_some(spec.pids_limit),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            user: Some(SANDBOX_USER.to_string()),
            // The sandbox idles until exec'd into
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(spec.workspace_target.clone()),
            labels: Some(Self::labels_for(spec)),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });

        let response = self
            .client
            .create_container(options, config)
            .await
            .map_err(normalize)?;

        for warning in &response.warnings {
            warn!(container = %spec.container_id, "daemon warning: {}", warning);
        }

        info!(container = %spec.container_id, runtime_id = %response.id, image = %spec.image, "created container");
        Ok(response.id)
    }

    async fn start(&self, runtime_id: &str) -> RuntimeResult<()> {
        self.client
            .start_container::<String>(runtime_id, None)
            .await
            .map_err(normalize)?;
        Ok(())
    }

    async fn stop(&self, runtime_id: &str, timeout_seconds: i64) -> RuntimeResult<()> {
        let options = Some(StopContainerOptions { t: timeout_seconds });
        match self.client.stop_container(runtime_id, options).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(normalize(e)),
        }
    }

    async fn remove(&self, runtime_id: &str, force: bool) -> RuntimeResult<()> {
        let options = Some(RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        });
        match self.client.remove_container(runtime_id, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(runtime_id, "container already gone");
                Ok(())
            }
            Err(e) => Err(normalize(e)),
        }
    }

    async fn inspect(&self, runtime_id: &str) -> RuntimeResult<RuntimeContainer> {
        let inspect = self
            .client
            .inspect_container(runtime_id, None)
            .await
            .map_err(normalize)?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let created_at_unix = inspect
            .created
            .as_deref()
            .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);

        let config = inspect.config.unwrap_or_default();

        Ok(RuntimeContainer {
            runtime_id: inspect.id.unwrap_or_else(|| runtime_id.to_string()),
            name: inspect
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.image.unwrap_or_default(),
            running,
            created_at_unix,
            labels: config.labels.unwrap_or_default(),
        })
    }

    async fn list_labeled(&self, label: &str) -> RuntimeResult<Vec<RuntimeContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        let containers = self
            .client
            .list_containers(options)
            .await
            .map_err(normalize)?;

        Ok(containers
            .into_iter()
            .map(|c| RuntimeContainer {
                runtime_id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|n| n.first().cloned())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                image: c.image.unwrap_or_default(),
                running: c.state.as_deref() == Some("running"),
                created_at_unix: c.created.unwrap_or(0),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn exec_create(&self, runtime_id: &str, spec: &ExecSpec) -> RuntimeResult<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(spec.argv.clone()),
            env: (!env.is_empty()).then_some(env),
            user: Some(if spec.as_root { "0:0" } else { SANDBOX_USER }.to_string()),
            working_dir: spec.cwd.clone(),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(runtime_id, options)
            .await
            .map_err(normalize)?;

        Ok(exec.id)
    }

    async fn exec_start(&self, exec_id: &str) -> RuntimeResult<OutputStream> {
        let results = self
            .client
            .start_exec(exec_id, None)
            .await
            .map_err(normalize)?;

        match results {
            StartExecResults::Attached { output, .. } => {
                let stream = output
                    .filter_map(|item| async move {
                        match item {
                            Ok(bollard::container::LogOutput::StdOut { message })
                            | Ok(bollard::container::LogOutput::Console { message }) => {
                                Some(Ok(ExecOutput::Stdout(message)))
                            }
                            Ok(bollard::container::LogOutput::StdErr { message }) => {
                                Some(Ok(ExecOutput::Stderr(message)))
                            }
                            Ok(bollard::container::LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(normalize(e))),
                        }
                    })
                    .boxed();
                Ok(stream)
            }
            StartExecResults::Detached => Err(RuntimeError::Api(
                "exec started detached, expected attached output".to_string(),
            )),
        }
    }

    async fn exec_inspect(&self, exec_id: &str) -> RuntimeResult<ExecProbe> {
        let inspect = self.client.inspect_exec(exec_id).await.map_err(normalize)?;
        Ok(ExecProbe {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
            pid: inspect.pid,
        })
    }

    async fn signal_exec(&self, runtime_id: &str, pid: i64, signal: &str) -> RuntimeResult<()> {
        // Docker has no exec-kill endpoint; deliver the signal with a
        // nested, detached exec. Runs as root so it can reach processes
        // owned by either sandbox user.
        let options = CreateExecOptions {
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("kill -{} {}", signal, pid),
            ]),
            user: Some("0:0".to_string()),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(runtime_id, options)
            .await
            .map_err(normalize)?;
        self.client
            .start_exec(&exec.id, None)
            .await
            .map_err(normalize)?;

        debug!(runtime_id, pid, signal, "delivered signal via nested exec");
        Ok(())
    }

    async fn stats_snapshot(&self, runtime_id: &str) -> RuntimeResult<StatsSnapshot> {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: true,
        });

        let mut stream = self.client.stats(runtime_id, options);
        match stream.next().await {
            Some(Ok(stats)) => Ok(StatsSnapshot {
                cpu_ns: stats.cpu_stats.cpu_usage.total_usage,
                mem_bytes: stats.memory_stats.usage.unwrap_or(0),
                mem_peak_bytes: stats
                    .memory_stats
                    .max_usage
                    .or(stats.memory_stats.usage)
                    .unwrap_or(0),
            }),
            Some(Err(e)) => Err(normalize(e)),
            None => Err(RuntimeError::Api("empty stats response".to_string())),
        }
    }
}
