//! Local Docker executor implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use futures::stream::BoxStream;
use kiln_core::executor::*;
use kiln_core::{Error, JobId, Result, RetryPolicy};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{LogCursor, StopRegistry, default_profiles, resolve_profile, split_lines};

const EVENT_BUFFER: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Local Docker executor for development and small deployments.
pub struct LocalDockerExecutor {
    docker: Docker,
    profiles: BTreeMap<String, ResourceProfile>,
    retry: RetryPolicy,
    stops: StopRegistry,
}

impl LocalDockerExecutor {
    /// Create a new LocalDockerExecutor connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            profiles: default_profiles(),
            retry: RetryPolicy::default(),
            stops: StopRegistry::default(),
        }
    }

    pub fn with_profiles(mut self, profiles: BTreeMap<String, ResourceProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn container_name(job_id: JobId) -> String {
        format!("kiln-job-{}", job_id)
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }
}

/// Map a Docker API error onto the executor error taxonomy.
fn classify(context: &str, err: bollard::errors::Error) -> Error {
    match &err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::NotFound(format!("{}: {}", context, err)),
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if *status_code < 500 =>
        {
            Error::Submission(format!("{}: {}", context, err))
        }
        _ => Error::Transient(format!("{}: {}", context, err)),
    }
}

/// Parse a Kubernetes-style memory quantity (`512Mi`, `2Gi`, `1G`, `1024`)
/// into bytes.
pub(crate) fn parse_memory(quantity: &str) -> Option<i64> {
    const UNITS: &[(&str, i64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let quantity = quantity.trim();
    for (suffix, factor) in UNITS {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return number.parse::<i64>().ok().map(|n| n * factor);
        }
    }
    quantity.parse().ok()
}

/// Parse a CPU quantity (`500m`, `2`, `1.5`) into nano-CPUs.
pub(crate) fn parse_cpu(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    match quantity.strip_suffix('m') {
        Some(millis) => millis.parse::<i64>().ok().map(|m| m * 1_000_000),
        None => quantity
            .parse::<f64>()
            .ok()
            .map(|cores| (cores * 1e9) as i64),
    }
}

fn host_config(profile: &ResourceProfile) -> HostConfig {
    let cpu = profile.cpu_limit.as_ref().or(profile.cpu_request.as_ref());
    let memory = profile
        .memory_limit
        .as_ref()
        .or(profile.memory_request.as_ref());
    HostConfig {
        nano_cpus: cpu.and_then(|c| parse_cpu(c)),
        memory: memory.and_then(|m| parse_memory(m)),
        ..Default::default()
    }
}

fn container_config(spec: &TaskSpec, profile: &ResourceProfile) -> Config<String> {
    let mut env: Vec<String> = spec
        .pipeline
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();

    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (JOB_ID_LABEL.to_string(), spec.job_id.to_string()),
        (
            JOB_NAME_LABEL.to_string(),
            sanitize_label_value(&spec.job_name),
        ),
    ]);

    Config {
        image: Some(spec.pipeline.image.clone()),
        cmd: (!spec.pipeline.command.is_empty()).then(|| spec.pipeline.command.clone()),
        env: Some(env),
        working_dir: spec.pipeline.working_dir.clone(),
        labels: Some(labels),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        host_config: Some(host_config(profile)),
        ..Default::default()
    }
}

/// Drives one container's log stream and status into an event channel.
struct ContainerWatch {
    docker: Docker,
    name: String,
    retry: RetryPolicy,
    stops: StopRegistry,
    tx: mpsc::Sender<ExecutionEvent>,
}

enum Inspected {
    Running,
    Exited { exit_code: i64, error: String },
    Gone,
}

impl ContainerWatch {
    async fn inspect(&self) -> Result<Inspected> {
        let inspect = match self
            .docker
            .inspect_container(&self.name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) => {
                return match classify("inspect container", e) {
                    Error::NotFound(_) => Ok(Inspected::Gone),
                    other => Err(other),
                };
            }
        };
        let state = inspect.state.unwrap_or_default();
        if state.running.unwrap_or(false) || state.paused.unwrap_or(false) {
            return Ok(Inspected::Running);
        }
        Ok(Inspected::Exited {
            exit_code: state.exit_code.unwrap_or(-1),
            error: state.error.unwrap_or_default(),
        })
    }

    async fn send(&self, event: ExecutionEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Forward the container's output until it exits, reconnecting where
    /// each source left off. Returns false once the receiver is gone.
    async fn forward_logs(&self) -> bool {
        let mut out = LogCursor::default();
        let mut err = LogCursor::default();
        let mut failures: u32 = 0;
        loop {
            let before = out.delivered() + err.delivered();
            let error = match self.stream_logs(&mut out, &mut err).await {
                Ok(open) => return open,
                Err(e) => e,
            };
            if self.stops.contains(&self.name) {
                return true;
            }
            if out.delivered() + err.delivered() > before {
                failures = 0;
            }
            if failures >= self.retry.max_retries {
                warn!(container = %self.name, error = %error, "Giving up on log stream");
                return self
                    .send(ExecutionEvent::OutputLost {
                        reason: format!("log stream of container {} failed: {}", self.name, error),
                    })
                    .await;
            }
            let delay = self.retry.delay(failures);
            failures += 1;
            warn!(container = %self.name, error = %error, attempt = failures, "Log stream broke, reconnecting");
            tokio::time::sleep(delay).await;
            out.reconnect();
            err.reconnect();
        }
    }

    async fn stream_logs(&self, out: &mut LogCursor, err: &mut LogCursor) -> Result<bool> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            since: resume_since(out, err),
            ..Default::default()
        };
        let mut stream = self.docker.logs(&self.name, Some(options));
        let mut pending_out = String::new();
        let mut pending_err = String::new();

        while let Some(result) = stream.next().await {
            let output = result.map_err(|e| classify("read container logs", e))?;
            let (source, cursor, pending, message) = match output {
                LogOutput::StdErr { message } => {
                    (OutputStream::Stderr, &mut *err, &mut pending_err, message)
                }
                LogOutput::StdOut { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => {
                    (OutputStream::Stdout, &mut *out, &mut pending_out, message)
                }
            };
            for raw in split_lines(pending, &String::from_utf8_lossy(&message)) {
                let Some(mut line) = cursor.admit(&raw) else {
                    continue;
                };
                line.stream = source;
                if !self.send(ExecutionEvent::Output(line)).await {
                    return Ok(false);
                }
            }
        }

        for (source, cursor, rest) in [
            (OutputStream::Stdout, out, pending_out),
            (OutputStream::Stderr, err, pending_err),
        ] {
            if rest.is_empty() {
                continue;
            }
            if let Some(mut line) = cursor.admit(&rest) {
                line.stream = source;
                if !self.send(ExecutionEvent::Output(line)).await {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Poll inspect until the container is no longer running.
    async fn wait_terminal(&self) -> TaskStatus {
        let mut failures: u32 = 0;
        loop {
            match self.inspect().await {
                Ok(Inspected::Running) => {
                    failures = 0;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Ok(Inspected::Exited { exit_code: 0, .. }) => return TaskStatus::Succeeded,
                Ok(Inspected::Exited { exit_code, error }) => {
                    return TaskStatus::Failed {
                        exit_code: Some(exit_code),
                        message: if error.is_empty() {
                            format!("exited with code {}", exit_code)
                        } else {
                            error
                        },
                    };
                }
                Ok(Inspected::Gone) => {
                    return TaskStatus::Unknown {
                        reason: format!("container {} disappeared", self.name),
                    };
                }
                Err(e) if failures < self.retry.max_retries => {
                    let delay = self.retry.delay(failures);
                    failures += 1;
                    warn!(container = %self.name, error = %e, attempt = failures, "Inspect failed");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return TaskStatus::Unknown {
                        reason: format!("lost track of container {}: {}", self.name, e),
                    };
                }
            }
        }
    }

    async fn run(self) {
        self.follow().await;
        self.stops.finish(&self.name);
    }

    async fn follow(&self) {
        if !self.send(ExecutionEvent::Status(TaskStatus::Active)).await {
            return;
        }
        if !self.forward_logs().await {
            return;
        }
        let terminal = self.wait_terminal().await;
        let stopped = self.stops.contains(&self.name);
        let terminal = if stopped {
            TaskStatus::Cancelled
        } else {
            terminal
        };
        info!(container = %self.name, status = ?terminal, "Container finished");
        self.send(ExecutionEvent::Status(terminal.clone())).await;

        // Stopped containers are removed by `stop`.
        if !stopped && matches!(terminal, TaskStatus::Succeeded | TaskStatus::Failed { .. }) {
            if let Err(e) = remove_container(&self.docker, &self.retry, &self.name).await {
                warn!(container = %self.name, error = %e, "Failed to remove finished container");
            }
        }
    }
}

/// Seconds since the epoch to resume both sources from. Sources that have
/// not produced anything yet force a full replay.
fn resume_since(out: &LogCursor, err: &LogCursor) -> i64 {
    match (out.since(), err.since()) {
        (Some(a), Some(b)) => a.min(b).timestamp(),
        _ => 0,
    }
}

/// Force-remove a container. A container that is already gone counts as
/// removed.
async fn remove_container(docker: &Docker, retry: &RetryPolicy, name: &str) -> Result<()> {
    let removed = retry
        .run("remove container", || async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            docker
                .remove_container(name, Some(options))
                .await
                .map_err(|e| classify("remove container", e))
        })
        .await;

    match removed {
        Ok(()) | Err(Error::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, spec: TaskSpec) -> Result<TaskHandle> {
        let profile = resolve_profile(&self.profiles, &spec.pipeline.profile)?;
        let container_name = Self::container_name(spec.job_id);

        self.pull_image(&spec.pipeline.image).await;

        let config = container_config(&spec, profile);
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(job_id = %spec.job_id, container = %container_name, "Creating container");
        let docker = &self.docker;
        self.retry
            .run("create container", || {
                let options = create_options.clone();
                let config = config.clone();
                async move {
                    docker
                        .create_container(Some(options), config)
                        .await
                        .map_err(|e| classify("create container", e))
                }
            })
            .await?;

        info!(container = %container_name, "Starting container");
        let name = container_name.as_str();
        self.retry
            .run("start container", || async move {
                docker
                    .start_container(name, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(|e| classify("start container", e))
            })
            .await?;

        Ok(TaskHandle {
            job_id: spec.job_id,
            task_id: container_name,
            executor: self.name().to_string(),
        })
    }

    async fn watch(&self, handle: &TaskHandle) -> Result<BoxStream<'static, ExecutionEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.stops.watching(&handle.task_id);
        let watch = ContainerWatch {
            docker: self.docker.clone(),
            name: handle.task_id.clone(),
            retry: self.retry.clone(),
            stops: self.stops.clone(),
            tx,
        };
        tokio::spawn(watch.run());
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn stop(&self, handle: &TaskHandle) -> Result<()> {
        self.stops.mark(&handle.task_id);
        info!(job_id = %handle.job_id, container = %handle.task_id, "Removing container");
        remove_container(&self.docker, &self.retry, &handle.task_id).await
    }

    async fn reconcile(&self) -> Result<Vec<TaskHandle>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        )]);
        let docker = &self.docker;
        let containers = self
            .retry
            .run("list containers", || {
                let options = ListContainersOptions {
                    all: false,
                    filters: filters.clone(),
                    ..Default::default()
                };
                async move {
                    docker
                        .list_containers(Some(options))
                        .await
                        .map_err(|e| classify("list containers", e))
                }
            })
            .await?;

        let mut handles = Vec::new();
        for container in containers {
            let job_id = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(JOB_ID_LABEL))
                .and_then(|id| id.parse::<JobId>().ok());
            match job_id {
                Some(job_id) => handles.push(TaskHandle {
                    job_id,
                    task_id: Self::container_name(job_id),
                    executor: self.name().to_string(),
                }),
                None => warn!(
                    container = ?container.id,
                    "Managed container without a valid job id label"
                ),
            }
        }
        debug!(count = handles.len(), "Reconciled containers");
        Ok(handles)
    }
}


/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use kiln_core::job::PipelineSpec;

    fn shell_spec(script: &str) -> TaskSpec {
        TaskSpec {
            job_id: JobId::new(),
            job_name: "docker-test".to_string(),
            pipeline: PipelineSpec {
                image: "alpine:latest".to_string(),
                command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
                working_dir: None,
                env: HashMap::new(),
                profile: "default".to_string(),
                timeout_secs: None,
            },
        }
    }

    async fn collect(executor: &LocalDockerExecutor, handle: &TaskHandle) -> Vec<ExecutionEvent> {
        executor.watch(handle).await.unwrap().collect().await
    }

    #[tokio::test]
    #[ignore]
    async fn test_job_lifecycle() {
        let executor = LocalDockerExecutor::new().unwrap();
        let handle = executor
            .start(shell_spec("echo line1; echo line2"))
            .await
            .expect("Should start container");

        let events = collect(&executor, &handle).await;
        let lines: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::Output(line) => Some(line.content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["line1", "line2"]);
        assert_eq!(
            events.last(),
            Some(&ExecutionEvent::Status(TaskStatus::Succeeded))
        );

        // Finished containers are cleaned up without an explicit stop.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(
            executor
                .docker
                .inspect_container(&handle.task_id, None::<InspectContainerOptions>)
                .await
                .is_err()
        );
        executor.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_failing_job() {
        let executor = LocalDockerExecutor::new().unwrap();
        let handle = executor.start(shell_spec("exit 42")).await.unwrap();

        let events = collect(&executor, &handle).await;
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::Status(TaskStatus::Failed {
                exit_code: Some(42),
                ..
            }))
        ));

        executor.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_stop_reports_cancelled() {
        let executor = LocalDockerExecutor::new().unwrap();
        let handle = executor.start(shell_spec("sleep 300")).await.unwrap();
        let events = executor.watch(&handle).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        executor.stop(&handle).await.unwrap();
        executor.stop(&handle).await.unwrap();

        let events: Vec<ExecutionEvent> = events.collect().await;
        assert_eq!(
            events.last(),
            Some(&ExecutionEvent::Status(TaskStatus::Cancelled))
        );
        assert!(executor.reconcile().await.unwrap().iter().all(|h| h != &handle));
    }
}
