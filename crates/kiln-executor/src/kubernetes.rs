//! Kubernetes executor implementation.
//!
//! Each job runs as a single pod with restart policy `Never`. Status comes
//! from a watcher field-selected on the pod name, output from the follow-mode
//! log stream of the `build` container.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kiln_core::executor::*;
use chrono::{DateTime, Utc};
use kiln_core::{Error, JobId, Result, RetryPolicy};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::{Client, Config};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{LogCursor, StopRegistry, default_profiles, resolve_profile, split_lines};

const CONTAINER_NAME: &str = "build";
const EVENT_BUFFER: usize = 256;
/// How long to wait for the log stream to drain once the pod is terminal.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Waiting reasons that never resolve without intervention.
const FATAL_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// Kubernetes-based task executor.
pub struct KubernetesExecutor {
    client: Client,
    namespace: String,
    profiles: BTreeMap<String, ResourceProfile>,
    retry: RetryPolicy,
    stops: StopRegistry,
}

impl KubernetesExecutor {
    /// Connect using in-cluster config or the default kubeconfig.
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(format!("Failed to create Kubernetes client: {}", e)))?;
        Ok(Self::with_client(client, namespace))
    }

    /// Connect using an explicit kubeconfig file.
    pub async fn from_kubeconfig(path: &Path, namespace: impl Into<String>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to read kubeconfig from {}: {}",
                path.display(),
                e
            ))
        })?;
        let kubeconfig = kube::config::Kubeconfig::from_yaml(&content)
            .map_err(|e| Error::Internal(format!("Failed to parse kubeconfig: {}", e)))?;
        let config =
            Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Internal(format!("Failed to load kubeconfig: {}", e)))?;
        let client = Client::try_from(config)
            .map_err(|e| Error::Internal(format!("Failed to create Kubernetes client: {}", e)))?;
        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            client,
            namespace: if namespace.is_empty() {
                "default".to_string()
            } else {
                namespace
            },
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

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub(crate) fn pod_name(job_id: JobId) -> String {
        format!("kiln-job-{}", job_id.simple())
    }
}

/// Map a Kubernetes API error onto the executor error taxonomy.
fn classify(context: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => {
            Error::NotFound(format!("{}: {}", context, resp.message))
        }
        kube::Error::Api(resp) if resp.code == 429 || resp.code >= 500 => {
            Error::Transient(format!("{}: {}", context, resp.message))
        }
        kube::Error::Api(resp) => Error::Submission(format!("{}: {}", context, resp.message)),
        kube::Error::HyperError(_) | kube::Error::Service(_) => {
            Error::Transient(format!("{}: {}", context, err))
        }
        _ => Error::Internal(format!("{}: {}", context, err)),
    }
}

fn quantities(cpu: Option<&String>, memory: Option<&String>) -> Option<BTreeMap<String, Quantity>> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!map.is_empty()).then_some(map)
}

/// Build the pod manifest for a task.
pub(crate) fn build_pod(namespace: &str, spec: &TaskSpec, profile: &ResourceProfile) -> Pod {
    let labels = BTreeMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (JOB_ID_LABEL.to_string(), spec.job_id.to_string()),
        (
            JOB_NAME_LABEL.to_string(),
            sanitize_label_value(&spec.job_name),
        ),
    ]);

    let mut env: Vec<EnvVar> = spec
        .pipeline
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.pipeline.image.clone()),
        command: (!spec.pipeline.command.is_empty()).then(|| spec.pipeline.command.clone()),
        working_dir: spec.pipeline.working_dir.clone(),
        env: (!env.is_empty()).then_some(env),
        resources: Some(ResourceRequirements {
            requests: quantities(
                profile.cpu_request.as_ref(),
                profile.memory_request.as_ref(),
            ),
            limits: quantities(profile.cpu_limit.as_ref(), profile.memory_limit.as_ref()),
            ..Default::default()
        }),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(KubernetesExecutor::pod_name(spec.job_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![container],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn failure_message(status: &PodStatus) -> (Option<i64>, String) {
    let terminated = status
        .container_statuses
        .iter()
        .flatten()
        .find(|c| c.name == CONTAINER_NAME)
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref());

    let exit_code = terminated.map(|t| t.exit_code as i64);
    let message = terminated
        .and_then(|t| t.message.clone().or_else(|| t.reason.clone()))
        .or_else(|| status.message.clone())
        .or_else(|| status.reason.clone())
        .unwrap_or_else(|| match exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "pod failed".to_string(),
        });
    (exit_code, message)
}

fn fatal_waiting_reason(status: &PodStatus) -> Option<String> {
    status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|c| c.state.as_ref()?.waiting.as_ref())
        .find(|w| {
            w.reason
                .as_deref()
                .is_some_and(|r| FATAL_WAITING_REASONS.contains(&r))
        })
        .map(|w| {
            let reason = w.reason.clone().unwrap_or_default();
            match &w.message {
                Some(message) => format!("{}: {}", reason, message),
                None => reason,
            }
        })
}

/// Task status for a pod, or `None` when the pod phase says nothing new.
pub(crate) fn pod_status(pod: &Pod) -> Option<TaskStatus> {
    let Some(status) = &pod.status else {
        return Some(TaskStatus::Pending);
    };
    if let Some(message) = fatal_waiting_reason(status) {
        return Some(TaskStatus::Failed {
            exit_code: None,
            message,
        });
    }
    match status.phase.as_deref() {
        None | Some("Pending") => Some(TaskStatus::Pending),
        Some("Running") => Some(TaskStatus::Active),
        Some("Succeeded") => Some(TaskStatus::Succeeded),
        Some("Failed") => {
            let (exit_code, message) = failure_message(status);
            Some(TaskStatus::Failed { exit_code, message })
        }
        _ => None,
    }
}

/// Drives one pod's watch stream into an event channel.
struct PodWatch {
    pods: Api<Pod>,
    name: String,
    retry: RetryPolicy,
    stops: StopRegistry,
    tx: mpsc::Sender<ExecutionEvent>,
}

impl PodWatch {
    async fn run(self) {
        self.follow().await;
        self.stops.finish(&self.name);
    }

    async fn follow(&self) {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let mut events = watcher(self.pods.clone(), config).boxed();

        let mut last: Option<TaskStatus> = None;
        let mut logs: Option<JoinHandle<()>> = None;
        let mut seen = false;
        let mut failures: u32 = 0;

        let terminal = loop {
            let event = match events.next().await {
                Some(Ok(event)) => {
                    failures = 0;
                    event
                }
                Some(Err(e)) => {
                    if failures >= self.retry.max_retries {
                        break TaskStatus::Unknown {
                            reason: format!("lost watch on pod {}: {}", self.name, e),
                        };
                    }
                    let delay = self.retry.delay(failures);
                    failures += 1;
                    warn!(pod = %self.name, error = %e, attempt = failures, "Pod watch error");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                None => {
                    break TaskStatus::Unknown {
                        reason: format!("watch on pod {} ended", self.name),
                    };
                }
            };

            let status = match event {
                Event::Apply(pod) | Event::InitApply(pod) => {
                    seen = true;
                    match pod_status(&pod) {
                        Some(status) => status,
                        None => continue,
                    }
                }
                Event::Delete(_) => TaskStatus::Unknown {
                    reason: format!("pod {} was deleted", self.name),
                },
                Event::InitDone if !seen => TaskStatus::Unknown {
                    reason: format!("pod {} not found", self.name),
                },
                Event::Init | Event::InitDone => continue,
            };

            if status.is_terminal() {
                break status;
            }
            if status == TaskStatus::Active && logs.is_none() {
                logs = Some(tokio::spawn(
                    LogFollower {
                        pods: self.pods.clone(),
                        name: self.name.clone(),
                        retry: self.retry.clone(),
                        stops: self.stops.clone(),
                        tx: self.tx.clone(),
                    }
                    .run(),
                ));
            }
            if last.as_ref() != Some(&status) {
                debug!(pod = %self.name, status = ?status, "Pod status changed");
                if self.tx.send(ExecutionEvent::Status(status.clone())).await.is_err() {
                    return;
                }
                last = Some(status);
            }
        };

        let stopped = self.stops.contains(&self.name);
        let terminal = if stopped {
            TaskStatus::Cancelled
        } else {
            terminal
        };

        match logs {
            Some(handle) => {
                let abort = handle.abort_handle();
                if tokio::time::timeout(LOG_DRAIN_TIMEOUT, handle).await.is_err() {
                    warn!(pod = %self.name, "Log stream did not drain in time");
                    abort.abort();
                }
            }
            None if !stopped && matches!(terminal, TaskStatus::Succeeded | TaskStatus::Failed { .. }) => {
                // The pod finished before it was seen running.
                fetch_logs(&self.pods, &self.name, &self.retry, &self.tx).await;
            }
            None => {}
        }

        info!(pod = %self.name, status = ?terminal, "Pod finished");
        let _ = self.tx.send(ExecutionEvent::Status(terminal)).await;
    }
}

fn follow_params(since: Option<DateTime<Utc>>) -> LogParams {
    LogParams {
        container: Some(CONTAINER_NAME.to_string()),
        follow: true,
        timestamps: true,
        since_time: since,
        ..Default::default()
    }
}

/// Follows a running pod's log, reconnecting where it left off.
struct LogFollower {
    pods: Api<Pod>,
    name: String,
    retry: RetryPolicy,
    stops: StopRegistry,
    tx: mpsc::Sender<ExecutionEvent>,
}

impl LogFollower {
    async fn run(self) {
        let mut cursor = LogCursor::default();
        let mut failures: u32 = 0;
        loop {
            let before = cursor.delivered();
            let error = match self.stream(&mut cursor).await {
                Ok(_) => return,
                Err(e) => e,
            };
            if self.stops.contains(&self.name) {
                return;
            }
            if cursor.delivered() > before {
                failures = 0;
            }
            if failures >= self.retry.max_retries {
                warn!(pod = %self.name, error = %error, "Giving up on log stream");
                let _ = self
                    .tx
                    .send(ExecutionEvent::OutputLost {
                        reason: format!("log stream of pod {} failed: {}", self.name, error),
                    })
                    .await;
                return;
            }
            let delay = self.retry.delay(failures);
            failures += 1;
            warn!(pod = %self.name, error = %error, attempt = failures, "Log stream broke, reconnecting");
            tokio::time::sleep(delay).await;
            cursor.reconnect();
        }
    }

    /// Forward one connection's worth of output. `Ok(false)` means the
    /// receiver is gone.
    async fn stream(&self, cursor: &mut LogCursor) -> Result<bool> {
        let reader = self
            .pods
            .log_stream(&self.name, &follow_params(cursor.since()))
            .await
            .map_err(|e| classify("open log stream", e))?;
        let mut lines = Box::pin(reader.lines());
        while let Some(line) = lines.next().await {
            let raw = line.map_err(|e| Error::Transient(format!("read log stream: {}", e)))?;
            let Some(line) = cursor.admit(&raw) else {
                continue;
            };
            if self.tx.send(ExecutionEvent::Output(line)).await.is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Read the whole log of a pod that finished before it was followed.
async fn fetch_logs(
    pods: &Api<Pod>,
    name: &str,
    retry: &RetryPolicy,
    tx: &mpsc::Sender<ExecutionEvent>,
) {
    let params = LogParams {
        container: Some(CONTAINER_NAME.to_string()),
        ..Default::default()
    };
    let params = &params;
    let fetched = retry
        .run("fetch pod logs", || async move {
            pods.logs(name, params)
                .await
                .map_err(|e| classify("fetch pod logs", e))
        })
        .await;
    let content = match fetched {
        Ok(content) => content,
        Err(e) => {
            warn!(pod = %name, error = %e, "Failed to fetch pod logs");
            let _ = tx
                .send(ExecutionEvent::OutputLost {
                    reason: format!("could not fetch log of pod {}: {}", name, e),
                })
                .await;
            return;
        }
    };

    let mut pending = String::new();
    let mut lines = split_lines(&mut pending, &content);
    if !pending.is_empty() {
        lines.push(pending);
    }
    for line in lines {
        if tx
            .send(ExecutionEvent::Output(OutputLine::stdout(line)))
            .await
            .is_err()
        {
            return;
        }
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn start(&self, spec: TaskSpec) -> Result<TaskHandle> {
        let profile = resolve_profile(&self.profiles, &spec.pipeline.profile)?;
        let pod = build_pod(&self.namespace, &spec, profile);
        let name = Self::pod_name(spec.job_id);
        let pods = self.pods();

        info!(job_id = %spec.job_id, pod = %name, namespace = %self.namespace, "Creating pod");
        self.retry
            .run("create pod", || {
                let pods = pods.clone();
                let pod = pod.clone();
                async move {
                    pods.create(&PostParams::default(), &pod)
                        .await
                        .map_err(|e| classify("create pod", e))
                }
            })
            .await?;

        Ok(TaskHandle {
            job_id: spec.job_id,
            task_id: name,
            executor: self.name().to_string(),
        })
    }

    async fn watch(&self, handle: &TaskHandle) -> Result<BoxStream<'static, ExecutionEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.stops.watching(&handle.task_id);
        let watch = PodWatch {
            pods: self.pods(),
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
        let pods = self.pods();
        let name = handle.task_id.clone();

        info!(job_id = %handle.job_id, pod = %name, "Deleting pod");
        let deleted = self
            .retry
            .run("delete pod", || {
                let pods = pods.clone();
                let name = name.clone();
                async move {
                    pods.delete(&name, &DeleteParams::default().grace_period(0))
                        .await
                        .map(|_| ())
                        .map_err(|e| classify("delete pod", e))
                }
            })
            .await;

        match deleted {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn reconcile(&self) -> Result<Vec<TaskHandle>> {
        let pods = self.pods();
        let params = ListParams::default().labels(&format!("{}=true", MANAGED_LABEL));
        let list = self
            .retry
            .run("list pods", || {
                let pods = pods.clone();
                let params = params.clone();
                async move {
                    pods.list(&params)
                        .await
                        .map_err(|e| classify("list pods", e))
                }
            })
            .await?;

        let mut handles = Vec::new();
        for pod in list.items {
            if pod.metadata.deletion_timestamp.is_some()
                || pod_status(&pod).is_some_and(|s| s.is_terminal())
            {
                continue;
            }
            let Some(name) = pod.metadata.name.clone() else {
                continue;
            };
            let job_id = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(JOB_ID_LABEL))
                .and_then(|id| id.parse::<JobId>().ok());
            match job_id {
                Some(job_id) => handles.push(TaskHandle {
                    job_id,
                    task_id: name,
                    executor: self.name().to_string(),
                }),
                None => warn!(pod = %name, "Managed pod without a valid job id label"),
            }
        }
        debug!(count = handles.len(), "Reconciled pods");
        Ok(handles)
    }
}
