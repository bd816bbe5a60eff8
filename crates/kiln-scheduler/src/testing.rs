//! Test doubles: a scripted executor and stores that can be told to fail.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use kiln_core::executor::{ExecutionEvent, Executor, OutputLine, TaskHandle, TaskSpec, TaskStatus};
use kiln_core::job::PipelineSpec;
use kiln_core::{
    Cutter, Error, Job, JobFilter, JobId, JobSpec, LogSegment, Phase, PhaseTransition, Result,
    RetryPolicy,
};
use kiln_db::{
    DbError, DbResult, FileJobStore, FileLogStore, JobStore, LiveLogs, LogStore, SegmentWriter,
};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::service::{Service, ServiceConfig};

/// One step of a scripted task.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Status(TaskStatus),
    Line(&'static str),
    Pause(Duration),
    /// The output stream broke for good.
    LoseOutput(&'static str),
    /// Wait for `stop`, then carry on with the script.
    WaitForStop,
    /// Wait for `stop`. Reports `Cancelled` if `respond`, otherwise goes
    /// silent until the watcher hangs up.
    AwaitStop { respond: bool },
}

/// Executor that plays back a script per job name. Jobs named `reject`
/// are refused at submission, jobs named `flaky-start` fail with a
/// transient error and jobs named `unwatchable` can never be watched.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    names: Mutex<HashMap<JobId, String>>,
    stop_tokens: Mutex<HashMap<String, CancellationToken>>,
    stopped: Mutex<Vec<TaskHandle>>,
    leftovers: Mutex<Vec<TaskHandle>>,
    watch_attempts: Mutex<u32>,
}

impl ScriptedExecutor {
    pub(crate) fn script(&self, job_name: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_name.to_string(), steps);
    }

    /// Tasks reported as still alive by `reconcile`.
    pub(crate) fn leave_running(&self, handle: TaskHandle) {
        self.leftovers.lock().unwrap().push(handle);
    }

    pub(crate) fn watch_attempts(&self) -> u32 {
        *self.watch_attempts.lock().unwrap()
    }

    pub(crate) fn stopped(&self) -> Vec<TaskHandle> {
        self.stopped.lock().unwrap().clone()
    }

    fn stop_token(&self, task_id: &str) -> CancellationToken {
        self.stop_tokens
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }
}

pub(crate) fn handle_for(job_id: JobId) -> TaskHandle {
    TaskHandle {
        job_id,
        task_id: format!("task-{}", job_id.simple()),
        executor: "scripted".to_string(),
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn start(&self, spec: TaskSpec) -> Result<TaskHandle> {
        if spec.job_name == "reject" {
            return Err(Error::Submission("quota exceeded".to_string()));
        }
        if spec.job_name == "flaky-start" {
            return Err(Error::Transient("api server unavailable".to_string()));
        }
        self.names
            .lock()
            .unwrap()
            .insert(spec.job_id, spec.job_name.clone());
        Ok(handle_for(spec.job_id))
    }

    async fn watch(&self, handle: &TaskHandle) -> Result<BoxStream<'static, ExecutionEvent>> {
        let name = self
            .names
            .lock()
            .unwrap()
            .get(&handle.job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(handle.task_id.clone()))?;
        if name == "unwatchable" {
            *self.watch_attempts.lock().unwrap() += 1;
            return Err(Error::Transient("watch connection refused".to_string()));
        }
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_default();
        let stop = self.stop_token(&handle.task_id);

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for step in steps {
                let event = match step {
                    Step::Status(status) => ExecutionEvent::Status(status),
                    Step::Line(text) => ExecutionEvent::Output(OutputLine::stdout(text)),
                    Step::LoseOutput(reason) => ExecutionEvent::OutputLost {
                        reason: reason.to_string(),
                    },
                    Step::Pause(duration) => {
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                    Step::WaitForStop => {
                        stop.cancelled().await;
                        continue;
                    }
                    Step::AwaitStop { respond } => {
                        stop.cancelled().await;
                        if respond {
                            let _ = tx.send(ExecutionEvent::Status(TaskStatus::Cancelled)).await;
                        } else {
                            tx.closed().await;
                        }
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn stop(&self, handle: &TaskHandle) -> Result<()> {
        self.stopped.lock().unwrap().push(handle.clone());
        self.stop_token(&handle.task_id).cancel();
        Ok(())
    }

    async fn reconcile(&self) -> Result<Vec<TaskHandle>> {
        Ok(self.leftovers.lock().unwrap().clone())
    }
}

/// File log store that refuses to open segments with a given name.
pub(crate) struct FailingLogStore {
    inner: FileLogStore,
    poisoned: &'static str,
}

#[async_trait]
impl LogStore for FailingLogStore {
    async fn begin(&self, job: JobId) -> DbResult<()> {
        self.inner.begin(job).await
    }

    async fn open_segment(&self, job: JobId, name: &str) -> DbResult<Box<dyn SegmentWriter>> {
        if name == self.poisoned {
            return Err(DbError::Io(std::io::Error::other("disk full")));
        }
        self.inner.open_segment(job, name).await
    }

    async fn read(&self, job: JobId, name: &str, range: Range<u64>) -> DbResult<Bytes> {
        self.inner.read(job, name, range).await
    }

    async fn segments(&self, job: JobId) -> DbResult<Vec<LogSegment>> {
        self.inner.segments(job).await
    }

    fn tail(&self, job: JobId, from: u64) -> BoxStream<'static, DbResult<Bytes>> {
        self.inner.tail(job, from)
    }

    async fn finish(&self, job: JobId) -> DbResult<()> {
        self.inner.finish(job).await
    }
}

/// File job store that cannot record the `Running` phase.
pub(crate) struct NoRunningJobStore {
    inner: Arc<FileJobStore>,
}

#[async_trait]
impl JobStore for NoRunningJobStore {
    async fn create(&self, job: &Job) -> DbResult<Job> {
        self.inner.create(job).await
    }

    async fn update_status(&self, id: JobId, phase: Phase, reason: Option<&str>) -> DbResult<Job> {
        if phase == Phase::Running {
            return Err(DbError::Io(std::io::Error::other("read-only file system")));
        }
        self.inner.update_status(id, phase, reason).await
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        self.inner.get(id).await
    }

    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<Job>> {
        self.inner.list(filter).await
    }

    async fn transitions(&self, id: JobId) -> DbResult<Vec<PhaseTransition>> {
        self.inner.transitions(id).await
    }

    async fn record_segment(&self, id: JobId, segment: &LogSegment) -> DbResult<()> {
        self.inner.record_segment(id, segment).await
    }

    async fn mark_log_incomplete(&self, id: JobId) -> DbResult<()> {
        self.inner.mark_log_incomplete(id).await
    }

    async fn ping(&self) -> DbResult<()> {
        self.inner.ping().await
    }
}

pub(crate) fn test_config() -> ServiceConfig {
    ServiceConfig {
        max_duration: Duration::from_secs(10),
        cancel_grace: Duration::from_millis(400),
        subscriber_buffer: 64,
        broadcast_capacity: 64,
        retry: RetryPolicy::none(),
    }
}

pub(crate) fn spec(name: &str) -> JobSpec {
    JobSpec {
        name: name.to_string(),
        trigger: Default::default(),
        pipeline: PipelineSpec {
            image: "alpine:3.20".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "make".to_string()],
            working_dir: None,
            env: HashMap::new(),
            profile: "default".to_string(),
            timeout_secs: None,
        },
    }
}

pub(crate) struct Harness {
    pub(crate) service: Service,
    pub(crate) executor: Arc<ScriptedExecutor>,
    pub(crate) job_store: Arc<FileJobStore>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub(crate) async fn new(config: ServiceConfig) -> Self {
        Self::build(config, None, false).await
    }

    /// Harness whose log store fails to open segments named `poisoned`.
    pub(crate) async fn failing(config: ServiceConfig, poisoned: &'static str) -> Self {
        Self::build(config, Some(poisoned), false).await
    }

    /// Harness whose job store cannot record the `Running` phase.
    pub(crate) async fn without_running(config: ServiceConfig) -> Self {
        Self::build(config, None, true).await
    }

    async fn build(config: ServiceConfig, poisoned: Option<&'static str>, no_running: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let job_store = Arc::new(FileJobStore::open(dir.path().join("jobs")).await.unwrap());
        let logs = FileLogStore::open(dir.path().join("logs"), LiveLogs::new())
            .await
            .unwrap();
        let log_store: Arc<dyn LogStore> = match poisoned {
            Some(poisoned) => Arc::new(FailingLogStore {
                inner: logs,
                poisoned,
            }),
            None => Arc::new(logs),
        };
        let service_store: Arc<dyn JobStore> = if no_running {
            Arc::new(NoRunningJobStore {
                inner: job_store.clone(),
            })
        } else {
            job_store.clone()
        };
        let executor = Arc::new(ScriptedExecutor::default());
        let service = Service::new(
            config,
            service_store,
            log_store,
            executor.clone(),
            Cutter::default(),
        );
        Self {
            service,
            executor,
            job_store,
            _dir: dir,
        }
    }

    /// Poll until the job reaches a terminal phase.
    pub(crate) async fn wait_terminal(&self, id: JobId) -> Job {
        self.wait_for(id, |job| job.phase.is_terminal()).await
    }

    pub(crate) async fn wait_for(&self, id: JobId, ready: impl Fn(&Job) -> bool) -> Job {
        let poll = async {
            loop {
                let job = self.service.get_status(id).await.unwrap();
                if ready(&job) {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), poll)
            .await
            .expect("job did not reach the expected state in time")
    }

    /// Wait until the active job map is empty, so terminal writes are done.
    pub(crate) async fn settle(&self) {
        let poll = async {
            while self.service.active_jobs() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), poll)
            .await
            .expect("jobs did not settle in time");
    }
}
