//! Job endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use kiln_core::{Job, JobFilter, JobId, JobSpec, Phase, PhaseTransition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::ws::job_events;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/{id}", get(get_job))
        .route("/{id}/transitions", get(get_transitions))
        .route("/{id}/cancel", post(cancel_job))
        .route("/{id}/logs/{segment}", get(get_segment))
        .route("/{id}/events", get(job_events))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    /// Comma-separated phase names.
    phase: Option<String>,
    name: Option<String>,
    limit: Option<usize>,
}

impl ListJobsQuery {
    fn into_filter(self) -> Result<JobFilter, ApiError> {
        let phases = match self.phase.as_deref() {
            Some(phases) => phases
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::parse::<Phase>)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        Ok(JobFilter {
            phases,
            name_contains: self.name.filter(|n| !n.is_empty()),
            limit: self.limit,
        })
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let filter = query.into_filter()?;
    Ok(Json(state.service.list_jobs(&filter).await?))
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    id: JobId,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let id = state.service.submit(spec).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id })))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.service.get_status(JobId::from(id)).await?))
}

async fn get_transitions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<PhaseTransition>>, ApiError> {
    Ok(Json(state.service.transitions(JobId::from(id)).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.cancel(JobId::from(id)).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct SegmentQuery {
    start: Option<u64>,
    end: Option<u64>,
}

async fn get_segment(
    State(state): State<AppState>,
    Path((id, segment)): Path<(Uuid, String)>,
    Query(query): Query<SegmentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let start = query.start.unwrap_or(0);
    let end = query.end.unwrap_or(u64::MAX);
    if end < start {
        return Err(ApiError::BadRequest(format!(
            "end ({}) is before start ({})",
            end, start
        )));
    }
    let bytes = state
        .service
        .read_segment(JobId::from(id), &segment, start..end)
        .await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use futures::StreamExt;
    use futures::stream::{self, BoxStream};
    use kiln_core::Cutter;
    use kiln_core::executor::{
        ExecutionEvent, Executor, OutputLine, TaskHandle, TaskSpec, TaskStatus,
    };
    use kiln_db::{FileJobStore, FileLogStore, LiveLogs};
    use kiln_scheduler::{Service, ServiceConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Prints two segments and succeeds.
    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn start(&self, spec: TaskSpec) -> kiln_core::Result<TaskHandle> {
            Ok(TaskHandle {
                job_id: spec.job_id,
                task_id: spec.job_id.simple(),
                executor: "echo".to_string(),
            })
        }

        async fn watch(
            &self,
            _handle: &TaskHandle,
        ) -> kiln_core::Result<BoxStream<'static, ExecutionEvent>> {
            let events = vec![
                ExecutionEvent::Status(TaskStatus::Active),
                ExecutionEvent::Output(OutputLine::stdout("=== build ===")),
                ExecutionEvent::Output(OutputLine::stdout("hello")),
                ExecutionEvent::Status(TaskStatus::Succeeded),
            ];
            Ok(stream::iter(events).boxed())
        }

        async fn stop(&self, _handle: &TaskHandle) -> kiln_core::Result<()> {
            Ok(())
        }

        async fn reconcile(&self) -> kiln_core::Result<Vec<TaskHandle>> {
            Ok(Vec::new())
        }
    }

    async fn app() -> (tempfile::TempDir, axum::Router) {
        let dir = tempfile::tempdir().unwrap();
        let job_store = FileJobStore::open(dir.path().join("jobs")).await.unwrap();
        let log_store = FileLogStore::open(dir.path().join("logs"), LiveLogs::new())
            .await
            .unwrap();
        let service = Service::new(
            ServiceConfig::default(),
            Arc::new(job_store),
            Arc::new(log_store),
            Arc::new(EchoExecutor),
            Cutter::default(),
        );
        (dir, routes::router(AppState::new(service)))
    }

    async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn wait_finished(app: &axum::Router, id: &str) -> serde_json::Value {
        for _ in 0..500 {
            let (_, body) = send(app, get(&format!("/api/v1/jobs/{}", id))).await;
            let job: serde_json::Value = serde_json::from_slice(&body).unwrap();
            if job["phase"] == "succeeded" || job["phase"] == "failed" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn test_submit_then_read_logs() {
        let (_dir, app) = app().await;
        let spec = serde_json::json!({
            "name": "build-api",
            "trigger": { "repository": "acme/api", "revision": "abc123" },
            "pipeline": { "image": "rust:1.85", "command": ["cargo", "build"] }
        });
        let request = Request::post("/api/v1/jobs")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(spec.to_string()))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::CREATED);
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let job = wait_finished(&app, &id).await;
        assert_eq!(job["phase"], "succeeded");
        assert_eq!(job["segments"][0]["name"], "build");

        let (status, body) = send(&app, get(&format!("/api/v1/jobs/{}/logs/build", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"hello\n");

        let (_, body) = send(
            &app,
            get(&format!("/api/v1/jobs/{}/logs/build?start=1&end=3", id)),
        )
        .await;
        assert_eq!(body, b"el");

        let (_, body) = send(&app, get(&format!("/api/v1/jobs/{}/transitions", id))).await;
        let transitions: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(transitions.as_array().unwrap().len(), 4);

        let (_, body) = send(&app, get("/api/v1/jobs?phase=succeeded&name=API")).await;
        let jobs: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(jobs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (_dir, app) = app().await;

        let (status, _) = send(&app, get("/api/v1/jobs?phase=paused")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get(&format!("/api/v1/jobs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::post(format!("/api/v1/jobs/{}/cancel", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let spec = serde_json::json!({ "name": "", "pipeline": { "image": "alpine" } });
        let request = Request::post("/api/v1/jobs")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(spec.to_string()))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app().await;
        let (status, _) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, get("/health/ready")).await;
        assert_eq!(status, StatusCode::OK);
        let ready: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(ready["executor"], "echo");
    }
}
