use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::CoordinatorHandle;
use crate::job::{Job, JobId};
use crate::scheduler::registry::WorkerSnapshot;

#[derive(Clone)]
pub struct DashboardState {
    pub coordinator: CoordinatorHandle,
}

#[derive(Serialize)]
struct WorkerResponse {
    name: String,
    os: String,
    cpu_count: u32,
    cpu_load: Vec<f32>,
    memory: u64,
    active_users: u32,
    active_jobs: u32,
    reserved_cpus: u32,
    maintenance: bool,
    last_report: String,
}

impl From<WorkerSnapshot> for WorkerResponse {
    fn from(worker: WorkerSnapshot) -> Self {
        Self {
            name: worker.name,
            os: worker.os,
            cpu_count: worker.cpu_count,
            cpu_load: worker.cpu_load,
            memory: worker.memory,
            active_users: worker.active_users,
            active_jobs: worker.active_jobs,
            reserved_cpus: worker.reserved_cpus,
            maintenance: worker.maintenance,
            last_report: worker.last_report.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct JobResponse {
    id: JobId,
    name: String,
    owner: u64,
    state: String,
    workstation: Option<String>,
    added: Option<String>,
    started: Option<String>,
    finished: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            name: job.name,
            owner: job.owner,
            state: job.state.to_string(),
            workstation: job.workstation,
            added: job.added.map(|t| t.to_rfc3339()),
            started: job.started.map(|t| t.to_rfc3339()),
            finished: job.finished.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
struct QueueResponse {
    length: usize,
    jobs: Vec<JobId>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn unavailable(e: crate::error::FleetError) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

/// Read-only routes over a running coordinator.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/workers", get(list_workers_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/queue", get(queue_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, cancel: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.coordinator.workers().await {
        Ok(workers) => {
            let workers: Vec<WorkerResponse> = workers.into_iter().map(WorkerResponse::from).collect();
            Json(workers).into_response()
        }
        Err(e) => unavailable(e).into_response(),
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.coordinator.jobs().await {
        Ok(jobs) => {
            let jobs: Vec<JobResponse> = jobs.into_iter().map(JobResponse::from).collect();
            Json(jobs).into_response()
        }
        Err(e) => unavailable(e).into_response(),
    }
}

async fn queue_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.coordinator.queue().await {
        Ok(jobs) => Json(QueueResponse {
            length: jobs.len(),
            jobs,
        })
        .into_response(),
        Err(e) => unavailable(e).into_response(),
    }
}
