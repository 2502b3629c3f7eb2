//! Worker-side traffic: registration, job reports, liveness and inbound files.

use std::path::PathBuf;

use crate::archive;
use crate::error::{FleetError, Result};
use crate::job::{Job, JobId, JobState};
use crate::network::transfer::ReceivedFile;
use crate::network::ConnId;
use crate::protocol::{Outbound, WorkerReport};
use crate::scheduler::registry::Upsert;
use crate::store::JobFilter;

use super::Coordinator;

impl Coordinator {
    pub(super) async fn workstation_info(&mut self, conn: ConnId, report: WorkerReport) {
        let outcome = match self.registry.upsert(conn, report) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(conn, error = %e, "Rejected workstation report");
                return;
            }
        };

        match outcome {
            Upsert::Updated => {}
            Upsert::New => self.worker_registered(conn).await,
            Upsert::Replaced { stale } => {
                self.liveness.remove(&mut self.wheel, stale);
                self.connections.close(stale);
                self.connections.remove(stale);
                self.worker_registered(conn).await;
            }
        }
    }

    /// First report on a connection: start heartbeats and bring the worker up to date.
    async fn worker_registered(&mut self, conn: ConnId) {
        let Some(name) = self.registry.get(conn).map(|w| w.name.clone()) else {
            return;
        };
        tracing::info!(conn, worker = %name, "Worker registered");
        self.liveness.add(&mut self.wheel, conn);

        match self.store.programs() {
            Ok(programs) if !programs.is_empty() => {
                let programs = programs.into_iter().map(|p| p.name).collect();
                self.send(conn, Outbound::CheckForPrograms { programs });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load programs"),
        }

        for path in self.search_paths().await {
            self.send(conn, Outbound::UpdatePath { path });
        }

        let running = JobFilter::in_states(&[JobState::Running]).with_workstation(name.as_str());
        match self.store.jobs(&running) {
            Ok(jobs) => {
                for job in jobs {
                    self.send(conn, Outbound::GetJobState { job_id: job.id });
                }
            }
            Err(e) => tracing::warn!(worker = %name, error = %e, "Failed to load running jobs"),
        }

        self.requeue_backlog();
    }

    /// Search paths registered with `addPath`, one per line of the PATHS file.
    pub(super) async fn search_paths(&self) -> Vec<String> {
        match tokio::fs::read_to_string(self.config.paths_file()).await {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read search paths");
                Vec::new()
            }
        }
    }

    /// A worker reported the state of one of its jobs.
    pub(super) fn job_info(&mut self, conn: ConnId, job_id: JobId, state: JobState) {
        let Some(worker) = self.registry.get(conn).map(|w| w.name.clone()) else {
            tracing::warn!(conn, job_id, "Job report from unregistered connection");
            return;
        };
        if !(JobState::Running..=JobState::Error).contains(&state) {
            tracing::warn!(conn, job_id, state = %state, "Workers may only report running or finished jobs");
            return;
        }
        let Some(mut job) = self.load_job(job_id) else {
            return;
        };
        if job.workstation.as_deref() != Some(worker.as_str()) {
            tracing::warn!(job_id, worker = %worker, bound = ?job.workstation, "Job report from a worker the job is not bound to");
            return;
        }
        if !job.advance(state) {
            tracing::debug!(job_id, current = %job.state, reported = %state, "Stale job report ignored");
            return;
        }

        job.log(format!("Job state changed to {} on {}", state, worker));
        self.reservations.release(&mut self.wheel, job_id);
        self.persist(&job);
        tracing::info!(job_id, worker = %worker, state = %state, "Job state reported");

        if state.is_terminal() {
            self.send(conn, Outbound::GetResults { job_id });
            self.requeue_backlog();
        }
    }

    pub(super) fn put_finished(&mut self, conn: ConnId, job_id: JobId, filename: &str) {
        let Some(mut job) = self.load_job(job_id) else {
            return;
        };
        let worker = self
            .registry
            .get(conn)
            .map(|w| w.name.clone())
            .unwrap_or_else(|| conn.to_string());
        job.log(format!("{} received {}", worker, filename));
        self.persist(&job);
    }

    /// The connection is gone, by close, read error or missed heartbeats.
    ///
    /// Safe to call more than once for the same connection.
    pub(super) fn connection_lost(&mut self, conn: ConnId) {
        if self.connections.remove(conn).is_none() {
            return;
        }
        self.liveness.remove(&mut self.wheel, conn);

        let Some(worker) = self.registry.remove(conn) else {
            tracing::debug!(conn, "Connection closed");
            return;
        };
        tracing::warn!(conn, worker = %worker.name, "Worker lost");

        let bound = JobFilter::in_states(&[JobState::Dispatched, JobState::Running])
            .with_workstation(worker.name.as_str());
        match self.store.jobs(&bound) {
            Ok(jobs) => {
                for mut job in jobs {
                    let message = format!("Lost connection to workstation {}", worker.name);
                    self.fail_job(&mut job, JobState::WorkstationError, message);
                }
            }
            Err(e) => tracing::error!(worker = %worker.name, error = %e, "Failed to load bound jobs"),
        }

        self.requeue_backlog();
    }

    /// A file finished arriving on `conn`.
    ///
    /// Job archives for QUEUED jobs become the job directory, archives for
    /// finished jobs become their results. Files from any connection other
    /// than the submitting client or the bound worker are discarded.
    pub(super) async fn file_received(&mut self, conn: ConnId, file: ReceivedFile) {
        let job_id = file.header.job_id;
        if let Some(job) = self.load_job(job_id) {
            if self.entitled_sender(conn, &job) {
                self.accept_file(conn, job, &file).await;
            } else {
                tracing::warn!(conn, job_id, state = %job.state, "Discarding file from a connection not entitled to it");
            }
        }

        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            tracing::debug!(path = %file.path.display(), error = %e, "Failed to remove spooled file");
        }
    }

    /// Uploads come from the client that submitted the job, results from the
    /// worker the job is bound to.
    fn entitled_sender(&self, conn: ConnId, job: &Job) -> bool {
        if job.state == JobState::Queued {
            return self.awaiting_upload.get(&job.id) == Some(&conn);
        }
        job.state >= JobState::Dispatched
            && job
                .workstation
                .as_deref()
                .and_then(|name| self.registry.by_name(name))
                == Some(conn)
    }

    async fn accept_file(&mut self, conn: ConnId, mut job: Job, file: &ReceivedFile) {
        let job_id = job.id;
        if !file.verified {
            if job.state < JobState::Running {
                self.awaiting_upload.remove(&job_id);
                self.queue.remove(&mut self.wheel, job_id);
                if job.state == JobState::Dispatched {
                    self.send(conn, Outbound::KillJob { job_id });
                }
                self.fail_job(&mut job, JobState::Deleted, "Uploaded job files are corrupt, job deleted");
            } else {
                job.log("Received results are corrupt, requesting them again");
                self.persist(&job);
                self.send(conn, Outbound::GetResults { job_id });
            }
        } else if job.state == JobState::Queued {
            match self.unpack(file, self.config.job_dir(job_id)).await {
                Ok(()) => {
                    job.log("Job files received");
                    self.persist(&job);
                    self.awaiting_upload.remove(&job_id);
                    self.queue.push_back(&mut self.wheel, job_id);
                }
                Err(e) => {
                    self.fail_job(&mut job, JobState::SchedulerError, format!("Unpacking job files failed: {}", e));
                }
            }
        } else if job.state.is_terminal() && !job.state.is_archived() && job.state != JobState::Deleted {
            match self.unpack(file, self.config.job_results_dir(job_id)).await {
                Ok(()) => {
                    job.log("Results received");
                    self.persist(&job);
                    tracing::info!(job_id, "Results received");
                }
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Unpacking results failed");
                    job.log(format!("Unpacking results failed: {}", e));
                    self.persist(&job);
                }
            }
        } else {
            tracing::warn!(job_id, state = %job.state, "Unexpected file for job");
        }
    }

    async fn unpack(&self, file: &ReceivedFile, dest: PathBuf) -> Result<()> {
        let archive_path = file.path.clone();
        tokio::task::spawn_blocking(move || archive::unpack(&archive_path, &dest))
            .await
            .map_err(|e| FleetError::Internal(e.to_string()))?
    }
}
