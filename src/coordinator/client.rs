//! Client requests. Each one is answered with exactly one `response` frame.

use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::archive;
use crate::error::{FleetError, Result};
use crate::job::{Job, JobId, JobState};
use crate::network::ConnId;
use crate::protocol::{Inbound, Outbound};
use crate::store::{JobFilter, User};

use super::lifecycle::remove_quietly;
use super::Coordinator;

fn reply<T: Serialize>(data: &T) -> Result<Outbound> {
    Ok(Outbound::ok(Some(serde_json::to_value(data)?)))
}

fn require_admin(user: &User) -> Result<()> {
    if user.admin {
        Ok(())
    } else {
        Err(FleetError::PermissionDenied(format!("{} is not an administrator", user.email)))
    }
}

impl Coordinator {
    pub(super) async fn handle_client(&mut self, conn: ConnId, frame: Inbound) {
        let username = frame.username().unwrap_or_default().to_string();
        let response = match self.client_request(conn, frame).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(conn, user = %username, error = %e, "Client request failed");
                Outbound::failure(e.to_string())
            }
        };
        self.send(conn, response);
    }

    async fn client_request(&mut self, conn: ConnId, frame: Inbound) -> Result<Outbound> {
        let username = frame.username().unwrap_or_default();
        let user = self
            .store
            .user_by_email(username)?
            .ok_or_else(|| FleetError::UserNotFound(username.to_string()))?;

        match frame {
            Inbound::SubmitJob {
                job, await_upload, ..
            } => {
                let mut job = self.store.add_job(user.id, job)?;
                tokio::fs::create_dir_all(self.config.job_dir(job.id)).await?;
                job.log(format!("Job submitted by {}", user.email));
                self.store.save_job(&job)?;
                if await_upload {
                    self.awaiting_upload.insert(job.id, conn);
                } else {
                    self.queue.push_back(&mut self.wheel, job.id);
                }
                tracing::info!(job_id = job.id, user = %user.email, await_upload, "Job submitted");
                reply(&json!({ "jobId": job.id }))
            }
            Inbound::GetJobs {
                show_all,
                all_users,
                ..
            } => {
                let filter = if all_users && user.admin {
                    JobFilter::default()
                } else {
                    JobFilter::owner(user.id)
                };
                let jobs: Vec<Job> = self
                    .store
                    .jobs(&filter)?
                    .into_iter()
                    .filter(|job| job.state != JobState::Deleted)
                    .filter(|job| show_all || !job.state.is_archived())
                    .collect();
                reply(&jobs)
            }
            Inbound::GetJob { job_id, .. } => reply(&self.owned_job(&user, job_id)?),
            Inbound::GetLog { job_id, .. } => {
                let job = self.owned_job(&user, job_id)?;
                let lines: Vec<String> = job.log_entries().iter().map(|e| e.to_string()).collect();
                reply(&lines)
            }
            Inbound::KillJob { job_id, .. } => self.kill_job(&user, job_id),
            Inbound::PauseJob { job_id, .. } => {
                self.forward_to_worker(&user, job_id, Outbound::PauseJob { job_id }, "paused")
            }
            Inbound::ResumeJob { job_id, .. } => {
                self.forward_to_worker(&user, job_id, Outbound::ResumeJob { job_id }, "resumed")
            }
            Inbound::DeleteJob { job_id, .. } => self.delete_job(&user, job_id).await,
            Inbound::ArchiveJob { job_id, .. } => self.archive_job(&user, job_id).await,
            Inbound::GetResults { job_id, .. } => self.send_results(&user, conn, job_id).await,
            Inbound::CheckUser { .. } => reply(&user),
            Inbound::GetWorkstations { .. } => reply(&self.registry.all()),
            Inbound::GetCompilers { .. } => reply(&self.store.compilers()?),
            Inbound::GetPrograms { .. } => reply(&self.store.programs()?),
            Inbound::GetSchedulingParameters { .. } => reply(&self.policy),
            Inbound::Schedule { .. } => {
                let queued = self.requeue_backlog();
                reply(&json!({ "queued": queued }))
            }
            Inbound::CheckJobs { .. } => {
                let requested = self.check_jobs().await?;
                reply(&json!({ "requested": requested }))
            }
            Inbound::CreateUser { user: new_user, .. } => {
                require_admin(&user)?;
                let created = self.store.add_user(new_user)?;
                tracing::info!(user = %created.email, admin = created.admin, by = %user.email, "User created");
                reply(&created)
            }
            Inbound::DeleteUser { email, .. } => {
                require_admin(&user)?;
                let target = self
                    .store
                    .user_by_email(&email)?
                    .ok_or_else(|| FleetError::UserNotFound(email.clone()))?;
                self.store.delete_user(target.id)?;
                tracing::info!(user = %email, by = %user.email, "User deleted");
                Ok(Outbound::ok(None))
            }
            Inbound::AddProgram { program, .. } => {
                require_admin(&user)?;
                let added = self.store.add_program(program)?;
                self.announce_programs()?;
                reply(&added)
            }
            Inbound::DeleteProgram { name, .. } => {
                require_admin(&user)?;
                if !self.store.delete_program(&name)? {
                    return Ok(Outbound::failure(format!("Program {} is not registered", name)));
                }
                self.announce_programs()?;
                Ok(Outbound::ok(None))
            }
            Inbound::AddCompiler {
                name, description, ..
            } => {
                require_admin(&user)?;
                reply(&self.store.add_compiler(&name, &description)?)
            }
            Inbound::AddPath { path, .. } => {
                require_admin(&user)?;
                self.add_path(&path).await?;
                Ok(Outbound::ok(None))
            }
            Inbound::SetMaintenance {
                workstation,
                maintenance,
                ..
            } => {
                require_admin(&user)?;
                if !self.registry.set_maintenance(&workstation, maintenance) {
                    return Err(FleetError::WorkerNotFound(workstation));
                }
                tracing::info!(worker = %workstation, maintenance, "Maintenance flag changed");
                if !maintenance {
                    self.requeue_backlog();
                }
                Ok(Outbound::ok(None))
            }
            Inbound::UpdateSchedulingParameters { parameters, .. } => {
                require_admin(&user)?;
                tracing::info!(parameters = ?parameters, "Scheduling parameters updated");
                self.policy = parameters;
                reply(&self.policy)
            }
            Inbound::Shutdown { .. } => {
                require_admin(&user)?;
                tracing::info!(by = %user.email, "Shutdown requested by client");
                self.stopping = true;
                Ok(Outbound::ok(None))
            }
            other => Err(FleetError::Protocol(format!("not a client request: {:?}", other))),
        }
    }

    /// Load a job the user may act on: their own, or any job for admins.
    fn owned_job(&self, user: &User, job_id: JobId) -> Result<Job> {
        let job = self
            .store
            .job(job_id)?
            .filter(|job| job.state != JobState::Deleted)
            .ok_or(FleetError::JobNotFound(job_id))?;
        if job.owner != user.id && !user.admin {
            return Err(FleetError::PermissionDenied(format!(
                "job {} belongs to another user",
                job_id
            )));
        }
        Ok(job)
    }

    /// Connection of the worker `job` is bound to, if it is connected.
    fn bound_conn(&self, job: &Job) -> Option<ConnId> {
        job.workstation
            .as_deref()
            .and_then(|name| self.registry.by_name(name))
    }

    fn kill_job(&mut self, user: &User, job_id: JobId) -> Result<Outbound> {
        let mut job = self.owned_job(user, job_id)?;
        if job.state.is_terminal() {
            return Ok(Outbound::failure(format!("Job {} has already ended", job_id)));
        }

        if job.state >= JobState::Dispatched {
            let conn = self
                .bound_conn(&job)
                .ok_or_else(|| FleetError::WorkerNotFound(job.workstation.clone().unwrap_or_default()))?;
            self.connections.send(conn, Outbound::KillJob { job_id })?;
            job.log(format!("Kill requested by {}", user.email));
            self.persist(&job);
            return Ok(Outbound::ok(None));
        }

        // Not on a worker yet: abort here.
        if self.in_flight.contains(&job_id) {
            if let Some(conn) = self.bound_conn(&job) {
                self.send(conn, Outbound::KillJob { job_id });
            }
        }
        self.queue.remove(&mut self.wheel, job_id);
        self.awaiting_upload.remove(&job_id);
        self.fail_job(&mut job, JobState::Aborted, format!("Job aborted by {}", user.email));
        Ok(Outbound::ok(None))
    }

    fn forward_to_worker(
        &mut self,
        user: &User,
        job_id: JobId,
        frame: Outbound,
        action: &str,
    ) -> Result<Outbound> {
        let mut job = self.owned_job(user, job_id)?;
        if job.state != JobState::Running {
            return Ok(Outbound::failure(format!("Job {} is not running", job_id)));
        }
        let conn = self
            .bound_conn(&job)
            .ok_or_else(|| FleetError::WorkerNotFound(job.workstation.clone().unwrap_or_default()))?;
        self.connections.send(conn, frame)?;
        job.log(format!("Job {} by {}", action, user.email));
        self.persist(&job);
        Ok(Outbound::ok(None))
    }

    async fn delete_job(&mut self, user: &User, job_id: JobId) -> Result<Outbound> {
        let mut job = self.owned_job(user, job_id)?;
        if matches!(job.state, JobState::Dispatched | JobState::Running) {
            if let Some(conn) = self.bound_conn(&job) {
                self.send(conn, Outbound::KillJob { job_id });
            }
        }
        self.queue.remove(&mut self.wheel, job_id);
        self.awaiting_upload.remove(&job_id);
        self.reservations.release(&mut self.wheel, job_id);

        job.log(format!("Job deleted by {}", user.email));
        job.advance(JobState::Deleted);
        self.store.save_job(&job)?;

        match tokio::fs::remove_dir_all(self.config.job_dir(job_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(job_id, error = %e, "Failed to remove job directory"),
        }
        tracing::info!(job_id, by = %user.email, "Job deleted");
        Ok(Outbound::ok(None))
    }

    async fn archive_job(&mut self, user: &User, job_id: JobId) -> Result<Outbound> {
        let mut job = self.owned_job(user, job_id)?;
        let Some(archived) = job.state.archived() else {
            return Ok(Outbound::failure(format!(
                "Job {} cannot be archived in state {}",
                job_id, job.state
            )));
        };
        job.advance(archived);
        job.log("Job archived");
        self.store.save_job(&job)?;

        let job_dir = self.config.job_dir(job_id);
        match tokio::task::spawn_blocking(move || archive::clear_files(&job_dir)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(job_id, error = %e, "Nothing to clear in job directory"),
            Err(e) => tracing::warn!(job_id, error = %e, "Clearing job directory panicked"),
        }
        Ok(Outbound::ok(None))
    }

    /// Stream the results directory of a finished job back to the client.
    async fn send_results(&mut self, user: &User, conn: ConnId, job_id: JobId) -> Result<Outbound> {
        let job = self.owned_job(user, job_id)?;
        if !job.state.is_terminal() {
            return Ok(Outbound::failure(format!("Job {} has not finished yet", job_id)));
        }
        let results = self.config.job_results_dir(job_id);
        if !tokio::fs::try_exists(&results).await? {
            return Ok(Outbound::failure(format!("No results for job {}", job_id)));
        }

        let archive_path = self.config.temp_dir().join(format!("{}-results.tar", job_id));
        self.pack(results, archive_path.clone()).await?;
        let done = match self.connections.send_file(conn, job_id, archive_path.clone()) {
            Ok(done) => done,
            Err(e) => {
                remove_quietly(&archive_path).await;
                return Err(e);
            }
        };
        tokio::spawn(async move {
            match done.await {
                Ok(Ok(size)) => tracing::debug!(job_id, size, "Results sent"),
                Ok(Err(e)) => tracing::warn!(job_id, error = %e, "Sending results failed"),
                Err(_) => tracing::warn!(job_id, "Connection closed before results were sent"),
            }
            remove_quietly(&archive_path).await;
        });
        reply(&json!({ "jobId": job_id }))
    }

    /// Ask workers for the state of running jobs and for results that never arrived.
    async fn check_jobs(&mut self) -> Result<usize> {
        let jobs = self.store.jobs(&JobFilter::in_states(&[
            JobState::Running,
            JobState::Done,
            JobState::Aborted,
            JobState::Error,
        ]))?;

        let mut requested = 0;
        for job in jobs {
            let Some(conn) = self.bound_conn(&job) else {
                continue;
            };
            let frame = if job.state == JobState::Running {
                Outbound::GetJobState { job_id: job.id }
            } else if self.has_results(job.id).await {
                continue;
            } else {
                Outbound::GetResults { job_id: job.id }
            };
            if self.send(conn, frame) {
                requested += 1;
            }
        }
        Ok(requested)
    }

    async fn has_results(&self, job_id: JobId) -> bool {
        match tokio::fs::read_dir(self.config.job_results_dir(job_id)).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
            Err(_) => false,
        }
    }

    fn worker_conns(&self) -> Vec<ConnId> {
        self.registry.all().into_iter().map(|w| w.conn).collect()
    }

    fn announce_programs(&self) -> Result<()> {
        let programs = self.store.programs()?.into_iter().map(|p| p.name).collect();
        self.connections
            .broadcast(&self.worker_conns(), &Outbound::CheckForPrograms { programs });
        Ok(())
    }

    async fn add_path(&self, path: &str) -> Result<()> {
        let path = path.trim();
        if path.is_empty() || path.contains('\n') {
            return Err(FleetError::Protocol("invalid search path".to_string()));
        }
        if self.search_paths().await.iter().any(|known| known == path) {
            return Ok(());
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.config.paths_file())
            .await?;
        file.write_all(format!("{}\n", path).as_bytes()).await?;
        file.flush().await?;
        self.connections.broadcast(
            &self.worker_conns(),
            &Outbound::UpdatePath {
                path: path.to_string(),
            },
        );
        Ok(())
    }
}
