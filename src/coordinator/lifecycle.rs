//! The placement pass a job goes through when the dispatch tick pops it.
//!
//! prepare → job permission → user permission → placement → reserve →
//! compile → transfer. Every step logs to the job, persists the job and
//! only then moves on. Steps whose outcome is already recorded in the job
//! state are skipped, so a pass can be re-run at any point.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::archive;
use crate::error::{FleetError, Result};
use crate::job::{Job, JobId, JobState};
use crate::network::ConnId;
use crate::protocol::Outbound;
use crate::scheduler::compiler::{CompileOutcome, Compiler};
use crate::scheduler::placement;

use super::{Coordinator, CoordinatorEvent};

impl Coordinator {
    pub(super) async fn run_pipeline(&mut self, job_id: JobId) {
        if self.in_flight.contains(&job_id) {
            tracing::debug!(job_id, "Job already has a pass in progress");
            return;
        }
        let Some(mut job) = self.load_job(job_id) else {
            return;
        };
        if job.state >= JobState::Dispatched {
            tracing::debug!(job_id, state = %job.state, "Job no longer needs placement");
            return;
        }

        // Compiled for a worker that is still connected: only the transfer is left.
        if job.state == JobState::Compiled {
            if let Some(worker) = job.workstation.clone() {
                match self.registry.by_name(&worker) {
                    Some(conn) => {
                        self.start_transfer(job, conn).await;
                        return;
                    }
                    None => {
                        job.log(format!("Workstation {} is gone, selecting another", worker));
                        self.persist(&job);
                    }
                }
            }
        }

        if job.state < JobState::Prepared {
            if let Err(e) = self.prepare(&job).await {
                self.fail_job(&mut job, JobState::SchedulerError, format!("Preparing job directory failed: {}", e));
                return;
            }
            job.advance(JobState::Prepared);
            job.log("Job prepared");
            if !self.persist(&job) {
                return;
            }
        }

        if let Err(reason) = self.check_job_permission(&job) {
            self.fail_job(&mut job, JobState::PermissionDenied, reason);
            return;
        }
        if let Err(reason) = self.check_user_permission(&job) {
            self.fail_job(&mut job, JobState::PermissionDenied, reason);
            return;
        }

        let candidates = self.registry.candidates();
        let pending: HashMap<String, u32> = candidates
            .iter()
            .map(|w| (w.name.clone(), self.reservations.pending_for(&w.name)))
            .collect();
        let placement =
            placement::select(&self.policy, &candidates, &job, &pending, &self.connections).await;

        for (conn, programs) in placement.probed {
            self.registry.merge_programs(conn, programs);
        }
        for line in placement.log {
            job.log(line);
        }

        let Some(selected) = placement.selected else {
            if job.state != JobState::Compiled {
                job.advance(JobState::WaitingForWorkstation);
            }
            self.persist(&job);
            self.queue.push_back(&mut self.wheel, job_id);
            tracing::info!(job_id, "No workstation available, job waits");
            return;
        };

        job.workstation = Some(selected.worker.clone());
        self.reservations
            .reserve(&mut self.wheel, job_id, &selected.worker);
        if !self.persist(&job) {
            self.reservations.release(&mut self.wheel, job_id);
            return;
        }
        tracing::info!(job_id, worker = %selected.worker, score = selected.score, "Workstation selected");

        match job.compiler_command.clone() {
            Some(command) if job.state < JobState::Compiled => self.start_compile(job_id, command),
            _ => self.start_transfer(job, selected.conn).await,
        }
    }

    async fn prepare(&self, job: &Job) -> Result<()> {
        tokio::fs::create_dir_all(self.config.job_logs_dir(job.id)).await?;
        tokio::fs::create_dir_all(self.config.job_results_dir(job.id)).await?;
        Ok(())
    }

    fn check_job_permission(&self, job: &Job) -> std::result::Result<(), String> {
        if job.execute_command.trim().is_empty() {
            return Err("Job has no execute command".to_string());
        }
        if job.requirements.required_programs.is_empty() {
            return Ok(());
        }
        let registered: BTreeSet<String> = match self.store.programs() {
            Ok(programs) => programs.into_iter().map(|p| p.name).collect(),
            Err(e) => return Err(format!("Program table unavailable: {}", e)),
        };
        let missing: Vec<&str> = job
            .requirements
            .required_programs
            .iter()
            .filter(|program| !registered.contains(*program))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("Required programs are not registered: {}", missing.join(", ")))
        }
    }

    fn check_user_permission(&self, job: &Job) -> std::result::Result<(), String> {
        match self.store.user(job.owner) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(format!("Owner {} is not a registered user", job.owner)),
            Err(e) => Err(format!("User table unavailable: {}", e)),
        }
    }

    fn start_compile(&mut self, job_id: JobId, command: String) {
        self.in_flight.insert(job_id);
        let compiler = Compiler::new(self.config.job_dir(job_id));
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = compiler.compile(job_id, &command).await;
            if events
                .send(CoordinatorEvent::CompileFinished(outcome))
                .await
                .is_err()
            {
                tracing::debug!(job_id, "Coordinator gone before compile finished");
            }
        });
    }

    pub(super) fn compile_finished(&mut self, outcome: CompileOutcome) {
        let job_id = outcome.job_id;
        self.in_flight.remove(&job_id);
        let Some(mut job) = self.load_job(job_id) else {
            return;
        };

        if outcome.success {
            if !job.advance(JobState::Compiled) {
                tracing::debug!(job_id, state = %job.state, "Compiled job moved on meanwhile");
                return;
            }
            job.log("Compilation succeeded");
            if self.persist(&job) {
                self.queue.push_front(&mut self.wheel, job_id);
            }
        } else {
            let reason = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            self.fail_job(&mut job, JobState::CompilerError, format!("Compilation failed: {}", reason));
        }
    }

    /// Pack the job directory, announce the job to the worker and stream the archive.
    async fn start_transfer(&mut self, mut job: Job, conn: ConnId) {
        let job_id = job.id;
        let archive_path = self.config.temp_dir().join(format!("{}.tar", job_id));

        if let Err(e) = self.pack(self.config.job_dir(job_id), archive_path.clone()).await {
            self.fail_job(&mut job, JobState::SchedulerError, format!("Packing job failed: {}", e));
            return;
        }

        let announce = Outbound::AddJob {
            job_id,
            job_name: job.name.clone(),
            execute_command: job.execute_command.clone(),
            min_cpu: job.requirements.min_cpu,
            multi_cpu: job.requirements.multi_cpu,
            required_programs: job.requirements.required_programs.iter().cloned().collect(),
        };
        let sent = self
            .connections
            .send(conn, announce)
            .and_then(|()| self.connections.send_file(conn, job_id, archive_path.clone()));
        let done = match sent {
            Ok(done) => done,
            Err(e) => {
                remove_quietly(&archive_path).await;
                self.fail_job(&mut job, JobState::SchedulerError, format!("Sending job failed: {}", e));
                return;
            }
        };

        self.in_flight.insert(job_id);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match done.await {
                Ok(result) => result,
                Err(_) => Err(FleetError::ChannelClosed("connection")),
            };
            let _ = events
                .send(CoordinatorEvent::TransferFinished {
                    conn,
                    job_id,
                    result,
                })
                .await;
        });
    }

    pub(super) async fn transfer_finished(&mut self, conn: ConnId, job_id: JobId, result: Result<u64>) {
        self.in_flight.remove(&job_id);
        remove_quietly(&self.config.temp_dir().join(format!("{}.tar", job_id))).await;
        let Some(mut job) = self.load_job(job_id) else {
            return;
        };

        match result {
            Ok(size) => {
                if !job.advance(JobState::Dispatched) {
                    tracing::debug!(job_id, state = %job.state, "Transferred job moved on meanwhile");
                    return;
                }
                let worker = job.workstation.clone().unwrap_or_default();
                job.log(format!("Job sent to workstation {}", worker));
                self.persist(&job);
                tracing::info!(job_id, conn, worker = %worker, size, "Job dispatched");

                let job_dir = self.config.job_dir(job_id);
                match tokio::task::spawn_blocking(move || archive::clear_files(&job_dir)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(job_id, error = %e, "Failed to clear job directory"),
                    Err(e) => tracing::warn!(job_id, error = %e, "Clearing job directory panicked"),
                }
            }
            Err(e) => {
                self.fail_job(&mut job, JobState::SchedulerError, format!("Transfer failed: {}", e));
            }
        }
    }

    pub(super) async fn pack(&self, source_dir: PathBuf, dest: PathBuf) -> Result<()> {
        tokio::task::spawn_blocking(move || archive::pack(&dest, &source_dir))
            .await
            .map_err(|e| FleetError::Internal(e.to_string()))?
    }
}

pub(super) async fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}
