//! The coordinator reactor.
//!
//! One task owns the worker registry, liveness monitor, dispatch queue,
//! reservations, timer wheel and the connection table. Connection tasks,
//! compile runs, file transfers and the dashboard only ever talk to it
//! through [`CoordinatorEvent`]s.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::error::{FleetError, Result};
use crate::job::{Job, JobId, JobState};
use crate::network::transfer::ReceivedFile;
use crate::network::{ConnCommand, ConnId, ConnectionHandle, ConnectionTable, LivenessMonitor, Verdict};
use crate::protocol::{Inbound, Outbound};
use crate::scheduler::compiler::CompileOutcome;
use crate::scheduler::placement::PlacementPolicy;
use crate::scheduler::registry::WorkerSnapshot;
use crate::scheduler::{DispatchQueue, ReservationTable, WorkerRegistry};
use crate::store::{JobFilter, Store};
use crate::timer::{TimerKind, TimerWheel};

mod client;
mod lifecycle;
mod workers;

/// Capacity of the reactor's inbound event channel.
pub const EVENT_BUFFER: usize = 1024;

/// Everything the reactor reacts to, apart from its own timers.
#[derive(Debug)]
pub enum CoordinatorEvent {
    Connected {
        conn: ConnId,
        peer: SocketAddr,
        commands: mpsc::Sender<ConnCommand>,
    },
    Disconnected {
        conn: ConnId,
    },
    Message {
        conn: ConnId,
        frame: Inbound,
    },
    FileReceived {
        conn: ConnId,
        file: ReceivedFile,
    },
    /// A file transfer started or ended on the connection.
    TransferState {
        conn: ConnId,
        busy: bool,
    },
    /// An outbound job archive was written to the worker, or failed to be.
    TransferFinished {
        conn: ConnId,
        job_id: JobId,
        result: Result<u64>,
    },
    CompileFinished(CompileOutcome),
    Query(Query),
    Shutdown,
}

/// Read-only questions, answered from the reactor's own state.
#[derive(Debug)]
pub enum Query {
    Workers(oneshot::Sender<Vec<WorkerSnapshot>>),
    Jobs(oneshot::Sender<Vec<Job>>),
    Queue(oneshot::Sender<Vec<JobId>>),
}

/// Cloneable way in to a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub fn new(events: mpsc::Sender<CoordinatorEvent>) -> Self {
        Self { events }
    }

    /// Channel for network tasks that feed the reactor.
    pub fn events(&self) -> mpsc::Sender<CoordinatorEvent> {
        self.events.clone()
    }

    async fn ask<T>(&self, query: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(CoordinatorEvent::Query(query(tx)))
            .await
            .map_err(|_| FleetError::ChannelClosed("coordinator"))?;
        rx.await.map_err(|_| FleetError::ChannelClosed("coordinator"))
    }

    pub async fn workers(&self) -> Result<Vec<WorkerSnapshot>> {
        self.ask(Query::Workers).await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.ask(Query::Jobs).await
    }

    pub async fn queue(&self) -> Result<Vec<JobId>> {
        self.ask(Query::Queue).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.events
            .send(CoordinatorEvent::Shutdown)
            .await
            .map_err(|_| FleetError::ChannelClosed("coordinator"))
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn Store>,
    registry: WorkerRegistry,
    liveness: LivenessMonitor,
    queue: DispatchQueue,
    reservations: ReservationTable,
    wheel: TimerWheel,
    connections: ConnectionTable,
    policy: PlacementPolicy,
    /// Jobs with a compile run or an outbound transfer in progress.
    in_flight: HashSet<JobId>,
    /// Submitted jobs that are enqueued only once their files arrive, with the
    /// connection expected to send them.
    awaiting_upload: HashMap<JobId, ConnId>,
    events_tx: mpsc::Sender<CoordinatorEvent>,
    events: mpsc::Receiver<CoordinatorEvent>,
    cancel: CancellationToken,
    stopping: bool,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn Store>, cancel: CancellationToken) -> Self {
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        Self {
            registry: WorkerRegistry::new(),
            liveness: LivenessMonitor::new(config.heartbeat.clone()),
            queue: DispatchQueue::new(config.tick_interval()),
            reservations: ReservationTable::new(config.reservation_ttl()),
            wheel: TimerWheel::new(),
            connections: ConnectionTable::new(),
            policy: config.placement.clone(),
            in_flight: HashSet::new(),
            awaiting_upload: HashMap::new(),
            config,
            store,
            events_tx,
            events,
            cancel,
            stopping: false,
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle::new(self.events_tx.clone())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run the reactor until shutdown is requested or the token is cancelled.
    pub async fn run(mut self) -> Result<()> {
        self.prepare_working_dir().await?;
        let queued = self.requeue_backlog();
        tracing::info!(
            working_dir = %self.config.working_dir.display(),
            queued,
            "Coordinator started"
        );

        while !self.stopping {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(timer) = self.wheel.next(), if !self.wheel.is_empty() => {
                    self.handle_timer(timer).await;
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        for conn in self.connections.ids() {
            self.connections.close(conn);
        }
        tracing::info!("Coordinator stopped");
        Ok(())
    }

    async fn prepare_working_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.working_dir).await?;
        tokio::fs::create_dir_all(self.config.temp_dir()).await?;
        tokio::fs::create_dir_all(self.config.spool_dir()).await?;
        Ok(())
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Connected {
                conn,
                peer,
                commands,
            } => {
                tracing::debug!(conn, peer = %peer, "Connection registered");
                self.connections
                    .insert(conn, ConnectionHandle::new(peer, commands));
            }
            CoordinatorEvent::Disconnected { conn } => self.connection_lost(conn),
            CoordinatorEvent::Message { conn, frame } => self.handle_message(conn, frame).await,
            CoordinatorEvent::FileReceived { conn, file } => {
                self.file_received(conn, file).await;
            }
            CoordinatorEvent::TransferState { conn, busy } => self.liveness.set_busy(conn, busy),
            CoordinatorEvent::TransferFinished {
                conn,
                job_id,
                result,
            } => self.transfer_finished(conn, job_id, result).await,
            CoordinatorEvent::CompileFinished(outcome) => self.compile_finished(outcome),
            CoordinatorEvent::Query(query) => self.answer(query),
            CoordinatorEvent::Shutdown => {
                tracing::info!("Shutdown requested");
                self.stopping = true;
            }
        }
    }

    async fn handle_message(&mut self, conn: ConnId, frame: Inbound) {
        if frame.username().is_some() {
            self.handle_client(conn, frame).await;
            return;
        }
        match frame {
            Inbound::WorkstationInfo(report) => self.workstation_info(conn, report).await,
            Inbound::JobInfo { job_id, state } => self.job_info(conn, job_id, state),
            Inbound::Heartbeat => {
                self.liveness.response(&mut self.wheel, conn);
                self.send(conn, Outbound::HeartbeatResponse);
            }
            Inbound::HeartbeatResponse => self.liveness.response(&mut self.wheel, conn),
            Inbound::PutFinished { job_id, filename } => self.put_finished(conn, job_id, &filename),
            other => {
                tracing::debug!(conn, frame = ?other, "Ignoring frame");
            }
        }
    }

    async fn handle_timer(&mut self, timer: TimerKind) {
        match timer {
            TimerKind::HeartbeatDue(conn) => {
                if self.liveness.heartbeat_due(&mut self.wheel, conn)
                    && self.connections.send(conn, Outbound::Heartbeat).is_err()
                {
                    self.kill_connection(conn);
                }
            }
            TimerKind::HeartbeatTimeout(conn) => {
                if self.liveness.timed_out(conn) == Verdict::Dead {
                    tracing::warn!(conn, "Worker stopped answering heartbeats");
                    self.kill_connection(conn);
                }
            }
            TimerKind::ReservationExpired(job_id) => {
                self.reservations.expire(job_id);
            }
            TimerKind::DispatchTick => {
                if let Some(job_id) = self.queue.on_tick(&mut self.wheel) {
                    self.run_pipeline(job_id).await;
                }
            }
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Workers(reply) => {
                let workers = self.registry.all().into_iter().cloned().collect();
                let _ = reply.send(workers);
            }
            Query::Jobs(reply) => {
                let jobs = match self.store.jobs(&JobFilter::default()) {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to list jobs");
                        Vec::new()
                    }
                };
                let _ = reply.send(jobs);
            }
            Query::Queue(reply) => {
                let _ = reply.send(self.queue.snapshot());
            }
        }
    }

    /// Queue a frame, logging failures. The connection's own task reports its death.
    fn send(&self, conn: ConnId, frame: Outbound) -> bool {
        match self.connections.send(conn, frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(conn, error = %e, "Send failed");
                false
            }
        }
    }

    fn load_job(&self, job_id: JobId) -> Option<Job> {
        match self.store.job(job_id) {
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                tracing::warn!(job_id, "Unknown job");
                None
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to load job");
                None
            }
        }
    }

    fn persist(&self, job: &Job) -> bool {
        match self.store.save_job(job) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to persist job");
                false
            }
        }
    }

    /// Log, move to `state` and persist.
    fn fail_job(&mut self, job: &mut Job, state: JobState, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(job_id = job.id, state = %state, reason = %message, "Job failed");
        job.log(message);
        job.advance(state);
        self.reservations.release(&mut self.wheel, job.id);
        self.persist(job);
    }

    /// Enqueue every job that still waits for a worker. Returns how many were added.
    fn requeue_backlog(&mut self) -> usize {
        let filter = JobFilter::in_states(&[
            JobState::Queued,
            JobState::Prepared,
            JobState::WaitingForWorkstation,
            JobState::Compiled,
        ]);
        let mut jobs = match self.store.jobs(&filter) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load backlog");
                return 0;
            }
        };
        jobs.retain(|job| {
            !self.in_flight.contains(&job.id) && !self.awaiting_upload.contains_key(&job.id)
        });
        jobs.sort_by_key(|job| job.id);
        let (compiled, rest): (Vec<Job>, Vec<Job>) = jobs
            .into_iter()
            .partition(|job| job.state == JobState::Compiled);

        let mut added = 0;
        for job in rest {
            if self.queue.push_back(&mut self.wheel, job.id) {
                added += 1;
            }
        }
        // Compiled jobs only need the transfer. Oldest ends up first.
        for job in compiled.iter().rev() {
            if self.queue.push_front(&mut self.wheel, job.id) {
                added += 1;
            }
        }
        if added > 0 {
            tracing::debug!(added, queued = self.queue.len(), "Backlog re-enqueued");
        }
        added
    }

    /// Ask a connection task to close and forget the connection now.
    fn kill_connection(&mut self, conn: ConnId) {
        self.connections.close(conn);
        self.connection_lost(conn);
    }
}
