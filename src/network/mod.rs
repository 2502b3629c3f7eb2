//! TCP transport between the coordinator and its workers and clients.
//!
//! Each accepted socket gets a connection task that owns the socket. The
//! reactor talks to it through a [`ConnectionTable`] of command channels and
//! hears back through `CoordinatorEvent`s.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{FleetError, Result};
use crate::job::JobId;
use crate::protocol::Outbound;
use crate::scheduler::placement::ProgramProbe;

pub mod connection;
pub mod discovery;
pub mod liveness;
pub mod server;
pub mod transfer;

pub use liveness::{LinkState, LivenessMonitor, Verdict};
pub use server::serve;

/// Opaque per-socket identity. A reconnecting worker gets a new one.
pub type ConnId = u64;

/// Capacity of a connection's outbound command channel.
pub const OUTBOUND_BUFFER: usize = 256;

/// Instructions from the reactor to a connection task.
#[derive(Debug)]
pub enum ConnCommand {
    Send(Outbound),
    SendFile {
        job_id: JobId,
        path: PathBuf,
        done: oneshot::Sender<Result<u64>>,
    },
    /// Send `checkForPrograms` and answer with the program list of the next
    /// telemetry report on this connection.
    Probe {
        programs: Vec<String>,
        reply: oneshot::Sender<BTreeSet<String>>,
    },
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub peer: SocketAddr,
    commands: mpsc::Sender<ConnCommand>,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr, commands: mpsc::Sender<ConnCommand>) -> Self {
        Self { peer, commands }
    }
}

/// Live connections, owned by the reactor.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: HashMap<ConnId, ConnectionHandle>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: ConnId, handle: ConnectionHandle) {
        self.conns.insert(conn, handle);
    }

    pub fn remove(&mut self, conn: ConnId) -> Option<ConnectionHandle> {
        self.conns.remove(&conn)
    }

    pub fn ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.conns.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn command(&self, conn: ConnId, command: ConnCommand) -> Result<()> {
        let handle = self
            .conns
            .get(&conn)
            .ok_or_else(|| FleetError::Internal(format!("connection {} is gone", conn)))?;
        handle.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                FleetError::Internal(format!("outbound buffer of connection {} is full", conn))
            }
            mpsc::error::TrySendError::Closed(_) => FleetError::ChannelClosed("connection"),
        })
    }

    /// Queue a frame for `conn` without waiting for it to be written.
    pub fn send(&self, conn: ConnId, frame: Outbound) -> Result<()> {
        self.command(conn, ConnCommand::Send(frame))
    }

    /// Queue a file transfer. The receiver resolves once the file is written.
    pub fn send_file(
        &self,
        conn: ConnId,
        job_id: JobId,
        path: PathBuf,
    ) -> Result<oneshot::Receiver<Result<u64>>> {
        let (done, rx) = oneshot::channel();
        self.command(conn, ConnCommand::SendFile { job_id, path, done })?;
        Ok(rx)
    }

    pub fn close(&self, conn: ConnId) {
        if let Err(e) = self.command(conn, ConnCommand::Close) {
            tracing::debug!(conn, error = %e, "Close on dead connection");
        }
    }

    /// Send `frame` to every connection in `conns`, logging failures.
    pub fn broadcast(&self, conns: &[ConnId], frame: &Outbound) {
        for conn in conns {
            if let Err(e) = self.send(*conn, frame.clone()) {
                tracing::warn!(conn, error = %e, "Broadcast failed");
            }
        }
    }
}

#[async_trait]
impl ProgramProbe for ConnectionTable {
    async fn probe(
        &self,
        conn: ConnId,
        programs: &[String],
        wait: Duration,
    ) -> Option<BTreeSet<String>> {
        let (reply, rx) = oneshot::channel();
        let command = ConnCommand::Probe {
            programs: programs.to_vec(),
            reply,
        };
        if let Err(e) = self.command(conn, command) {
            tracing::warn!(conn, error = %e, "Program probe not sent");
            return None;
        }
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(programs)) => Some(programs),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!(conn, "Program probe timed out");
                None
            }
        }
    }
}
