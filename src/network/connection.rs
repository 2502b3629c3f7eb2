use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::coordinator::CoordinatorEvent;
use crate::error::Result;
use crate::network::transfer::{self, FileReceiver};
use crate::network::{ConnCommand, ConnId};
use crate::protocol::{Inbound, Outbound, EOF_MARKER};

/// Longest accepted line. Chunk frames stay well below this.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Owns one socket: decodes inbound lines into events and writes what the
/// reactor asks for.
pub struct ConnectionTask {
    conn: ConnId,
    peer: SocketAddr,
    events: mpsc::Sender<CoordinatorEvent>,
    commands: mpsc::Receiver<ConnCommand>,
    spool_dir: PathBuf,
    cancel: CancellationToken,
}

struct Session {
    writer: BufWriter<OwnedWriteHalf>,
    receiver: Option<FileReceiver>,
    probes: Vec<oneshot::Sender<BTreeSet<String>>>,
}

impl ConnectionTask {
    pub fn new(
        conn: ConnId,
        peer: SocketAddr,
        events: mpsc::Sender<CoordinatorEvent>,
        commands: mpsc::Receiver<ConnCommand>,
        spool_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            peer,
            events,
            commands,
            spool_dir,
            cancel,
        }
    }

    pub async fn run(mut self, stream: TcpStream) {
        let (read, write) = stream.into_split();
        let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut session = Session {
            writer: BufWriter::new(write),
            receiver: None,
            probes: Vec::new(),
        };

        tracing::debug!(conn = self.conn, peer = %self.peer, "Connection task started");

        loop {
            // Queued frames go out before a cancel is noticed.
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    match self.handle_command(&mut session, command).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            tracing::warn!(conn = self.conn, error = %e, "Write failed, closing connection");
                            break;
                        }
                    }
                }
                line = lines.next() => {
                    match line {
                        Some(Ok(line)) => {
                            if let Err(e) = self.handle_line(&mut session, line).await {
                                tracing::warn!(conn = self.conn, error = %e, "Connection failed");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(conn = self.conn, error = %e, "Read failed, closing connection");
                            break;
                        }
                        None => break,
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        if let Some(receiver) = session.receiver.take() {
            receiver.abandon().await;
        }
        let _ = session.writer.shutdown().await;
        let _ = self
            .events
            .send(CoordinatorEvent::Disconnected { conn: self.conn })
            .await;
        tracing::debug!(conn = self.conn, peer = %self.peer, "Connection task finished");
    }

    /// Returns false when the connection should close.
    async fn handle_command(&mut self, session: &mut Session, command: ConnCommand) -> Result<bool> {
        match command {
            ConnCommand::Send(frame) => {
                write_frame(&mut session.writer, &frame).await?;
            }
            ConnCommand::SendFile { job_id, path, done } => {
                self.set_busy(true).await;
                let result = transfer::send_file(&mut session.writer, job_id, &path).await;
                self.set_busy(false).await;
                let failed = result.is_err();
                let _ = done.send(result);
                if failed {
                    return Ok(false);
                }
            }
            ConnCommand::Probe { programs, reply } => {
                write_frame(&mut session.writer, &Outbound::CheckForPrograms { programs }).await?;
                session.probes.push(reply);
            }
            ConnCommand::Close => return Ok(false),
        }
        Ok(true)
    }

    async fn handle_line(&mut self, session: &mut Session, line: String) -> Result<()> {
        if let Some(mut receiver) = session.receiver.take() {
            if line == EOF_MARKER {
                let file = receiver.finish().await?;
                self.set_busy(false).await;
                self.emit(CoordinatorEvent::FileReceived {
                    conn: self.conn,
                    file,
                })
                .await;
                return Ok(());
            }
            match Inbound::parse(&line) {
                Ok(Inbound::Chunk { data }) => {
                    if let Err(e) = receiver.push_chunk(&data).await {
                        receiver.abandon().await;
                        self.set_busy(false).await;
                        return Err(e);
                    }
                    session.receiver = Some(receiver);
                }
                _ => {
                    tracing::warn!(conn = self.conn, "Unexpected frame inside file transfer, dropping it");
                    receiver.abandon().await;
                    self.set_busy(false).await;
                }
            }
            return Ok(());
        }

        let frame = match Inbound::parse(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(conn = self.conn, error = %e, "Rejected frame");
                write_frame(&mut session.writer, &Outbound::failure(e.to_string())).await?;
                return Ok(());
            }
        };

        match frame {
            Inbound::Put(header) => {
                tracing::debug!(conn = self.conn, job_id = header.job_id, file = %header.filename, "Receiving file");
                session.receiver = Some(FileReceiver::create(&self.spool_dir, header).await?);
                self.set_busy(true).await;
            }
            Inbound::Chunk { .. } => {
                tracing::warn!(conn = self.conn, "Chunk outside a file transfer");
            }
            Inbound::Ping => {
                write_frame(&mut session.writer, &Outbound::server_available()).await?;
            }
            Inbound::WorkstationInfo(report) => {
                if let Some(programs) = &report.programs {
                    for probe in session.probes.drain(..) {
                        let _ = probe.send(programs.clone());
                    }
                }
                self.emit(CoordinatorEvent::Message {
                    conn: self.conn,
                    frame: Inbound::WorkstationInfo(report),
                })
                .await;
            }
            frame => {
                self.emit(CoordinatorEvent::Message {
                    conn: self.conn,
                    frame,
                })
                .await;
            }
        }
        Ok(())
    }

    async fn set_busy(&self, busy: bool) {
        self.emit(CoordinatorEvent::TransferState {
            conn: self.conn,
            busy,
        })
        .await;
    }

    async fn emit(&self, event: CoordinatorEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(conn = self.conn, "Coordinator gone, dropping event");
        }
    }
}

async fn write_frame(writer: &mut BufWriter<OwnedWriteHalf>, frame: &Outbound) -> Result<()> {
    let mut line = frame.to_line()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
