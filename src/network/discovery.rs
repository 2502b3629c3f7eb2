use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::protocol::{Inbound, Outbound};

/// Largest datagram we bother to read.
const MAX_DATAGRAM: usize = 8 * 1024;

/// Multicast beacon so workers and clients can find the coordinator.
///
/// Answers `ping` datagrams with `serverAvailable` and repeats the same
/// announcement to the group on a fixed interval.
pub struct DiscoveryBeacon {
    socket: UdpSocket,
    group: SocketAddr,
    interval: Duration,
}

impl DiscoveryBeacon {
    pub async fn bind(config: &DiscoveryConfig) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port)).await?;
        socket.join_multicast_v4(config.group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_ttl_v4(1)?;
        Ok(Self {
            socket,
            group: SocketAddr::V4(SocketAddrV4::new(config.group, config.port)),
            interval: Duration::from_millis(config.broadcast_interval_ms),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let announcement = match Outbound::server_available().to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode discovery announcement");
                return;
            }
        };
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        tracing::info!(group = %self.group, "Discovery beacon started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.socket.send_to(announcement.as_bytes(), self.group).await {
                        tracing::warn!(group = %self.group, error = %e, "Discovery broadcast failed");
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::warn!(error = %e, "Discovery receive failed");
                            continue;
                        }
                    };
                    let text = String::from_utf8_lossy(&buf[..len]);
                    match Inbound::parse(text.trim()) {
                        Ok(Inbound::Ping) => {
                            tracing::debug!(from = %from, "Discovery ping");
                            if let Err(e) = self.socket.send_to(announcement.as_bytes(), from).await {
                                tracing::warn!(to = %from, error = %e, "Discovery reply failed");
                            }
                        }
                        // Our own announcements loop back through the group.
                        Ok(_) | Err(_) => {}
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!("Discovery beacon stopped");
    }
}
