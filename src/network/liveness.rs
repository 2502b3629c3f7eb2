use std::collections::HashMap;

use crate::config::HeartbeatConfig;
use crate::network::ConnId;
use crate::timer::{TimerKey, TimerKind, TimerWheel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    AwaitingResponse,
}

/// What a missed heartbeat means for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    Dead,
}

#[derive(Debug)]
struct Link {
    state: LinkState,
    misses: u32,
    busy: bool,
    due: Option<TimerKey>,
    timeout: Option<TimerKey>,
}

/// Per-connection heartbeat bookkeeping.
///
/// Each connection owns a `HeartbeatDue` timer that paces outgoing
/// heartbeats and, while a heartbeat is outstanding, a `HeartbeatTimeout`
/// timer that is cancelled as soon as the response arrives.
#[derive(Debug)]
pub struct LivenessMonitor {
    links: HashMap<ConnId, Link>,
    config: HeartbeatConfig,
}

impl LivenessMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            links: HashMap::new(),
            config,
        }
    }

    /// Start tracking a connection; its first heartbeat is due one interval from now.
    pub fn add(&mut self, wheel: &mut TimerWheel, conn: ConnId) {
        let due = wheel.insert(TimerKind::HeartbeatDue(conn), self.config.interval());
        if let Some(old) = self.links.insert(
            conn,
            Link {
                state: LinkState::Connected,
                misses: 0,
                busy: false,
                due: Some(due),
                timeout: None,
            },
        ) {
            cancel_all(wheel, old);
        }
    }

    /// Stop tracking a connection and cancel its timers.
    pub fn remove(&mut self, wheel: &mut TimerWheel, conn: ConnId) -> bool {
        match self.links.remove(&conn) {
            Some(link) => {
                cancel_all(wheel, link);
                true
            }
            None => false,
        }
    }

    /// The `HeartbeatDue` timer fired. Returns true if a heartbeat should be
    /// sent now; the next one is scheduled either way.
    pub fn heartbeat_due(&mut self, wheel: &mut TimerWheel, conn: ConnId) -> bool {
        let Some(link) = self.links.get_mut(&conn) else {
            return false;
        };
        link.due = Some(wheel.insert(TimerKind::HeartbeatDue(conn), self.config.interval()));
        if link.state == LinkState::AwaitingResponse {
            // Still waiting on the previous one.
            return false;
        }
        link.state = LinkState::AwaitingResponse;
        link.timeout = Some(wheel.insert(TimerKind::HeartbeatTimeout(conn), self.config.timeout()));
        true
    }

    /// A heartbeat response arrived.
    pub fn response(&mut self, wheel: &mut TimerWheel, conn: ConnId) {
        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };
        if let Some(key) = link.timeout.take() {
            wheel.cancel(&key);
        }
        if link.misses > 0 {
            tracing::debug!(conn, misses = link.misses, "Heartbeat answered after misses");
        }
        link.state = LinkState::Connected;
        link.misses = 0;
    }

    /// The `HeartbeatTimeout` timer fired.
    pub fn timed_out(&mut self, conn: ConnId) -> Verdict {
        let Some(link) = self.links.get_mut(&conn) else {
            return Verdict::Alive;
        };
        link.timeout = None;
        link.state = LinkState::Connected;

        if link.busy {
            tracing::info!(conn, "Heartbeat missed during file transfer, not counted");
            return Verdict::Alive;
        }

        link.misses += 1;
        tracing::warn!(conn, misses = link.misses, max = self.config.max_missed, "Heartbeat missed");
        if link.misses >= self.config.max_missed {
            Verdict::Dead
        } else {
            Verdict::Alive
        }
    }

    /// Flag a connection as busy with a file transfer.
    pub fn set_busy(&mut self, conn: ConnId, busy: bool) {
        if let Some(link) = self.links.get_mut(&conn) {
            link.busy = busy;
        }
    }

    pub fn state(&self, conn: ConnId) -> Option<LinkState> {
        self.links.get(&conn).map(|link| link.state)
    }

    pub fn misses(&self, conn: ConnId) -> Option<u32> {
        self.links.get(&conn).map(|link| link.misses)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

fn cancel_all(wheel: &mut TimerWheel, link: Link) {
    if let Some(key) = link.due {
        wheel.cancel(&key);
    }
    if let Some(key) = link.timeout {
        wheel.cancel(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the wheel until the next timeout fires for `conn`, answering
    /// nothing.
    async fn miss_one(monitor: &mut LivenessMonitor, wheel: &mut TimerWheel, conn: ConnId) -> Verdict {
        loop {
            match wheel.next().await {
                Some(TimerKind::HeartbeatDue(c)) => {
                    monitor.heartbeat_due(wheel, c);
                }
                Some(TimerKind::HeartbeatTimeout(c)) if c == conn => {
                    return monitor.timed_out(c);
                }
                other => panic!("unexpected timer {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn response_cancels_timeout_and_resets_misses() {
        let mut wheel = TimerWheel::new();
        let mut monitor = LivenessMonitor::new(HeartbeatConfig::default());
        monitor.add(&mut wheel, 1);

        assert_eq!(miss_one(&mut monitor, &mut wheel, 1).await, Verdict::Alive);
        assert_eq!(monitor.misses(1), Some(1));

        assert_eq!(wheel.next().await, Some(TimerKind::HeartbeatDue(1)));
        assert!(monitor.heartbeat_due(&mut wheel, 1));
        assert_eq!(monitor.state(1), Some(LinkState::AwaitingResponse));
        monitor.response(&mut wheel, 1);
        assert_eq!(monitor.misses(1), Some(0));
        // Only the next due timer is left.
        assert_eq!(wheel.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_every_timer() {
        let mut wheel = TimerWheel::new();
        let mut monitor = LivenessMonitor::new(HeartbeatConfig::default());
        monitor.add(&mut wheel, 1);
        assert_eq!(wheel.next().await, Some(TimerKind::HeartbeatDue(1)));
        monitor.heartbeat_due(&mut wheel, 1);
        assert_eq!(wheel.len(), 2);
        assert!(monitor.remove(&mut wheel, 1));
        assert!(wheel.is_empty());
    }
}
