use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::time::delay_queue::{DelayQueue, Key};

use crate::job::JobId;
use crate::network::ConnId;

pub type TimerKey = Key;

/// What a timer entry is for. Every entry has exactly one owner holding its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Time to send the next heartbeat on a connection.
    HeartbeatDue(ConnId),
    /// The pending heartbeat on a connection went unanswered.
    HeartbeatTimeout(ConnId),
    ReservationExpired(JobId),
    DispatchTick,
}

/// Single timer wheel driven by the coordinator reactor.
///
/// A key is only valid until its entry fires or is cancelled. Owners must
/// forget the key when they receive the fired entry, since the slot may be
/// reused by a later insert.
pub struct TimerWheel {
    queue: DelayQueue<TimerKind>,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
        }
    }

    pub fn insert(&mut self, kind: TimerKind, after: Duration) -> TimerKey {
        self.queue.insert(kind, after)
    }

    /// Cancel a pending entry. Returns false if the key no longer refers to one.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.queue.try_remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Wait for the next entry to fire. Resolves to `None` right away when
    /// the wheel is empty, so callers in a `select!` should guard on
    /// [`TimerWheel::is_empty`].
    pub async fn next(&mut self) -> Option<TimerKind> {
        self.queue.next().await.map(|expired| expired.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        wheel.insert(TimerKind::DispatchTick, Duration::from_secs(15));
        wheel.insert(TimerKind::HeartbeatDue(1), Duration::from_secs(5));
        wheel.insert(TimerKind::HeartbeatTimeout(1), Duration::from_secs(8));

        assert_eq!(wheel.next().await, Some(TimerKind::HeartbeatDue(1)));
        assert_eq!(wheel.next().await, Some(TimerKind::HeartbeatTimeout(1)));
        assert_eq!(wheel.next().await, Some(TimerKind::DispatchTick));
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_entries_never_fire() {
        let mut wheel = TimerWheel::new();
        let key = wheel.insert(TimerKind::ReservationExpired(9), Duration::from_secs(1));
        wheel.insert(TimerKind::DispatchTick, Duration::from_secs(2));

        assert!(wheel.cancel(&key));
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.next().await, Some(TimerKind::DispatchTick));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_wheel_resolves_immediately() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.next().await, None);
    }
}
