use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::job::JobId;
use crate::timer::{TimerKey, TimerKind, TimerWheel};

#[derive(Debug, Clone)]
pub struct Reservation {
    pub worker: String,
    pub since: DateTime<Utc>,
    key: TimerKey,
}

/// Soft CPU claims taken between placement and the worker confirming the job.
///
/// Every reservation owns one `ReservationExpired` timer in the wheel.
#[derive(Debug)]
pub struct ReservationTable {
    entries: HashMap<JobId, Reservation>,
    ttl: Duration,
}

impl ReservationTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Reserve one CPU on `worker` for `job_id`, replacing an older claim.
    pub fn reserve(&mut self, wheel: &mut TimerWheel, job_id: JobId, worker: &str) {
        self.release(wheel, job_id);
        let key = wheel.insert(TimerKind::ReservationExpired(job_id), self.ttl);
        self.entries.insert(
            job_id,
            Reservation {
                worker: worker.to_string(),
                since: Utc::now(),
                key,
            },
        );
        tracing::debug!(job_id, worker, "CPU reserved");
    }

    /// Drop the claim and cancel its timer.
    pub fn release(&mut self, wheel: &mut TimerWheel, job_id: JobId) -> Option<Reservation> {
        let reservation = self.entries.remove(&job_id)?;
        wheel.cancel(&reservation.key);
        tracing::debug!(job_id, worker = %reservation.worker, "CPU reservation released");
        Some(reservation)
    }

    /// The timer for `job_id` fired. Its key is already gone from the wheel.
    pub fn expire(&mut self, job_id: JobId) -> Option<Reservation> {
        let reservation = self.entries.remove(&job_id)?;
        tracing::info!(job_id, worker = %reservation.worker, "CPU reservation expired unconfirmed");
        Some(reservation)
    }

    /// Number of unconfirmed reservations held on `worker`.
    pub fn pending_for(&self, worker: &str) -> u32 {
        self.entries.values().filter(|r| r.worker == worker).count() as u32
    }

    pub fn get(&self, job_id: JobId) -> Option<&Reservation> {
        self.entries.get(&job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_reservation_expires() {
        let mut wheel = TimerWheel::new();
        let mut table = ReservationTable::new(Duration::from_secs(1800));
        table.reserve(&mut wheel, 7, "ws1");
        assert_eq!(table.pending_for("ws1"), 1);

        let fired = wheel.next().await;
        assert_eq!(fired, Some(TimerKind::ReservationExpired(7)));
        assert_eq!(table.expire(7).map(|r| r.worker), Some("ws1".to_string()));
        assert_eq!(table.pending_for("ws1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_cancels_the_timer() {
        let mut wheel = TimerWheel::new();
        let mut table = ReservationTable::new(Duration::from_secs(60));
        table.reserve(&mut wheel, 1, "ws1");
        table.reserve(&mut wheel, 2, "ws1");
        assert!(table.release(&mut wheel, 1).is_some());
        assert!(table.release(&mut wheel, 1).is_none());
        assert_eq!(wheel.len(), 1);
        assert_eq!(table.pending_for("ws1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn re_reserving_replaces_the_claim() {
        let mut wheel = TimerWheel::new();
        let mut table = ReservationTable::new(Duration::from_secs(60));
        table.reserve(&mut wheel, 1, "ws1");
        table.reserve(&mut wheel, 1, "ws2");
        assert_eq!(wheel.len(), 1);
        assert_eq!(table.pending_for("ws1"), 0);
        assert_eq!(table.pending_for("ws2"), 1);
    }
}
