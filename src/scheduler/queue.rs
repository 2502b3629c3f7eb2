use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::job::JobId;
use crate::timer::{TimerKey, TimerKind, TimerWheel};

/// Job ids waiting for a placement pass, drained one per dispatch tick.
///
/// The queue owns the `DispatchTick` timer: the first enqueue into an idle
/// queue arms it to fire immediately, every tick that leaves jobs behind
/// re-arms it one interval later, and it stays disarmed while the queue is
/// empty.
#[derive(Debug)]
pub struct DispatchQueue {
    order: VecDeque<JobId>,
    members: HashSet<JobId>,
    tick: Option<TimerKey>,
    interval: Duration,
}

impl DispatchQueue {
    pub fn new(interval: Duration) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            tick: None,
            interval,
        }
    }

    /// Append a job. Returns false if it was already queued.
    pub fn push_back(&mut self, wheel: &mut TimerWheel, job_id: JobId) -> bool {
        if !self.members.insert(job_id) {
            return false;
        }
        self.order.push_back(job_id);
        self.arm_if_idle(wheel);
        true
    }

    /// Queue a job ahead of everything else. Used for jobs that only need
    /// their transfer. Returns false if it was already queued.
    pub fn push_front(&mut self, wheel: &mut TimerWheel, job_id: JobId) -> bool {
        if !self.members.insert(job_id) {
            return false;
        }
        self.order.push_front(job_id);
        self.arm_if_idle(wheel);
        true
    }

    /// The dispatch tick fired: pop the next job and re-arm if more remain.
    pub fn on_tick(&mut self, wheel: &mut TimerWheel) -> Option<JobId> {
        self.tick = None;
        let next = self.pop();
        if !self.order.is_empty() {
            self.tick = Some(wheel.insert(TimerKind::DispatchTick, self.interval));
        }
        next
    }

    pub fn pop(&mut self) -> Option<JobId> {
        let job_id = self.order.pop_front()?;
        self.members.remove(&job_id);
        Some(job_id)
    }

    /// Drop a job that was deleted or aborted while queued.
    pub fn remove(&mut self, wheel: &mut TimerWheel, job_id: JobId) -> bool {
        if !self.members.remove(&job_id) {
            return false;
        }
        self.order.retain(|id| *id != job_id);
        if self.order.is_empty() {
            if let Some(key) = self.tick.take() {
                wheel.cancel(&key);
            }
        }
        true
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.members.contains(&job_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_armed(&self) -> bool {
        self.tick.is_some()
    }

    /// Queued ids, front first.
    pub fn snapshot(&self) -> Vec<JobId> {
        self.order.iter().copied().collect()
    }

    fn arm_if_idle(&mut self, wheel: &mut TimerWheel) {
        if self.tick.is_none() {
            self.tick = Some(wheel.insert(TimerKind::DispatchTick, Duration::ZERO));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn duplicates_are_ignored() {
        let mut wheel = TimerWheel::new();
        let mut queue = DispatchQueue::new(Duration::from_secs(15));
        assert!(queue.push_back(&mut wheel, 1));
        assert!(!queue.push_back(&mut wheel, 1));
        assert!(!queue.push_front(&mut wheel, 1));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn compiled_jobs_jump_the_line() {
        let mut wheel = TimerWheel::new();
        let mut queue = DispatchQueue::new(Duration::from_secs(15));
        queue.push_back(&mut wheel, 1);
        queue.push_back(&mut wheel, 2);
        queue.push_front(&mut wheel, 3);
        assert_eq!(queue.snapshot(), vec![3, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_fires_immediately_then_paces() {
        let mut wheel = TimerWheel::new();
        let mut queue = DispatchQueue::new(Duration::from_secs(15));
        queue.push_back(&mut wheel, 1);
        queue.push_back(&mut wheel, 2);
        assert_eq!(wheel.len(), 1);

        let start = tokio::time::Instant::now();
        assert_eq!(wheel.next().await, Some(TimerKind::DispatchTick));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.on_tick(&mut wheel), Some(1));

        assert_eq!(wheel.next().await, Some(TimerKind::DispatchTick));
        assert!(start.elapsed() >= Duration::from_secs(15));
        assert_eq!(queue.on_tick(&mut wheel), Some(2));

        // Drained: the tick disarms itself.
        assert!(!queue.is_armed());
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removing_the_last_job_disarms_the_tick() {
        let mut wheel = TimerWheel::new();
        let mut queue = DispatchQueue::new(Duration::from_secs(15));
        queue.push_back(&mut wheel, 5);
        assert!(queue.remove(&mut wheel, 5));
        assert!(!queue.contains(5));
        assert!(!queue.is_armed());
        assert!(wheel.is_empty());
        assert!(!queue.remove(&mut wheel, 5));
    }
}
