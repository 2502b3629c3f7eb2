//! Worker selection.
//!
//! Every candidate is filtered on hard requirements first and only the
//! survivors are scored, so a capability mismatch can never be outweighed by
//! a load preference.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::network::ConnId;
use crate::scheduler::registry::WorkerSnapshot;

/// Tunable constants of the placement engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlacementPolicy {
    /// A core below this load (percent) counts as free.
    pub free_cpu_threshold: f32,
    pub active_user_penalty: i64,
    /// Charged once per installed program the job does not need.
    pub unrequired_program_penalty: i64,
    /// Per free core; added for multi-CPU jobs, subtracted otherwise.
    pub free_cpu_weight: i64,
    pub program_probe_timeout_ms: u64,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            free_cpu_threshold: 20.0,
            active_user_penalty: 100,
            unrequired_program_penalty: 500,
            free_cpu_weight: 100,
            program_probe_timeout_ms: 2_000,
        }
    }
}

impl PlacementPolicy {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.program_probe_timeout_ms)
    }
}

/// Asks a worker to re-check its installed programs.
#[async_trait]
pub trait ProgramProbe: Send + Sync {
    /// Returns the worker's program list, or `None` if it did not answer
    /// within `wait`.
    async fn probe(
        &self,
        conn: ConnId,
        programs: &[String],
        wait: Duration,
    ) -> Option<BTreeSet<String>>;
}

/// A probe that never gets an answer.
pub struct NoProbe;

#[async_trait]
impl ProgramProbe for NoProbe {
    async fn probe(&self, _: ConnId, _: &[String], _: Duration) -> Option<BTreeSet<String>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected {
    pub conn: ConnId,
    pub worker: String,
    pub score: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub selected: Option<Selected>,
    /// Human-readable reasons, destined for the job log.
    pub log: Vec<String>,
    /// Program lists learned from probes during this pass.
    pub probed: Vec<(ConnId, BTreeSet<String>)>,
}

/// Pick the best worker for `job` among `candidates`.
///
/// `pending` holds the coordinator's unconfirmed reservations per worker name.
/// Candidates are visited in the given order and a tie keeps the earlier one.
pub async fn select(
    policy: &PlacementPolicy,
    candidates: &[WorkerSnapshot],
    job: &Job,
    pending: &HashMap<String, u32>,
    probe: &dyn ProgramProbe,
) -> Placement {
    let mut placement = Placement::default();
    let req = &job.requirements;

    for worker in candidates {
        let name = worker.name.as_str();

        if let Some(os) = &req.required_os {
            if !worker.os.eq_ignore_ascii_case(os) {
                placement
                    .log
                    .push(format!("{} not appropriate: requires OS {}, has {}", name, os, worker.os));
                continue;
            }
        }

        let pending_here = pending.get(name).copied().unwrap_or(0);
        let free = worker.free_cpus(policy.free_cpu_threshold, pending_here);
        if free <= 0 {
            placement
                .log
                .push(format!("{} not appropriate: no free CPU", name));
            continue;
        }
        if free < i64::from(req.min_cpu) {
            placement.log.push(format!(
                "{} not appropriate: {} free CPUs, {} required",
                name, free, req.min_cpu
            ));
            continue;
        }

        if req.min_memory > worker.memory.saturating_mul(1024) {
            placement
                .log
                .push(format!("{} not appropriate: not enough memory", name));
            continue;
        }

        let mut programs = worker.programs.clone();
        let missing: Vec<String> = req
            .required_programs
            .iter()
            .filter(|p| !programs.contains(*p))
            .cloned()
            .collect();
        if !missing.is_empty() {
            tracing::info!(job_id = job.id, worker = name, programs = ?missing, "Requesting program check");
            let wanted: Vec<String> = req.required_programs.iter().cloned().collect();
            match probe.probe(worker.conn, &wanted, policy.probe_timeout()).await {
                Some(reported) => {
                    placement.probed.push((worker.conn, reported.clone()));
                    programs = reported;
                }
                None => {
                    tracing::debug!(job_id = job.id, worker = name, "Program check unanswered");
                }
            }
            if let Some(absent) = req.required_programs.iter().find(|p| !programs.contains(*p)) {
                placement.log.push(format!(
                    "{} not appropriate: program '{}' not available",
                    name, absent
                ));
                continue;
            }
        }

        if worker.maintenance {
            placement
                .log
                .push(format!("{} not appropriate: in maintenance", name));
            continue;
        }

        let mut score = 0i64;
        if worker.active_users > 0 {
            score -= policy.active_user_penalty;
        }
        let unrequired = programs.difference(&req.required_programs).count() as i64;
        score -= policy.unrequired_program_penalty * unrequired;
        if req.multi_cpu {
            score += policy.free_cpu_weight * free;
        } else {
            score -= policy.free_cpu_weight * free;
        }
        tracing::debug!(job_id = job.id, worker = name, score, free, "Candidate scored");

        let better = placement
            .selected
            .as_ref()
            .map_or(true, |best| score > best.score);
        if better {
            placement.selected = Some(Selected {
                conn: worker.conn,
                worker: name.to_string(),
                score,
            });
        }
    }

    match &placement.selected {
        Some(best) => placement
            .log
            .push(format!("Workstation {} ({}) selected", best.worker, best.score)),
        None => placement
            .log
            .push("No appropriate workstation found".to_string()),
    }
    placement
}
