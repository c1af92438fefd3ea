//! Preemption victim selection
//!
//! Given the running allocations of one cluster, picks the cheapest set of
//! strictly lower-priority deployments whose release covers a request's
//! deficit. Sets are ranked by:
//! 1. fewest victims
//! 2. lowest sum of victim priorities
//! 3. most recently started victims (long-running work is preserved)
//! 4. deployment ID

use berth_core::{
    AllocationId, BerthError, BerthResult, ClusterId, DeploymentId, Priority, ResourceVector,
};
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use tracing::{debug, warn};

/// A running allocation that may be evicted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreemptionCandidate {
    pub deployment_id: DeploymentId,
    pub allocation_id: AllocationId,
    pub priority: Priority,
    pub resources: ResourceVector,
    pub started_at: DateTime<Utc>,
}

/// Deployments chosen for eviction on one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimSet {
    pub cluster_id: ClusterId,
    pub victims: Vec<PreemptionCandidate>,
    /// Resources released by evicting every victim
    pub freed: ResourceVector,
    /// False when the search budget ran out and the greedy plan was used
    pub exact: bool,
}

impl VictimSet {
    pub fn len(&self) -> usize {
        self.victims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }

    /// Sum of victim priorities
    pub fn priority_cost(&self) -> u64 {
        self.victims.iter().map(|v| v.priority.value() as u64).sum()
    }

    /// Ordering used to compare plans across clusters
    pub fn rank(&self) -> (usize, u64, ClusterId) {
        (self.len(), self.priority_cost(), self.cluster_id)
    }
}

/// Reject plans that would evict equal-or-higher priority work
pub fn verify_victims(
    requester: DeploymentId,
    requester_priority: Priority,
    set: &VictimSet,
) -> BerthResult<()> {
    match set.victims.iter().find(|v| v.priority >= requester_priority) {
        Some(victim) => Err(BerthError::InvalidPriorityComparison {
            requester,
            requester_priority: requester_priority.value(),
            victim: victim.deployment_id,
            victim_priority: victim.priority.value(),
        }),
        None => Ok(()),
    }
}

/// Eviction preference: lowest priority, then newest, then ID
fn preference(a: &PreemptionCandidate, b: &PreemptionCandidate) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(b.started_at.cmp(&a.started_at))
        .then(a.deployment_id.cmp(&b.deployment_id))
}

type SetKey = (u64, Reverse<Vec<DateTime<Utc>>>, Vec<DeploymentId>);

fn set_key(victims: &[&PreemptionCandidate]) -> SetKey {
    let cost: u64 = victims.iter().map(|v| v.priority.value() as u64).sum();
    let mut started: Vec<DateTime<Utc>> = victims.iter().map(|v| v.started_at).collect();
    started.sort_by(|a, b| b.cmp(a));
    let mut ids: Vec<DeploymentId> = victims.iter().map(|v| v.deployment_id).collect();
    ids.sort();
    (cost, Reverse(started), ids)
}

/// Bounded exhaustive search over candidate combinations
struct ExactSearch<'a> {
    eligible: &'a [&'a PreemptionCandidate],
    /// `suffix[i]` is the total of `eligible[i..]`
    suffix: Vec<ResourceVector>,
    deficit: ResourceVector,
    budget: usize,
    examined: usize,
    exhausted: bool,
    best: Option<(SetKey, Vec<usize>)>,
}

impl<'a> ExactSearch<'a> {
    fn new(eligible: &'a [&'a PreemptionCandidate], deficit: ResourceVector, budget: usize) -> Self {
        let mut suffix = vec![ResourceVector::zero(); eligible.len() + 1];
        for i in (0..eligible.len()).rev() {
            suffix[i] = suffix[i + 1] + eligible[i].resources;
        }
        Self {
            eligible,
            suffix,
            deficit,
            budget,
            examined: 0,
            exhausted: false,
            best: None,
        }
    }

    fn run(&mut self) {
        for size in 1..=self.eligible.len() {
            let mut chosen = Vec::with_capacity(size);
            self.visit(0, size, &mut chosen, ResourceVector::zero(), 0);
            if self.best.is_some() || self.exhausted {
                return;
            }
        }
    }

    fn visit(
        &mut self,
        start: usize,
        remaining: usize,
        chosen: &mut Vec<usize>,
        freed: ResourceVector,
        cost: u64,
    ) {
        if self.examined >= self.budget {
            self.exhausted = true;
            return;
        }
        self.examined += 1;

        if remaining == 0 {
            if self.deficit.fits_within(&freed) {
                let victims: Vec<&PreemptionCandidate> =
                    chosen.iter().map(|&i| self.eligible[i]).collect();
                let key = set_key(&victims);
                if self.best.as_ref().map_or(true, |(best, _)| key < *best) {
                    self.best = Some((key, chosen.clone()));
                }
            }
            return;
        }

        if let Some((best, _)) = &self.best {
            if cost > best.0 {
                return;
            }
        }

        let n = self.eligible.len();
        for i in start..=(n - remaining) {
            // Suffix totals only shrink as i grows.
            if !self.deficit.fits_within(&(freed + self.suffix[i])) {
                break;
            }
            let candidate = self.eligible[i];
            chosen.push(i);
            self.visit(
                i + 1,
                remaining - 1,
                chosen,
                freed + candidate.resources,
                cost + candidate.priority.value() as u64,
            );
            chosen.pop();
            if self.exhausted {
                return;
            }
        }
    }
}

/// Selects minimal-cost victim sets
#[derive(Debug, Clone)]
pub struct PreemptionSelector {
    /// Maximum search nodes examined before falling back to the greedy plan
    search_budget: usize,
}

impl Default for PreemptionSelector {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl PreemptionSelector {
    pub fn new(search_budget: usize) -> Self {
        Self {
            search_budget: search_budget.max(1),
        }
    }

    /// Find victims on `cluster_id` whose release lets `request` fit
    ///
    /// Returns `None` when no combination of strictly lower-priority
    /// candidates covers the deficit. An empty set means the request already
    /// fits.
    pub fn find_victims(
        &self,
        cluster_id: ClusterId,
        candidates: &[PreemptionCandidate],
        available: &ResourceVector,
        request: &ResourceVector,
        requester_priority: Priority,
    ) -> Option<VictimSet> {
        let deficit = request.deficit(available);
        if deficit.is_zero() {
            return Some(VictimSet {
                cluster_id,
                victims: Vec::new(),
                freed: ResourceVector::zero(),
                exact: true,
            });
        }

        let mut eligible: Vec<&PreemptionCandidate> = candidates
            .iter()
            .filter(|c| c.priority < requester_priority)
            .collect();
        eligible.sort_by(|a, b| preference(a, b));

        let reclaimable = eligible
            .iter()
            .fold(ResourceVector::zero(), |acc, c| acc + c.resources);
        if !deficit.fits_within(&reclaimable) {
            debug!(
                cluster_id = %cluster_id,
                deficit = %deficit,
                reclaimable = %reclaimable,
                "No eligible victims cover the deficit"
            );
            return None;
        }

        let mut search = ExactSearch::new(&eligible, deficit, self.search_budget);
        search.run();

        let (indices, exact) = match search.best.take() {
            Some((_, indices)) => (indices, !search.exhausted),
            None => {
                warn!(
                    cluster_id = %cluster_id,
                    candidates = eligible.len(),
                    examined = search.examined,
                    "Preemption search budget exhausted, using greedy plan"
                );
                (greedy(&eligible, &deficit), false)
            }
        };

        let victims: Vec<PreemptionCandidate> =
            indices.iter().map(|&i| eligible[i].clone()).collect();
        let freed = victims
            .iter()
            .fold(ResourceVector::zero(), |acc, v| acc + v.resources);

        debug!(
            cluster_id = %cluster_id,
            victims = victims.len(),
            freed = %freed,
            exact = exact,
            "Selected preemption victims"
        );

        Some(VictimSet {
            cluster_id,
            victims,
            freed,
            exact,
        })
    }
}

/// Take candidates in preference order until the deficit is covered, then
/// drop any victim the rest can do without
fn greedy(eligible: &[&PreemptionCandidate], deficit: &ResourceVector) -> Vec<usize> {
    let mut chosen = Vec::new();
    let mut freed = ResourceVector::zero();
    for (i, candidate) in eligible.iter().enumerate() {
        if deficit.fits_within(&freed) {
            break;
        }
        chosen.push(i);
        freed += candidate.resources;
    }

    let mut i = chosen.len();
    while i > 0 {
        i -= 1;
        let without = freed.saturating_sub(&eligible[chosen[i]].resources);
        if deficit.fits_within(&without) {
            freed = without;
            chosen.remove(i);
        }
    }
    chosen
}
