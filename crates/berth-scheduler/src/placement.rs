//! Cluster placement decisions

use berth_core::{ClusterId, ResourceVector};

/// Capacity of one cluster as seen by a placement strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    pub cluster_id: ClusterId,
    pub total: ResourceVector,
    pub available: ResourceVector,
}

/// Strategy for choosing a cluster for a deployment
pub trait PlacementStrategy: Send + Sync {
    /// Clusters able to hold `request`, best first
    ///
    /// `preferred` is the deployment's previous cluster, if any.
    fn rank(
        &self,
        request: &ResourceVector,
        clusters: &[ClusterView],
        preferred: Option<ClusterId>,
    ) -> Vec<ClusterId>;
}

/// Score scale for normalized leftover (parts per million of each dimension)
const SCORE_SCALE: u128 = 1_000_000;

/// Tightest-fit placement: least leftover capacity after admission wins
///
/// Leftover is normalized per dimension by the cluster's total so that CPU,
/// RAM and GPU weigh equally. Ties are broken by cluster ID.
pub struct TightestFit;

impl TightestFit {
    /// Normalized leftover of `available - request`; lower is tighter
    pub fn leftover_score(request: &ResourceVector, view: &ClusterView) -> u64 {
        fn part(left: u64, total: u64) -> u128 {
            if total == 0 {
                0
            } else {
                (left as u128 * SCORE_SCALE) / total as u128
            }
        }

        let left = view.available.saturating_sub(request);
        let score = part(left.cpu.millis(), view.total.cpu.millis())
            + part(left.ram.millis(), view.total.ram.millis())
            + part(left.gpu as u64, view.total.gpu as u64);
        score.min(u64::MAX as u128) as u64
    }
}

impl PlacementStrategy for TightestFit {
    fn rank(
        &self,
        request: &ResourceVector,
        clusters: &[ClusterView],
        preferred: Option<ClusterId>,
    ) -> Vec<ClusterId> {
        let mut fitting: Vec<(bool, u64, ClusterId)> = clusters
            .iter()
            .filter(|view| request.fits_within(&view.available))
            .map(|view| {
                (
                    Some(view.cluster_id) != preferred,
                    Self::leftover_score(request, view),
                    view.cluster_id,
                )
            })
            .collect();

        fitting.sort();
        fitting.into_iter().map(|(_, _, id)| id).collect()
    }
}
