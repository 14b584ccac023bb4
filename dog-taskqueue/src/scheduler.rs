use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{config::PriorityWeights, fifo::FifoQueue, JobId, PriorityTier};

/// Number of ready jobs per lane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSizes {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl LaneSizes {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

/// Three FIFO lanes served by weighted round-robin.
///
/// With weights 3:2:1 every round of six selections follows the slot
/// pattern `H H H M M L`. A slot whose lane is empty rolls over to the
/// first non-empty lane in priority order, so `next` never waits on an
/// empty lane and LOW waits at most one round while it has work.
pub struct PriorityScheduler {
    lanes: [FifoQueue<JobId>; 3],
    weights: PriorityWeights,
    /// Position in the current round; also serializes selections
    cursor: Mutex<u64>,
}

impl PriorityScheduler {
    pub fn new(weights: PriorityWeights) -> Self {
        Self {
            lanes: [FifoQueue::new(), FifoQueue::new(), FifoQueue::new()],
            weights,
            cursor: Mutex::new(0),
        }
    }

    pub fn weights(&self) -> PriorityWeights {
        self.weights
    }

    /// Place a ready job at the tail of its tier's lane
    pub fn submit(&self, job_id: JobId, tier: PriorityTier) {
        self.lanes[tier.index()].enqueue(job_id);
    }

    /// Select and remove one job by weighted round-robin; `None` if all lanes are empty
    pub fn next(&self) -> Option<JobId> {
        self.next_entry().map(|(_, job_id)| job_id)
    }

    /// Like [`next`](Self::next), also reporting which lane served the job
    pub fn next_entry(&self) -> Option<(PriorityTier, JobId)> {
        let mut cursor = self.cursor.lock();
        if self.is_empty() {
            return None;
        }

        let total = u64::from(self.weights.total());
        if total > 0 {
            let slot = *cursor % total;
            *cursor = cursor.wrapping_add(1);

            let preferred = self.tier_for_slot(slot);
            if let Some(job_id) = self.lanes[preferred.index()].dequeue() {
                return Some((preferred, job_id));
            }
        }

        // Roll over to the first non-empty lane in priority order
        self.next_strict_locked()
    }

    /// Always take the highest non-empty lane. Can starve LOW.
    pub fn next_strict(&self) -> Option<JobId> {
        let _cursor = self.cursor.lock();
        self.next_strict_locked().map(|(_, job_id)| job_id)
    }

    fn next_strict_locked(&self) -> Option<(PriorityTier, JobId)> {
        PriorityTier::all().iter().find_map(|tier| {
            self.lanes[tier.index()]
                .dequeue()
                .map(|job_id| (*tier, job_id))
        })
    }

    fn tier_for_slot(&self, slot: u64) -> PriorityTier {
        let mut upper = 0u64;
        for tier in PriorityTier::all() {
            upper += u64::from(self.weights.weight(*tier));
            if slot < upper {
                return *tier;
            }
        }
        PriorityTier::Low
    }

    /// Remove a job from whichever lane holds it
    pub fn remove(&self, job_id: &JobId) -> bool {
        self.lanes
            .iter()
            .map(|lane| lane.retain(|queued| queued != job_id))
            .sum::<usize>()
            > 0
    }

    /// Whether any lane holds the job. O(n).
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.lanes
            .iter()
            .any(|lane| lane.snapshot().iter().any(|queued| queued == job_id))
    }

    /// Ordered copy of one lane, head first
    pub fn lane(&self, tier: PriorityTier) -> Vec<JobId> {
        self.lanes[tier.index()].snapshot()
    }

    pub fn size_by_tier(&self) -> LaneSizes {
        LaneSizes {
            high: self.lanes[0].size(),
            medium: self.lanes[1].size(),
            low: self.lanes[2].size(),
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(FifoQueue::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(FifoQueue::is_empty)
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new(PriorityWeights::default())
    }
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sizes = self.size_by_tier();
        write!(
            f,
            "PriorityScheduler(H:{}, M:{}, L:{})",
            sizes.high, sizes.medium, sizes.low
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(scheduler: &PriorityScheduler, tier: PriorityTier, count: usize) {
        for i in 0..count {
            scheduler.submit(JobId::from(format!("{}_{}", tier, i)), tier);
        }
    }

    #[test]
    fn test_weighted_pattern() {
        let scheduler = PriorityScheduler::default();
        for tier in PriorityTier::all() {
            fill(&scheduler, *tier, 10);
        }

        let tiers: Vec<_> = (0..12)
            .map(|_| scheduler.next_entry().unwrap().0)
            .collect();

        use PriorityTier::*;
        assert_eq!(
            tiers,
            vec![High, High, High, Medium, Medium, Low, High, High, High, Medium, Medium, Low]
        );
    }

    #[test]
    fn test_fifo_within_lane() {
        let scheduler = PriorityScheduler::default();
        scheduler.submit(JobId::from("a"), PriorityTier::Medium);
        scheduler.submit(JobId::from("b"), PriorityTier::Medium);

        assert_eq!(scheduler.next(), Some(JobId::from("a")));
        assert_eq!(scheduler.next(), Some(JobId::from("b")));
        assert_eq!(scheduler.next(), None);
    }

    #[test]
    fn test_empty_lane_rolls_over() {
        let scheduler = PriorityScheduler::default();
        fill(&scheduler, PriorityTier::Low, 3);

        // Every slot rolls over to LOW, nothing blocks
        for _ in 0..3 {
            assert_eq!(scheduler.next_entry().map(|(tier, _)| tier), Some(PriorityTier::Low));
        }
        assert!(scheduler.next().is_none());
    }

    #[test]
    fn test_low_not_starved_by_refilled_high() {
        let scheduler = PriorityScheduler::default();
        scheduler.submit(JobId::from("low"), PriorityTier::Low);

        let mut selections = 0;
        loop {
            scheduler.submit(JobId::new(), PriorityTier::High);
            selections += 1;
            if scheduler.next() == Some(JobId::from("low")) {
                break;
            }
            assert!(selections <= 6, "LOW waited more than one round");
        }
    }

    #[test]
    fn test_strict_priority() {
        let scheduler = PriorityScheduler::default();
        fill(&scheduler, PriorityTier::Low, 1);
        fill(&scheduler, PriorityTier::High, 2);

        assert_eq!(scheduler.next_strict(), Some(JobId::from("high_0")));
        assert_eq!(scheduler.next_strict(), Some(JobId::from("high_1")));
        assert_eq!(scheduler.next_strict(), Some(JobId::from("low_0")));
    }

    #[test]
    fn test_zero_weight_lane_served_by_rollover_only() {
        let scheduler = PriorityScheduler::new(PriorityWeights { high: 1, medium: 0, low: 1 });
        fill(&scheduler, PriorityTier::Medium, 1);
        fill(&scheduler, PriorityTier::High, 1);

        assert_eq!(scheduler.next_entry().unwrap().0, PriorityTier::High);
        // LOW slot is empty, rolls over to MEDIUM
        assert_eq!(scheduler.next_entry().unwrap().0, PriorityTier::Medium);
    }

    #[test]
    fn test_remove_and_sizes() {
        let scheduler = PriorityScheduler::default();
        fill(&scheduler, PriorityTier::High, 2);
        fill(&scheduler, PriorityTier::Low, 1);

        assert_eq!(scheduler.size_by_tier(), LaneSizes { high: 2, medium: 0, low: 1 });
        assert!(scheduler.contains(&JobId::from("high_1")));
        assert!(scheduler.remove(&JobId::from("high_1")));
        assert!(!scheduler.remove(&JobId::from("high_1")));
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.lane(PriorityTier::High), vec![JobId::from("high_0")]);
        assert_eq!(format!("{:?}", scheduler), "PriorityScheduler(H:1, M:0, L:1)");
    }
}
