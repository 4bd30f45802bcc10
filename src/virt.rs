// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Channel virtualization: which logical channels get real voices.
//!
//! All channels keep time; only the top `budget` by audibility are actually
//! mixed. Demoted channels have their DSP chain frozen in place (state is
//! preserved, not rewound), so a later promotion resumes without a cold
//! start.

/// One ranking candidate.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub slot: u32,
    /// Estimated audibility: |volume product along the group path| times
    /// distance attenuation.
    pub audibility: f32,
    /// Creation order, used as the stable tie-breaker.
    pub created_seq: u64,
}

/// The result of a re-rank: slots to run real and slots to virtualize.
#[derive(Debug, Default)]
pub struct Partition {
    pub real: Vec<u32>,
    pub virtualized: Vec<u32>,
}

/// Ranks candidates and partitions them against the voice budget.
pub struct VirtualizationManager {
    budget: usize,
    scratch: Vec<Candidate>,
}

impl VirtualizationManager {
    pub fn new(budget: usize) -> Self {
        Self {
            budget: budget.max(1),
            scratch: Vec::new(),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Partitions `candidates` into the top-`budget` real set and the
    /// remainder. Ordering is by audibility descending; equal audibility
    /// falls back to creation order, so re-ranks are stable across ticks.
    pub fn rerank(&mut self, candidates: &[Candidate], out: &mut Partition) {
        out.real.clear();
        out.virtualized.clear();

        self.scratch.clear();
        self.scratch.extend_from_slice(candidates);
        self.scratch.sort_by(|a, b| {
            b.audibility
                .partial_cmp(&a.audibility)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.created_seq.cmp(&b.created_seq))
        });

        for (i, candidate) in self.scratch.iter().enumerate() {
            if i < self.budget {
                out.real.push(candidate.slot);
            } else {
                out.virtualized.push(candidate.slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(slot: u32, audibility: f32, seq: u64) -> Candidate {
        Candidate {
            slot,
            audibility,
            created_seq: seq,
        }
    }

    #[test]
    fn test_top_k_by_audibility() {
        let mut manager = VirtualizationManager::new(2);
        let mut partition = Partition::default();
        manager.rerank(
            &[
                candidate(0, 0.1, 0),
                candidate(1, 0.9, 1),
                candidate(2, 0.5, 2),
                candidate(3, 0.3, 3),
            ],
            &mut partition,
        );

        assert_eq!(partition.real, vec![1, 2]);
        assert_eq!(partition.virtualized, vec![3, 0]);
    }

    #[test]
    fn test_ties_break_by_creation_order() {
        let mut manager = VirtualizationManager::new(1);
        let mut partition = Partition::default();
        manager.rerank(
            &[candidate(5, 0.5, 10), candidate(6, 0.5, 3)],
            &mut partition,
        );

        // The older channel wins the tie.
        assert_eq!(partition.real, vec![6]);
        assert_eq!(partition.virtualized, vec![5]);
    }

    #[test]
    fn test_under_budget_all_real() {
        let mut manager = VirtualizationManager::new(8);
        let mut partition = Partition::default();
        manager.rerank(&[candidate(1, 0.2, 0)], &mut partition);
        assert_eq!(partition.real, vec![1]);
        assert!(partition.virtualized.is_empty());
    }
}
