//! Which trials evaluate on the full validation set.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Full-versus-minibatch evaluation plan for a trial loop.
///
/// Trial numbers start at 1. With minibatching on, trial 1, every
/// `full_eval_every`-th trial and the final trial run on the full validation
/// set; every other trial uses a random minibatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalSchedule {
    pub total_trials: usize,
    /// `None` disables minibatching.
    pub minibatch_size: Option<usize>,
    pub full_eval_every: usize,
}

impl Default for EvalSchedule {
    fn default() -> Self {
        Self::minibatch(10, 5, 5)
    }
}

impl EvalSchedule {
    /// Every trial evaluates the full validation set.
    pub fn full(total_trials: usize) -> Self {
        Self {
            total_trials: total_trials.max(1),
            minibatch_size: None,
            full_eval_every: 1,
        }
    }

    pub fn minibatch(total_trials: usize, minibatch_size: usize, full_eval_every: usize) -> Self {
        Self {
            total_trials: total_trials.max(1),
            minibatch_size: Some(minibatch_size.max(1)),
            full_eval_every: full_eval_every.max(1),
        }
    }

    /// Shortest minibatch plan whose trials ask for at least `candidates`
    /// new instructions. Full trials that re-score a minibatch winner propose
    /// nothing, so the trial count exceeds the candidate count by more than
    /// one. Counts assume the minibatch is smaller than the validation set.
    pub fn for_candidates(candidates: usize, minibatch_size: usize, full_eval_every: usize) -> Self {
        let mut total = candidates + 1;
        loop {
            let schedule = Self::minibatch(total, minibatch_size, full_eval_every);
            if schedule.proposal_count(usize::MAX) >= candidates {
                return schedule;
            }
            total += 1;
        }
    }

    /// Trials that ask the proposer for a new instruction. Trial 1 scores the
    /// starting text. A full trial after minibatch trials re-scores the best
    /// of them instead of proposing.
    pub fn proposal_count(&self, validation_len: usize) -> usize {
        let mut proposals = 0;
        let mut minibatch_since_full = false;
        for trial in 2..=self.total_trials {
            if !self.is_full(trial, validation_len) {
                proposals += 1;
                minibatch_since_full = true;
            } else {
                if !minibatch_since_full {
                    proposals += 1;
                }
                minibatch_since_full = false;
            }
        }
        proposals
    }

    /// Whether `trial` evaluates the full set of `validation_len` items.
    pub fn is_full(&self, trial: usize, validation_len: usize) -> bool {
        match self.minibatch_size {
            None => true,
            Some(size) if size >= validation_len => true,
            Some(_) => {
                trial <= 1 || trial % self.full_eval_every == 0 || trial >= self.total_trials
            }
        }
    }

    /// Validation indices for `trial`, sorted ascending.
    pub fn batch(&self, trial: usize, validation_len: usize, rng: &mut StdRng) -> Vec<usize> {
        let all: Vec<usize> = (0..validation_len).collect();
        if self.is_full(trial, validation_len) {
            return all;
        }
        let size = self.minibatch_size.unwrap_or(validation_len);
        let mut picked: Vec<usize> = all.choose_multiple(rng, size).copied().collect();
        picked.sort_unstable();
        picked
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn full_schedule_is_always_full() {
        let s = EvalSchedule::full(4);
        assert!((1..=4).all(|t| s.is_full(t, 100)));
    }

    #[test]
    fn minibatch_schedule_marks_expected_trials() {
        let s = EvalSchedule::minibatch(7, 2, 3);
        let full: Vec<usize> = (1..=7).filter(|&t| s.is_full(t, 10)).collect();
        assert_eq!(full, vec![1, 3, 6, 7]);
    }

    #[test]
    fn oversized_minibatch_is_full() {
        let s = EvalSchedule::minibatch(5, 10, 3);
        assert!(s.is_full(2, 10));
    }

    #[test]
    fn candidate_plan_proposes_every_candidate() {
        let ten = EvalSchedule::for_candidates(10, 5, 5);
        assert_eq!(ten.total_trials, 14);
        assert_eq!(ten.proposal_count(100), 10);

        let seven = EvalSchedule::for_candidates(7, 5, 5);
        assert_eq!(seven.total_trials, 10);
        assert_eq!(seven.proposal_count(100), 7);
    }

    #[test]
    fn full_schedule_proposes_on_every_later_trial() {
        assert_eq!(EvalSchedule::full(11).proposal_count(3), 10);
    }

    #[test]
    fn batches_are_seeded() {
        let s = EvalSchedule::minibatch(5, 3, 5);
        let a = s.batch(2, 10, &mut StdRng::seed_from_u64(1));
        let b = s.batch(2, 10, &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_eq!(s.batch(1, 10, &mut StdRng::seed_from_u64(1)).len(), 10);
    }

    proptest! {
        #[test]
        fn candidate_plan_is_the_shortest_that_fits(
            candidates in 0usize..40,
            size in 1usize..8,
            every in 1usize..12,
        ) {
            let s = EvalSchedule::for_candidates(candidates, size, every);
            prop_assert!(s.proposal_count(usize::MAX) >= candidates);
            if s.total_trials > candidates + 1 {
                let shorter = EvalSchedule::minibatch(s.total_trials - 1, size, every);
                prop_assert!(shorter.proposal_count(usize::MAX) < candidates);
            }
        }

        #[test]
        fn every_trial_is_near_a_full_evaluation(
            total in 1usize..60,
            every in 1usize..12,
            size in 1usize..8,
            validation in 1usize..20,
        ) {
            let s = EvalSchedule::minibatch(total, size, every);
            prop_assert!(s.is_full(1, validation));
            prop_assert!(s.is_full(total, validation));

            let full: Vec<usize> = (1..=total).filter(|&t| s.is_full(t, validation)).collect();
            for t in 1..=total {
                let nearest = full.iter().map(|&f| f.abs_diff(t)).min().unwrap();
                prop_assert!(nearest < every.max(1));
            }
        }
    }
}
