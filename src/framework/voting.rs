use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Floor applied to slice probabilities before taking their log.
const LOG_EPS: f32 = 1e-12;

/// How slice predictions are combined into one per-example prediction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteType {
    Majority,
    ProbSum,
    LogProbSum,
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VoteType::Majority => "majority",
            VoteType::ProbSum => "prob_sum",
            VoteType::LogProbSum => "log_prob_sum",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PerExampleStrategy {
    Majority,
    ProbSum,
    LogProbSum,
    All,
}

impl PerExampleStrategy {
    pub fn votes(&self) -> Vec<VoteType> {
        match self {
            PerExampleStrategy::Majority => vec![VoteType::Majority],
            PerExampleStrategy::ProbSum => vec![VoteType::ProbSum],
            PerExampleStrategy::LogProbSum => vec![VoteType::LogProbSum],
            PerExampleStrategy::All => {
                vec![VoteType::Majority, VoteType::ProbSum, VoteType::LogProbSum]
            }
        }
    }
}

/// Index of the largest score; the first one wins ties.
pub fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

/// Class indices ordered by decreasing score, truncated to `k`.
pub fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order = (0..scores.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

impl VoteType {
    /// Per-class scores of one example from its slice probabilities.
    pub fn scores(&self, slice_probs: &[Vec<f32>], classes: usize) -> Vec<f32> {
        let mut scores = vec![0f32; classes];
        for probs in slice_probs {
            match self {
                VoteType::Majority => scores[argmax(probs)] += 1.0,
                VoteType::ProbSum => {
                    for (s, p) in scores.iter_mut().zip(probs) {
                        *s += p;
                    }
                }
                VoteType::LogProbSum => {
                    for (s, p) in scores.iter_mut().zip(probs) {
                        *s += p.max(LOG_EPS).ln();
                    }
                }
            }
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slices() -> Vec<Vec<f32>> {
        vec![
            vec![0.6, 0.4, 0.0],
            vec![0.55, 0.45, 0.0],
            vec![0.0, 0.1, 0.9],
        ]
    }

    #[test]
    fn strategies_can_disagree() {
        let probs = slices();
        // two slices vote for class 0
        assert_eq!(argmax(&VoteType::Majority.scores(&probs, 3)), 0);
        // 1.15 vs 0.95 vs 0.9
        assert_eq!(argmax(&VoteType::ProbSum.scores(&probs, 3)), 0);
        // zeros are heavily penalized in log space, class 1 never is
        assert_eq!(argmax(&VoteType::LogProbSum.scores(&probs, 3)), 1);
    }

    #[test]
    fn majority_counts_slices() {
        assert_eq!(VoteType::Majority.scores(&slices(), 3), vec![2.0, 0.0, 1.0]);
    }

    #[test]
    fn ties_resolve_to_lowest_class() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), 1);
        assert_eq!(top_k(&[1.0, 3.0, 3.0, 2.0], 3), vec![1, 2, 3]);
        assert_eq!(top_k(&[1.0, 2.0], 5), vec![1, 0]);
    }

    #[test]
    fn all_expands_to_every_vote() {
        assert_eq!(
            PerExampleStrategy::All.votes(),
            vec![VoteType::Majority, VoteType::ProbSum, VoteType::LogProbSum]
        );
        assert_eq!(PerExampleStrategy::ProbSum.votes(), vec![VoteType::ProbSum]);
        assert_eq!(VoteType::LogProbSum.to_string(), "log_prob_sum");
    }
}
