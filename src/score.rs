//! Score accumulation and the final scoring decision.

use std::collections::BTreeMap;

use crate::config::{PenaltyConfig, ScanConfig};
use crate::matcher::{MatchOutcome, MatchPass};

/// Protocol violations that add to the internal penalty score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyKind {
    WrongContentType,
    WrongExtension,
    CorruptFixable,
    CorruptUnfixable,
}

impl PenaltyKind {
    /// Suffix appended to the rule name when reporting the penalty.
    pub fn rule_suffix(&self) -> &'static str {
        match self {
            Self::WrongContentType => "WRONG_CTYPE",
            Self::WrongExtension => "WRONG_EXT",
            Self::CorruptFixable => "CORRUPT_IMG",
            Self::CorruptUnfixable => "CORRUPT_UNFIXABLE",
        }
    }

    pub fn delta(&self, penalties: &PenaltyConfig) -> f32 {
        match self {
            Self::WrongContentType => penalties.wrong_content_type,
            Self::WrongExtension => penalties.wrong_extension,
            Self::CorruptFixable => penalties.corrupt_fixable,
            Self::CorruptUnfixable => penalties.corrupt_unfixable,
        }
    }
}

/// Running internal penalty score plus the weighted occurrence total
/// across all images of a message.
#[derive(Debug, Default)]
pub struct ScoreAccumulator {
    pub penalties: f32,
    pub occurrences: f32,
    word_totals: BTreeMap<String, u32>,
}

impl ScoreAccumulator {
    pub fn add_penalty(&mut self, kind: PenaltyKind, penalties: &PenaltyConfig) -> f32 {
        let delta = kind.delta(penalties);
        self.penalties += delta;
        delta
    }

    /// Fold one image's best match report into the message totals.
    pub fn add_image_matches(&mut self, outcome: &MatchOutcome, scan: &ScanConfig) -> f32 {
        let weighted = weighted_count(outcome, scan);
        self.occurrences += weighted;
        for hit in &outcome.hits {
            *self.word_totals.entry(hit.word.clone()).or_insert(0) += hit.hits;
        }
        weighted
    }

    /// Human-readable summary of every matched word.
    pub fn describe(&self) -> String {
        if self.word_totals.is_empty() {
            return String::new();
        }
        let words: Vec<String> = self
            .word_totals
            .iter()
            .map(|(word, hits)| format!("\"{word}\" ({hits})"))
            .collect();
        format!("words found: {}", words.join(", "))
    }
}

/// Match count weighted by the winning pass.
pub fn weighted_count(outcome: &MatchOutcome, scan: &ScanConfig) -> f32 {
    let factor = match outcome.pass {
        MatchPass::Verbatim => 1.0,
        MatchPass::Despaced => scan.despaced_factor,
    };
    outcome.count as f32 * factor
}

/// Final score for a message from its weighted occurrence total.
pub fn final_score(occurrences: f32, scan: &ScanConfig) -> f32 {
    if occurrences >= scan.required_count as f32 {
        scan.base_score + (occurrences - scan.required_count as f32) * scan.add_score
    } else if scan.score_ham {
        scan.add_score * occurrences
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::WordHit;

    fn scan() -> ScanConfig {
        ScanConfig {
            required_count: 2,
            base_score: 4.0,
            add_score: 1.0,
            despaced_factor: 0.5,
            score_ham: false,
            ..ScanConfig::default()
        }
    }

    fn outcome(pass: MatchPass, count: u32) -> MatchOutcome {
        MatchOutcome {
            pass,
            count,
            hits: vec![WordHit {
                word: "viagra".to_string(),
                hits: count,
            }],
        }
    }

    #[test]
    fn meeting_required_count_scores_base_plus_extra() {
        assert_eq!(final_score(2.0, &scan()), 4.0);
        assert_eq!(final_score(5.0, &scan()), 7.0);
    }

    #[test]
    fn below_required_count_scores_zero_without_ham_scoring() {
        assert_eq!(final_score(1.0, &scan()), 0.0);
        assert_eq!(final_score(0.0, &scan()), 0.0);
    }

    #[test]
    fn ham_scoring_grades_sub_threshold_matches() {
        let mut cfg = scan();
        cfg.score_ham = true;
        assert_eq!(final_score(1.0, &cfg), 1.0);
        assert_eq!(final_score(0.0, &cfg), 0.0);
    }

    #[test]
    fn despaced_wins_are_down_weighted() {
        let cfg = scan();
        assert_eq!(weighted_count(&outcome(MatchPass::Verbatim, 3), &cfg), 3.0);
        assert_eq!(weighted_count(&outcome(MatchPass::Despaced, 3), &cfg), 1.5);
    }

    #[test]
    fn accumulator_merges_word_totals_across_images() {
        let cfg = scan();
        let mut acc = ScoreAccumulator::default();
        acc.add_image_matches(&outcome(MatchPass::Verbatim, 2), &cfg);
        acc.add_image_matches(&outcome(MatchPass::Verbatim, 1), &cfg);
        assert_eq!(acc.occurrences, 3.0);
        assert_eq!(acc.describe(), "words found: \"viagra\" (3)");
    }

    #[test]
    fn penalties_accumulate_configured_deltas() {
        let penalties = PenaltyConfig::default();
        let mut acc = ScoreAccumulator::default();
        acc.add_penalty(PenaltyKind::WrongContentType, &penalties);
        acc.add_penalty(PenaltyKind::CorruptFixable, &penalties);
        assert_eq!(acc.penalties, 4.0);
    }
}
