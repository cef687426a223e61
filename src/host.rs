//! Host scoring API.
//!
//! The pipeline never fails upward: it only reads the message's current
//! score and pushes (rule, score, description) triples into the host's
//! scoring sink. The standalone implementation backs the CLI and tests.

/// One reported rule hit.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HostReport {
    pub rule: String,
    pub score: f32,
    pub description: String,
}

/// What the pipeline needs from the hosting scanner.
pub trait HostApi {
    /// Current cumulative score of the message.
    fn current_score(&self) -> f32;

    /// Deliver a scored rule hit.
    fn report(&mut self, rule: &str, score: f32, description: &str);

    /// Raw message bytes, for diagnostic capture.
    fn raw_message(&self) -> Option<&[u8]>;
}

/// Self-contained host used by the CLI: reported scores simply add up.
#[derive(Debug, Default)]
pub struct StandaloneHost {
    score: f32,
    raw: Vec<u8>,
    pub reports: Vec<HostReport>,
}

impl StandaloneHost {
    pub fn new(raw: Vec<u8>) -> Self {
        Self {
            score: 0.0,
            raw,
            reports: Vec::new(),
        }
    }

    /// Start from a pre-existing message score.
    pub fn with_score(raw: Vec<u8>, score: f32) -> Self {
        Self {
            score,
            raw,
            reports: Vec::new(),
        }
    }
}

impl HostApi for StandaloneHost {
    fn current_score(&self) -> f32 {
        self.score
    }

    fn report(&mut self, rule: &str, score: f32, description: &str) {
        self.score += score;
        self.reports.push(HostReport {
            rule: rule.to_string(),
            score,
            description: description.to_string(),
        });
    }

    fn raw_message(&self) -> Option<&[u8]> {
        Some(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_accumulate_into_the_score() {
        let mut host = StandaloneHost::with_score(Vec::new(), 1.0);
        host.report("OCRSIEVE", 3.0, "words found");
        host.report("OCRSIEVE_WRONG_CTYPE", 1.5, "");
        assert_eq!(host.current_score(), 5.5);
        assert_eq!(host.reports.len(), 2);
        assert_eq!(host.reports[0].rule, "OCRSIEVE");
    }
}
