use crate::corpus::bincode_config;
use crate::sequence::Sequence;
use std::collections::HashSet;

/// Decides whether a freshly synthesized sequence is worth keeping.
pub trait Feedback: Send {
    fn name(&self) -> &'static str;
    fn is_interesting(&self, sequence: &Sequence) -> bool;
    /// Records a sequence that was accepted into the batch.
    fn observe(&mut self, sequence: &Sequence);
}

/// Rejects sequences whose calls are identical to an accepted one.
///
/// Ids and seeds are ignored, so two slots that happen to synthesize the
/// same program count as duplicates.
#[derive(Default)]
pub struct UniqueSequenceFeedback {
    pub known_hashes: HashSet<[u8; 16]>,
}

impl UniqueSequenceFeedback {
    pub fn new() -> Self {
        Self {
            known_hashes: HashSet::new(),
        }
    }

    fn fingerprint(sequence: &Sequence) -> Option<[u8; 16]> {
        let bytes = bincode::encode_to_vec(&sequence.calls, bincode_config()).ok()?;
        Some(md5::compute(bytes).0)
    }
}

impl Feedback for UniqueSequenceFeedback {
    fn name(&self) -> &'static str {
        "UniqueSequenceFeedback"
    }

    fn is_interesting(&self, sequence: &Sequence) -> bool {
        match Self::fingerprint(sequence) {
            Some(hash) => !self.known_hashes.contains(&hash),
            None => true,
        }
    }

    fn observe(&mut self, sequence: &Sequence) {
        if let Some(hash) = Self::fingerprint(sequence) {
            self.known_hashes.insert(hash);
        }
    }
}

/// Keeps only sequences that contribute an unseen API or API 3-gram.
#[derive(Default)]
pub struct TripleCoverageFeedback {
    known_triples: HashSet<[String; 3]>,
    known_apis: HashSet<String>,
}

impl TripleCoverageFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triples_seen(&self) -> usize {
        self.known_triples.len()
    }
}

impl Feedback for TripleCoverageFeedback {
    fn name(&self) -> &'static str {
        "TripleCoverageFeedback"
    }

    fn is_interesting(&self, sequence: &Sequence) -> bool {
        sequence
            .calls
            .iter()
            .any(|c| !self.known_apis.contains(&c.api))
            || sequence
                .api_triples()
                .iter()
                .any(|t| !self.known_triples.contains(t))
    }

    fn observe(&mut self, sequence: &Sequence) {
        self.known_apis
            .extend(sequence.calls.iter().map(|c| c.api.clone()));
        self.known_triples.extend(sequence.api_triples());
    }
}

/// All feedbacks must agree before a sequence is accepted.
#[derive(Default)]
pub struct FeedbackSet {
    feedbacks: Vec<Box<dyn Feedback>>,
}

impl FeedbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, feedback: Box<dyn Feedback>) -> Self {
        self.feedbacks.push(feedback);
        self
    }

    /// Name of the first feedback rejecting `sequence`, if any.
    pub fn rejected_by(&self, sequence: &Sequence) -> Option<&'static str> {
        self.feedbacks
            .iter()
            .find(|f| !f.is_interesting(sequence))
            .map(|f| f.name())
    }

    /// Accepts `sequence` if every feedback finds it interesting.
    pub fn accept(&mut self, sequence: &Sequence) -> bool {
        if self.rejected_by(sequence).is_some() {
            return false;
        }
        for feedback in &mut self.feedbacks {
            feedback.observe(sequence);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{CallSite, Termination};

    fn seq(id: u64, apis: &[&str]) -> Sequence {
        Sequence {
            id,
            library: "widget".to_string(),
            seed: id,
            calls: apis.iter().map(|a| CallSite::new(*a)).collect(),
            resources: vec![],
            cleanup_start: apis.len(),
            termination: Termination::Cleaned,
        }
    }

    #[test]
    fn unique_sequence_feedback_ignores_ids() {
        let mut feedback = UniqueSequenceFeedback::new();
        let first = seq(0, &["a", "b"]);
        assert!(feedback.is_interesting(&first));
        feedback.observe(&first);
        assert!(
            !feedback.is_interesting(&seq(7, &["a", "b"])),
            "same calls under another id are a duplicate"
        );
        assert!(feedback.is_interesting(&seq(1, &["b", "a"])));
        assert_eq!(feedback.known_hashes.len(), 1);
    }

    #[test]
    fn triple_coverage_wants_new_apis_or_triples() {
        let mut feedback = TripleCoverageFeedback::new();
        feedback.observe(&seq(0, &["a", "b", "c"]));
        assert_eq!(feedback.triples_seen(), 1);
        assert!(!feedback.is_interesting(&seq(1, &["a", "b", "c"])));
        assert!(!feedback.is_interesting(&seq(2, &["a", "b"])));
        assert!(feedback.is_interesting(&seq(3, &["c", "b", "a"])));
        assert!(feedback.is_interesting(&seq(4, &["d"])));
    }

    #[test]
    fn feedback_set_requires_agreement() {
        let mut set = FeedbackSet::new()
            .with(Box::new(UniqueSequenceFeedback::new()))
            .with(Box::new(TripleCoverageFeedback::new()));
        assert!(set.accept(&seq(0, &["a", "b", "c"])));
        assert_eq!(
            set.rejected_by(&seq(1, &["a", "b", "c"])),
            Some("UniqueSequenceFeedback")
        );
        // New calls, but no new API or triple.
        assert_eq!(
            set.rejected_by(&seq(2, &["a", "b"])),
            Some("TripleCoverageFeedback")
        );
        assert!(!set.accept(&seq(2, &["a", "b"])));
        assert!(set.accept(&seq(3, &["b", "c", "a"])));
    }
}
