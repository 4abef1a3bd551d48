use crate::catalog::{ApiSpec, Catalog};
use crate::sequence::CallSite;
use rand::seq::SliceRandom;
use rand_core::RngCore;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

/// Score bonus for an API not yet called in the sequence.
const UNUSED_API_BONUS: i64 = 100;
/// Score bonus for a logical operation none of whose variants was called yet.
const UNUSED_LOGICAL_BONUS: i64 = 40;
/// Score bonus per transition edge of the API not yet taken.
const UNUSED_EDGE_BONUS: i64 = 10;
/// Penalty for APIs that free a resource before the cleanup phase.
const MID_SEQUENCE_FREE_PENALTY: i64 = 30;

/// An API that may be appended next, with its priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub api: usize,
    pub score: i64,
}

/// Calls per API over the sequences a batch has accepted so far.
///
/// A batch hands every slot of a refill round the same table, so rankings
/// do not depend on which worker finishes first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchUsage {
    calls: BTreeMap<String, usize>,
}

impl BatchUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, calls: &[CallSite]) {
        for call in calls {
            *self.calls.entry(call.api.clone()).or_default() += 1;
        }
    }

    pub fn count(&self, api: &str) -> usize {
        self.calls.get(api).copied().unwrap_or(0)
    }
}

/// A `CandidateScheduler` orders the APIs that may extend a sequence.
///
/// Schedulers are stateless with respect to the sequence under
/// construction: everything they weigh is derived from the committed call
/// log, so backtracking never has to rewind them.
pub trait CandidateScheduler: Send + Sync {
    /// Ranks `candidates` best-first.
    ///
    /// # Arguments
    /// * `catalog`: The catalog the candidate indices point into.
    /// * `candidates`: Indices into `catalog.apis()` whose preconditions are satisfiable.
    /// * `call_log`: Calls committed so far.
    /// * `usage`: How often the rest of the batch already called each API.
    /// * `rng`: Random number generator for tie-breaking.
    fn rank(
        &self,
        catalog: &Catalog,
        candidates: &[usize],
        call_log: &[CallSite],
        usage: &BatchUsage,
        rng: &mut dyn RngCore,
    ) -> Vec<Candidate>;
}

/// Which scheduler the synthesizer uses.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    #[default]
    Novelty,
    Random,
}

impl SchedulerKind {
    pub fn build(self) -> Box<dyn CandidateScheduler> {
        match self {
            SchedulerKind::Novelty => Box::new(NoveltyScheduler::new()),
            SchedulerKind::Random => Box::new(RandomScheduler::new()),
        }
    }
}

/// Prefers APIs and transition edges the sequence has not exercised yet,
/// then APIs the batch has called least.
#[derive(Default, Debug)]
pub struct NoveltyScheduler;

impl NoveltyScheduler {
    pub fn new() -> Self {
        NoveltyScheduler
    }

    fn score(
        api: &ApiSpec,
        used_names: &HashSet<&str>,
        used_logical: &HashSet<&str>,
        used_edges: &HashSet<(String, String)>,
    ) -> i64 {
        let mut score = 0;
        if !used_names.contains(api.name.as_str()) {
            score += UNUSED_API_BONUS;
        }
        if !used_logical.contains(api.logical_name()) {
            score += UNUSED_LOGICAL_BONUS;
        }
        for p in &api.parameters {
            if let (Some(class), Some(to)) = (p.role.class(), p.becomes.as_deref()) {
                if !used_edges.contains(&(class.to_string(), to.to_string())) {
                    score += UNUSED_EDGE_BONUS;
                }
            }
        }
        if api.frees_any() {
            score -= MID_SEQUENCE_FREE_PENALTY;
        }
        score
    }
}

impl CandidateScheduler for NoveltyScheduler {
    fn rank(
        &self,
        catalog: &Catalog,
        candidates: &[usize],
        call_log: &[CallSite],
        usage: &BatchUsage,
        rng: &mut dyn RngCore,
    ) -> Vec<Candidate> {
        let mut used_names = HashSet::new();
        let mut used_logical = HashSet::new();
        let mut used_edges = HashSet::new();
        for call in call_log {
            let Ok(api) = catalog.lookup_api(&call.api) else {
                continue;
            };
            used_names.insert(api.name.as_str());
            used_logical.insert(api.logical_name());
            for p in &api.parameters {
                if let (Some(class), Some(to)) = (p.role.class(), p.becomes.as_deref()) {
                    used_edges.insert((class.to_string(), to.to_string()));
                }
            }
        }

        let apis = catalog.apis();
        let mut keyed: Vec<(Candidate, usize, u32)> = candidates
            .iter()
            .map(|&idx| {
                let api = &apis[idx];
                let score = Self::score(api, &used_names, &used_logical, &used_edges);
                let tie = rng.next_u32();
                (Candidate { api: idx, score }, usage.count(&api.name), tie)
            })
            .collect();
        keyed.sort_by(|(a, a_used, a_tie), (b, b_used, b_tie)| {
            b.score
                .cmp(&a.score)
                .then(a_used.cmp(b_used))
                .then(a_tie.cmp(b_tie))
                .then(a.api.cmp(&b.api))
        });
        keyed.into_iter().map(|(candidate, _, _)| candidate).collect()
    }
}

/// A baseline scheduler ordering candidates uniformly at random.
#[derive(Default, Debug)]
pub struct RandomScheduler;

impl RandomScheduler {
    /// Creates a new `RandomScheduler`.
    pub fn new() -> Self {
        RandomScheduler
    }
}

impl CandidateScheduler for RandomScheduler {
    fn rank(
        &self,
        _catalog: &Catalog,
        candidates: &[usize],
        _call_log: &[CallSite],
        _usage: &BatchUsage,
        rng: &mut dyn RngCore,
    ) -> Vec<Candidate> {
        let mut ranked: Vec<Candidate> = candidates
            .iter()
            .map(|&api| Candidate { api, score: 0 })
            .collect();
        ranked.shuffle(rng);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_catalogs::TREE;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn index_of(catalog: &Catalog, name: &str) -> usize {
        catalog
            .apis()
            .iter()
            .position(|a| a.name == name)
            .unwrap_or_else(|| panic!("api {} missing", name))
    }

    #[test]
    fn novelty_scheduler_prefers_unused_apis() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let scheduler = NoveltyScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        let size = index_of(&catalog, "node_size");
        let new = index_of(&catalog, "node_new");

        let log = vec![CallSite::new("node_new"), CallSite::new("node_new")];
        let ranked = scheduler.rank(&catalog, &[new, size], &log, &BatchUsage::new(), &mut rng);
        assert_eq!(
            ranked[0].api, size,
            "an API already called twice should rank below a fresh one: {:?}",
            ranked
        );
    }

    #[test]
    fn novelty_scheduler_defers_destructors() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let scheduler = NoveltyScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([10; 32]);
        let delete = index_of(&catalog, "node_delete");
        let size = index_of(&catalog, "node_size");

        let ranked = scheduler.rank(&catalog, &[delete, size], &[], &BatchUsage::new(), &mut rng);
        assert_eq!(ranked[0].api, size, "ranking: {:?}", ranked);
    }

    #[test]
    fn batch_usage_breaks_ties_toward_rarely_called_apis() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let scheduler = NoveltyScheduler::new();
        let node_new = index_of(&catalog, "node_new");
        let blob_new = index_of(&catalog, "blob_new");

        let mut usage = BatchUsage::new();
        usage.record(&vec![CallSite::new("node_new"); 5]);
        usage.record(&[CallSite::new("blob_new")]);
        assert_eq!(usage.count("node_new"), 5);

        for seed in 0..16u8 {
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            let ranked = scheduler.rank(&catalog, &[node_new, blob_new], &[], &usage, &mut rng);
            assert_eq!(ranked[0].api, blob_new, "seed {}: {:?}", seed, ranked);
        }

        // Novelty within the sequence still comes first.
        let log = vec![CallSite::new("blob_new")];
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let ranked = scheduler.rank(&catalog, &[node_new, blob_new], &log, &usage, &mut rng);
        assert_eq!(ranked[0].api, node_new, "{:?}", ranked);
    }

    #[test]
    fn random_scheduler_is_a_permutation() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let scheduler = RandomScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let all: Vec<usize> = (0..catalog.apis().len()).collect();

        let ranked = scheduler.rank(&catalog, &all, &[], &BatchUsage::new(), &mut rng);
        let mut seen: Vec<usize> = ranked.iter().map(|c| c.api).collect();
        seen.sort();
        assert_eq!(seen, all);
    }

    #[test]
    fn ranking_is_deterministic_for_a_seed() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let all: Vec<usize> = (0..catalog.apis().len()).collect();
        let scheduler = NoveltyScheduler::new();
        let usage = BatchUsage::new();
        let first = scheduler.rank(&catalog, &all, &[], &usage, &mut ChaCha8Rng::from_seed([2; 32]));
        let second = scheduler.rank(&catalog, &all, &[], &usage, &mut ChaCha8Rng::from_seed([2; 32]));
        assert_eq!(first, second);
    }
}
