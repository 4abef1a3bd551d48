use crate::catalog::{Catalog, CatalogError};
use crate::config::{GenerationSettings, OutputSettings, SynthesisSettings};
use crate::corpus::{Corpus, CorpusEntryMetadata, CorpusError};
use crate::emitter::{EmitError, Emitted, Emitter};
use crate::feedback::{FeedbackSet, TripleCoverageFeedback, UniqueSequenceFeedback};
use crate::scheduler::BatchUsage;
use crate::sequence::Sequence;
use crate::synthesizer::{SynthesisError, SynthesisRequest, Synthesizer};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Emission failed: {0}")]
    Emit(#[from] EmitError),

    #[error("Corpus error: {0}")]
    Corpus(#[from] CorpusError),

    #[error("Failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("A synthesis worker panicked")]
    WorkerPanicked,
}

/// One accepted sequence and its rendering.
#[derive(Debug, Clone)]
pub struct Generated {
    pub sequence: Sequence,
    pub emitted: Emitted,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub accepted: Vec<Generated>,
    /// Requested sequences that could not be produced.
    pub shortfall: usize,
    /// Slots whose every attempt ended in a dead end.
    pub dead_ends: usize,
    /// Synthesized sequences rejected by feedback.
    pub rejected: usize,
}

/// Seed of attempt `attempt` of slot `slot`; a function of its inputs only.
pub fn slot_seed(seed: u64, slot: usize, attempt: usize) -> u64 {
    let mut z = seed
        ^ (slot as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (attempt as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Generates a batch of sequences for one catalog.
///
/// Slots are synthesized independently by `threads` workers and then
/// accepted in slot order, so the result does not depend on the thread count.
pub struct Batch<'c> {
    catalog: &'c Catalog,
    synthesis: SynthesisSettings,
    generation: GenerationSettings,
}

impl<'c> Batch<'c> {
    pub fn new(
        catalog: &'c Catalog,
        synthesis: SynthesisSettings,
        generation: GenerationSettings,
    ) -> Self {
        Self {
            catalog,
            synthesis,
            generation,
        }
    }

    /// Runs the batch, appending every accepted sequence to `corpus`.
    ///
    /// # Arguments
    /// * `corpus`: Store receiving accepted sequences in id order.
    ///
    /// # Returns
    /// The accepted sequences and shortfall counts. An unknown API in the
    /// catalog or a failing corpus aborts the whole batch.
    pub fn run(&self, corpus: &mut dyn Corpus) -> Result<BatchOutcome, BatchError> {
        let count = self.generation.count;
        let emitter = Emitter::new(self.catalog);
        let mut feedback = FeedbackSet::new().with(Box::new(UniqueSequenceFeedback::new()));
        if self.generation.minimize {
            feedback = feedback.with(Box::new(TripleCoverageFeedback::new()));
        }

        let mut accepted: Vec<Generated> = Vec::with_capacity(count);
        let mut usage = BatchUsage::new();
        let mut dead_ends = 0;
        let mut rejected = 0;
        let mut slots = 0..count;
        let mut refills = 0;
        loop {
            let results = self.synthesize_slots(slots.clone(), &usage)?;
            let mut rejected_this_round = 0;
            for (slot, result) in results {
                let Some(mut sequence) = result else {
                    dead_ends += 1;
                    continue;
                };
                if accepted.len() >= count {
                    break;
                }
                if let Some(by) = feedback.rejected_by(&sequence) {
                    debug!(slot, feedback = by, "Sequence rejected");
                    rejected_this_round += 1;
                    continue;
                }
                feedback.accept(&sequence);
                usage.record(&sequence.calls);
                sequence.id = self.generation.first_id + accepted.len() as u64;
                let emitted = emitter.emit(&sequence)?;
                corpus.add(
                    sequence.clone(),
                    CorpusEntryMetadata {
                        sequence_id: sequence.id,
                        library: sequence.library.clone(),
                        digest: emitted.metadata.digest.clone(),
                        score: emitted.metadata.score,
                    },
                )?;
                accepted.push(Generated { sequence, emitted });
            }
            rejected += rejected_this_round;

            let missing = count.saturating_sub(accepted.len());
            if missing == 0 || rejected_this_round == 0 || refills >= self.generation.retries {
                break;
            }
            refills += 1;
            debug!(refills, missing, "Refilling rejected slots");
            slots = slots.end..slots.end + missing;
        }

        let shortfall = count.saturating_sub(accepted.len());
        info!(
            library = %self.catalog.library,
            requested = count,
            accepted = accepted.len(),
            dead_ends,
            rejected,
            "Batch finished"
        );
        if shortfall > 0 {
            warn!(
                library = %self.catalog.library,
                shortfall,
                "Batch produced fewer sequences than requested"
            );
        }
        Ok(BatchOutcome {
            accepted,
            shortfall,
            dead_ends,
            rejected,
        })
    }

    /// Synthesizes every slot in `slots`, sorted by slot. `None` marks a slot
    /// whose attempts all ended in a dead end.
    fn synthesize_slots(
        &self,
        slots: Range<usize>,
        usage: &BatchUsage,
    ) -> Result<Vec<(usize, Option<Sequence>)>, BatchError> {
        let next = AtomicUsize::new(slots.start);
        let end = slots.end;
        let threads = self.generation.threads.max(1).min(slots.len().max(1));

        let mut results = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| -> Result<Vec<(usize, Option<Sequence>)>, BatchError> {
                        let mut synthesizer = Synthesizer::new(self.catalog, self.synthesis.clone())
                            .with_usage(usage.clone());
                        let mut done = Vec::new();
                        loop {
                            let slot = next.fetch_add(1, Ordering::Relaxed);
                            if slot >= end {
                                break;
                            }
                            done.push((slot, self.synthesize_slot(&mut synthesizer, slot)?));
                        }
                        Ok(done)
                    })
                })
                .collect();

            let mut all = Vec::with_capacity(slots.len());
            for worker in workers {
                match worker.join() {
                    Ok(done) => all.extend(done?),
                    Err(_) => return Err(BatchError::WorkerPanicked),
                }
            }
            Ok(all)
        })?;
        results.sort_by_key(|(slot, _)| *slot);
        Ok(results)
    }

    fn synthesize_slot(
        &self,
        synthesizer: &mut Synthesizer<'_>,
        slot: usize,
    ) -> Result<Option<Sequence>, BatchError> {
        let (min_len, max_len) = (self.synthesis.min_len, self.synthesis.max_len);
        for attempt in 0..=self.generation.retries {
            let seed = slot_seed(self.generation.seed, slot, attempt);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let target_len = rng.random_range(min_len..=max_len.max(min_len));
            let leak = rng.random::<f64>() < self.synthesis.leak_rate;
            let request = SynthesisRequest {
                id: slot as u64,
                seed,
                target_len,
                leak,
            };
            match synthesizer.synthesize(&request, &mut rng) {
                Ok(sequence) => return Ok(Some(sequence)),
                Err(SynthesisError::DeadEnd {
                    steps,
                    backtracks,
                    reason,
                }) => {
                    debug!(slot, attempt, steps, backtracks, %reason, "Dead end, retrying");
                }
                Err(SynthesisError::Catalog(e)) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

/// Writes `<id>.c`, `<id>.meta.json` and `<id>.json` for every accepted sequence.
///
/// # Returns
/// The paths of the emitted source files.
pub fn write_artifacts(
    outcome: &BatchOutcome,
    output: &OutputSettings,
) -> Result<Vec<PathBuf>, BatchError> {
    let dir = output.out_dir.as_path();
    fs::create_dir_all(dir).map_err(|source| BatchError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut sources = Vec::with_capacity(outcome.accepted.len());
    for generated in &outcome.accepted {
        let id = generated.sequence.id;
        let source_path = dir.join(format!("{}.c", id));
        write(&source_path, &generated.emitted.source)?;
        if output.write_metadata {
            let meta = serde_json::to_string_pretty(&generated.emitted.metadata)?;
            write(&dir.join(format!("{}.meta.json", id)), &meta)?;
        }
        if output.write_sequence {
            let json = generated.sequence.to_json()?;
            write(&dir.join(format!("{}.json", id)), &json)?;
        }
        sources.push(source_path);
    }
    debug!(dir = ?dir, files = sources.len(), "Artifacts written");
    Ok(sources)
}

fn write(path: &Path, contents: &str) -> Result<(), BatchError> {
    fs::write(path, contents).map_err(|source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_catalogs::TREE;
    use crate::config::CorpusType;
    use crate::corpus::{InMemoryCorpus, OnDiskCorpus};

    fn generation(count: usize, threads: usize) -> GenerationSettings {
        GenerationSettings {
            library: Some("tree".to_string()),
            count,
            seed: 42,
            threads,
            ..GenerationSettings::default()
        }
    }

    fn synthesis() -> SynthesisSettings {
        SynthesisSettings {
            min_len: 3,
            max_len: 6,
            ..SynthesisSettings::default()
        }
    }

    #[test]
    fn slot_seeds_differ_per_slot_and_attempt() {
        assert_eq!(slot_seed(42, 3, 1), slot_seed(42, 3, 1));
        assert_ne!(slot_seed(42, 3, 1), slot_seed(42, 3, 2));
        assert_ne!(slot_seed(42, 3, 1), slot_seed(42, 4, 1));
        assert_ne!(slot_seed(42, 3, 1), slot_seed(43, 3, 1));
    }

    #[test]
    fn output_does_not_depend_on_thread_count() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let single = Batch::new(&catalog, synthesis(), generation(6, 1))
            .run(&mut InMemoryCorpus::new())
            .unwrap();
        let parallel = Batch::new(&catalog, synthesis(), generation(6, 4))
            .run(&mut InMemoryCorpus::new())
            .unwrap();

        let sources = |o: &BatchOutcome| {
            o.accepted
                .iter()
                .map(|g| g.emitted.source.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(sources(&single), sources(&parallel));
        assert_eq!(single.shortfall, parallel.shortfall);
    }

    #[test]
    fn ids_are_consecutive_from_first_id_and_unique() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let mut settings = generation(5, 2);
        settings.first_id = 100;
        let mut corpus = InMemoryCorpus::new();
        let outcome = Batch::new(&catalog, synthesis(), settings)
            .run(&mut corpus)
            .unwrap();

        let ids: Vec<u64> = outcome.accepted.iter().map(|g| g.sequence.id).collect();
        let expected: Vec<u64> = (100..100 + outcome.accepted.len() as u64).collect();
        assert_eq!(ids, expected);
        assert_eq!(corpus.len(), outcome.accepted.len());
        assert_eq!(outcome.accepted.len() + outcome.shortfall, 5);

        let calls: Vec<_> = outcome.accepted.iter().map(|g| &g.sequence.calls).collect();
        for (i, a) in calls.iter().enumerate() {
            for b in &calls[i + 1..] {
                assert_ne!(a, b, "duplicates must be filtered");
            }
        }
    }

    #[test]
    fn artifacts_and_on_disk_corpus_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let output = OutputSettings {
            out_dir: dir.path().join("out"),
            corpus_type: CorpusType::OnDisk,
            ..OutputSettings::default()
        };
        let mut corpus = OnDiskCorpus::new(output.out_dir.join("corpus")).unwrap();
        let outcome = Batch::new(&catalog, synthesis(), generation(2, 1))
            .run(&mut corpus)
            .unwrap();
        let sources = write_artifacts(&outcome, &output).unwrap();

        assert_eq!(sources.len(), outcome.accepted.len());
        for generated in &outcome.accepted {
            let id = generated.sequence.id;
            let c = fs::read_to_string(output.out_dir.join(format!("{}.c", id))).unwrap();
            assert_eq!(c, generated.emitted.source);
            let json = fs::read_to_string(output.out_dir.join(format!("{}.json", id))).unwrap();
            assert_eq!(Sequence::from_json(&json).unwrap(), generated.sequence);
            assert!(output.out_dir.join(format!("{}.meta.json", id)).exists());
        }
        assert_eq!(corpus.len(), outcome.accepted.len());
        assert!(output
            .out_dir
            .join("corpus")
            .join(OnDiskCorpus::INDEX_FILENAME)
            .exists());
    }

    #[test]
    fn impossible_budgets_are_a_shortfall() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let tight = SynthesisSettings {
            min_len: 5,
            max_len: 5,
            max_steps: 0,
            ..SynthesisSettings::default()
        };
        let mut settings = generation(3, 2);
        settings.retries = 1;
        let outcome = Batch::new(&catalog, tight, settings)
            .run(&mut InMemoryCorpus::new())
            .unwrap();
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.shortfall, 3);
        assert_eq!(outcome.dead_ends, 3);
    }
}
