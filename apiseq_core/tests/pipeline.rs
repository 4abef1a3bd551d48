use apiseq_core::config::{GenerationSettings, OutputSettings, SynthesisSettings};
use apiseq_core::enforcer::{LintOptions, Violation};
use apiseq_core::{
    BUILTIN_LIBRARIES, Batch, Catalog, Emitter, InMemoryCorpus, SynthesisError, SynthesisRequest,
    Synthesizer, Termination, builtin, lint_file, lint_source, write_artifacts,
};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

const WIDGET: &str = r#"
library = "widget"
headers = ["widget.h"]

[[class]]
name = "Widget"
c-type = "widget_t *"
states = ["Created"]

[[api]]
name = "widget_create"
returns = { kind = "new-resource", class = "Widget", state = "Created" }

[[api]]
name = "widget_free"
params = [{ role = "resource-in-out", class = "Widget", type = "widget_t *", becomes = "Freed" }]
"#;

fn request(seed: u64, target_len: usize) -> SynthesisRequest {
    SynthesisRequest {
        id: seed,
        seed,
        target_len,
        leak: false,
    }
}

fn generation(library: &str, count: usize) -> GenerationSettings {
    GenerationSettings {
        library: Some(library.to_string()),
        count,
        seed: 42,
        ..GenerationSettings::default()
    }
}

#[test]
fn same_seed_gives_identical_source_and_metadata() {
    for library in BUILTIN_LIBRARIES {
        let catalog = builtin(library).unwrap();
        let run = || {
            let batch = Batch::new(&catalog, SynthesisSettings::default(), generation(library, 3));
            let mut corpus = InMemoryCorpus::new();
            batch.run(&mut corpus).unwrap()
        };
        let (first, second) = (run(), run());
        assert_eq!(first.accepted.len(), second.accepted.len(), "{}", library);
        for (a, b) in first.accepted.iter().zip(&second.accepted) {
            assert_eq!(a.emitted.source, b.emitted.source, "{}", library);
            assert_eq!(a.emitted.metadata, b.emitted.metadata, "{}", library);
        }
    }
}

#[test]
fn emitted_source_lints_clean_for_every_builtin_library() {
    for library in BUILTIN_LIBRARIES {
        let catalog = builtin(library).unwrap();
        let emitter = Emitter::new(&catalog);
        for seed in 0..6 {
            let mut synth = Synthesizer::new(&catalog, SynthesisSettings::default());
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let sequence = match synth.synthesize(&request(seed, 8), &mut rng) {
                Ok(sequence) => sequence,
                Err(SynthesisError::DeadEnd { .. }) => continue,
                Err(e) => panic!("{}: {}", library, e),
            };
            let emitted = emitter.emit(&sequence).unwrap();
            let options = LintOptions {
                no_leak: sequence.termination == Termination::Cleaned,
            };
            let report = lint_source(&catalog, &emitted.source, options).unwrap();
            assert!(
                report.is_clean(),
                "{} seed {}: {:?}\n{}",
                library,
                seed,
                report.violations,
                emitted.source
            );
            assert_eq!(report.calls.len(), sequence.len(), "{} seed {}", library, seed);
        }
    }
}

#[test]
fn negative_and_leaked_sequences_round_trip() {
    let settings = SynthesisSettings {
        negative_rate: 0.4,
        ..SynthesisSettings::default()
    };
    for library in ["zlib", "cJSON"] {
        let catalog = builtin(library).unwrap();
        let emitter = Emitter::new(&catalog);
        for seed in 0..6 {
            let mut synth = Synthesizer::new(&catalog, settings.clone());
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let leak = seed % 2 == 1;
            let Ok(sequence) = synth.synthesize(&SynthesisRequest { leak, ..request(seed, 8) }, &mut rng)
            else {
                continue;
            };
            let emitted = emitter.emit(&sequence).unwrap();
            let report = lint_source(&catalog, &emitted.source, LintOptions::default()).unwrap();
            assert!(report.is_clean(), "{} seed {}: {:?}", library, seed, report.violations);

            if sequence.termination == Termination::Leaked {
                let strict =
                    lint_source(&catalog, &emitted.source, LintOptions { no_leak: true }).unwrap();
                assert!(
                    strict
                        .violations
                        .iter()
                        .all(|v| matches!(v, Violation::Leak { .. })),
                    "{} seed {}: {:?}",
                    library,
                    seed,
                    strict.violations
                );
            }
        }
    }
}

#[test]
fn freeing_a_second_create_is_required_in_no_leak_mode() {
    let catalog = Catalog::load_from_str(WIDGET).unwrap();
    let source = r#"
int test_widget_api_sequence() {
    widget_t *widget0 = NULL;
    widget_t *widget1 = NULL;
    widget0 = widget_create();
    widget1 = widget_create();
    widget_free(widget0);
    return 66;
}
"#;
    let lenient = lint_source(&catalog, source, LintOptions::default()).unwrap();
    assert!(lenient.is_clean());

    let strict = lint_source(&catalog, source, LintOptions { no_leak: true }).unwrap();
    assert_eq!(strict.violations.len(), 1, "{:?}", strict.violations);
    match &strict.violations[0] {
        Violation::Leak {
            class, created_at, ..
        } => {
            assert_eq!(class, "Widget");
            assert_eq!(*created_at, 1);
        }
        other => panic!("expected a leak, got {:?}", other),
    }
}

#[test]
fn double_free_is_reported_at_its_call() {
    let catalog = Catalog::load_from_str(WIDGET).unwrap();
    let source = r#"
int test_widget_api_sequence() {
    widget_t *widget0 = NULL;
    widget0 = widget_create();
    widget_free(widget0);
    widget_free(widget0);
    return 66;
}
"#;
    let report = lint_source(&catalog, source, LintOptions::default()).unwrap();
    assert!(!report.is_clean());
    assert!(
        report.violations.iter().all(|v| v.call_index() == Some(2)),
        "{:?}",
        report.violations
    );
    assert_eq!(report.line_of(&report.violations[0]), Some(6));
}

#[test]
fn exhausted_budgets_terminate_with_a_shortfall() {
    let catalog = builtin("cJSON").unwrap();
    let synthesis = SynthesisSettings {
        max_steps: 0,
        ..SynthesisSettings::default()
    };

    let mut synth = Synthesizer::new(&catalog, synthesis.clone());
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    assert!(matches!(
        synth.synthesize(&request(3, 6), &mut rng),
        Err(SynthesisError::DeadEnd { .. })
    ));

    let generation = GenerationSettings {
        retries: 1,
        ..generation("cJSON", 2)
    };
    let mut corpus = InMemoryCorpus::new();
    let outcome = Batch::new(&catalog, synthesis, generation)
        .run(&mut corpus)
        .unwrap();
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.shortfall, 2);
}

#[test]
fn written_artifacts_lint_clean_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = builtin("zlib").unwrap();
    let mut corpus = InMemoryCorpus::new();
    let outcome = Batch::new(&catalog, SynthesisSettings::default(), generation("zlib", 3))
        .run(&mut corpus)
        .unwrap();
    let output = OutputSettings {
        out_dir: dir.path().to_path_buf(),
        ..OutputSettings::default()
    };
    let sources = write_artifacts(&outcome, &output).unwrap();
    assert_eq!(sources.len(), outcome.accepted.len());

    for (path, generated) in sources.iter().zip(&outcome.accepted) {
        let options = LintOptions {
            no_leak: generated.sequence.termination == Termination::Cleaned,
        };
        let from_source = lint_file(&catalog, path, options).unwrap();
        assert!(from_source.is_clean(), "{:?}: {:?}", path, from_source.violations);

        let json = path.with_extension("json");
        let from_json = lint_file(&catalog, &json, options).unwrap();
        assert!(from_json.is_clean(), "{:?}: {:?}", json, from_json.violations);
        assert_eq!(from_json.calls, generated.sequence.calls);
    }
}
