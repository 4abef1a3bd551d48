pub mod batch;
pub mod catalog;
pub mod config;
pub mod corpus;
pub mod emitter;
pub mod enforcer;
pub mod feedback;
pub mod lint;
pub mod literal;
pub mod scheduler;
pub mod sequence;
pub mod synthesizer;
pub mod tracker;

pub use batch::{Batch, BatchError, BatchOutcome, Generated, write_artifacts};
pub use catalog::{ApiSpec, BUILTIN_LIBRARIES, Catalog, CatalogError, ResourceClass, builtin};
pub use config::{ApiseqConfig, CorpusType};
pub use corpus::{Corpus, CorpusEntryMetadata, CorpusError, InMemoryCorpus, OnDiskCorpus};
pub use emitter::{EmitError, Emitted, Emitter, SequenceMetadata};
pub use enforcer::{Enforcer, LintOptions, Violation, lint_calls};
pub use feedback::{Feedback, FeedbackSet, TripleCoverageFeedback, UniqueSequenceFeedback};
pub use lint::{LintError, LintReport, lint_file, lint_source};
pub use scheduler::{BatchUsage, CandidateScheduler, SchedulerKind};
pub use sequence::{Binding, CallSite, ResourceId, Sequence, Termination};
pub use synthesizer::{SynthesisError, SynthesisRequest, Synthesizer};
pub use tracker::{Tracker, TrackerError};
