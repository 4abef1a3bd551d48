use crate::catalog::{
    ApiSpec, Catalog, CatalogError, FREED, OwnershipMode, ParamRole, ReturnSemantics,
};
use crate::config::SynthesisSettings;
use crate::enforcer::Enforcer;
use crate::literal::{ArgContext, DefaultLiterals, LiteralSource};
use crate::scheduler::{BatchUsage, Candidate, CandidateScheduler};
use crate::sequence::{Binding, CallSite, ResourceId, Sequence, Termination};
use crate::tracker::{Snapshot, Tracker};
use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;
use thiserror::Error;
use tracing::debug;

/// Intermediate transitions walked at most before a destructor becomes applicable.
const MAX_CLEANUP_DEPTH: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    /// No valid sequence was found within the budgets.
    #[error("Dead end after {steps} steps and {backtracks} backtracks: {reason}")]
    DeadEnd {
        steps: usize,
        backtracks: usize,
        reason: String,
    },

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisPhase {
    Start,
    Extending,
    Committed,
    DeadEnd,
}

/// What to synthesize.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub id: u64,
    pub seed: u64,
    /// Number of calls appended before cleanup starts.
    pub target_len: usize,
    /// Leave resources alive and mark the sequence as leaked.
    pub leak: bool,
}

struct Frame {
    snapshot: Snapshot,
    ranked: Vec<Candidate>,
    next: usize,
}

#[derive(Debug, Default)]
struct Budget {
    steps: usize,
    backtracks: usize,
}

/// Builds resource-safe call sequences for one catalog.
pub struct Synthesizer<'c> {
    catalog: &'c Catalog,
    enforcer: Enforcer<'c>,
    settings: SynthesisSettings,
    scheduler: Box<dyn CandidateScheduler>,
    usage: BatchUsage,
    literals: DefaultLiterals,
    phase: SynthesisPhase,
}

impl<'c> Synthesizer<'c> {
    pub fn new(catalog: &'c Catalog, settings: SynthesisSettings) -> Self {
        let scheduler = settings.scheduler.build();
        Self {
            catalog,
            enforcer: Enforcer::new(catalog),
            settings,
            scheduler,
            usage: BatchUsage::new(),
            literals: DefaultLiterals::new(),
            phase: SynthesisPhase::Start,
        }
    }

    /// Weighs candidates against what the rest of the batch already called.
    pub fn with_usage(mut self, usage: BatchUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn phase(&self) -> SynthesisPhase {
        self.phase
    }

    /// Produces one sequence, or `DeadEnd` once a budget is exhausted.
    pub fn synthesize<R: RngCore>(
        &mut self,
        request: &SynthesisRequest,
        rng: &mut R,
    ) -> Result<Sequence, SynthesisError> {
        self.phase = SynthesisPhase::Start;
        let result = self.run(request, rng);
        self.phase = match result {
            Ok(_) => SynthesisPhase::Committed,
            Err(_) => SynthesisPhase::DeadEnd,
        };
        result
    }

    fn run<R: RngCore>(
        &mut self,
        request: &SynthesisRequest,
        rng: &mut R,
    ) -> Result<Sequence, SynthesisError> {
        let catalog = self.catalog;
        let mut tracker = Tracker::new(catalog);
        let mut budget = Budget::default();
        let dead_end = |budget: &Budget, reason: String| SynthesisError::DeadEnd {
            steps: budget.steps,
            backtracks: budget.backtracks,
            reason,
        };

        for class in catalog.required_globals() {
            if !self.open_global(&mut tracker, &class, rng) {
                return Err(dead_end(&budget, format!("cannot open global `{}`", class)));
            }
        }
        let prefix = tracker.state().call_log().len();

        self.phase = SynthesisPhase::Extending;
        let mut frames: Vec<Frame> = Vec::new();
        loop {
            let extended = tracker.state().call_log().len() - prefix;
            if extended >= request.target_len {
                let before = tracker.snapshot();
                let cleanup_start = tracker.state().call_log().len();
                if request.leak || self.cleanup(&mut tracker, rng) {
                    debug!(
                        id = request.id,
                        calls = tracker.state().call_log().len(),
                        steps = budget.steps,
                        backtracks = budget.backtracks,
                        "sequence committed"
                    );
                    return Ok(Sequence {
                        id: request.id,
                        library: catalog.library.clone(),
                        seed: request.seed,
                        calls: tracker.state().call_log().to_vec(),
                        resources: tracker.declarations(),
                        cleanup_start,
                        termination: if request.leak {
                            Termination::Leaked
                        } else {
                            Termination::Cleaned
                        },
                    });
                }
                debug!(id = request.id, "cleanup failed, rejecting last step");
                tracker.restore(before);
            } else {
                let candidates = self.candidates(&tracker);
                let ranked = self.scheduler.rank(
                    catalog,
                    &candidates,
                    tracker.state().call_log(),
                    &self.usage,
                    &mut *rng,
                );
                frames.push(Frame {
                    snapshot: tracker.snapshot(),
                    ranked,
                    next: 0,
                });
            }

            loop {
                let Some(frame) = frames.last_mut() else {
                    return Err(dead_end(&budget, "no candidate left at the root".to_string()));
                };
                if frame.next >= frame.ranked.len() {
                    frames.pop();
                    budget.backtracks += 1;
                    debug!(id = request.id, depth = frames.len(), "backtrack");
                    if budget.backtracks > self.settings.max_backtracks {
                        return Err(dead_end(&budget, "backtrack budget exhausted".to_string()));
                    }
                    continue;
                }
                let candidate = frame.ranked[frame.next].api;
                frame.next += 1;
                tracker.restore(frame.snapshot.clone());

                budget.steps += 1;
                if budget.steps > self.settings.max_steps {
                    return Err(dead_end(&budget, "step budget exhausted".to_string()));
                }
                let api = &catalog.apis()[candidate];
                if self.attempt(&mut tracker, api, None, rng) {
                    debug!(id = request.id, step = budget.steps, api = %api.name, "step committed");
                    break;
                }
            }
        }
    }

    /// Indices of APIs that may extend the sequence in its current state.
    fn candidates(&self, tracker: &Tracker<'_>) -> Vec<usize> {
        let open = tracker
            .live_resources()
            .iter()
            .filter(|r| !r.global && r.effective_ownership() != OwnershipMode::Borrowed)
            .count();
        self.catalog
            .apis()
            .iter()
            .enumerate()
            .filter(|(_, api)| !self.catalog.banned.contains(&api.name))
            .filter(|(_, api)| !self.touches_global_lifecycle(api))
            .filter(|(_, api)| self.within_class_mix(api))
            .filter(|(_, api)| !self.opens_owned_resource(api) || open < self.settings.max_open_resources)
            .filter(|(_, api)| self.satisfiable(tracker, api))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn touches_global_lifecycle(&self, api: &ApiSpec) -> bool {
        let global = |class: &str| {
            self.catalog
                .lookup_class(class)
                .map(|c| c.global)
                .unwrap_or(false)
        };
        api.produced_classes().into_iter().any(global)
            || api
                .parameters
                .iter()
                .any(|p| p.frees() && p.role.class().is_some_and(global))
    }

    fn within_class_mix(&self, api: &ApiSpec) -> bool {
        if self.settings.classes.is_empty() {
            return true;
        }
        let explicit = api
            .parameters
            .iter()
            .filter(|p| !p.implicit)
            .filter_map(|p| p.role.class());
        api.produced_classes()
            .into_iter()
            .chain(explicit)
            .all(|c| self.settings.classes.iter().any(|m| m == c))
    }

    fn opens_owned_resource(&self, api: &ApiSpec) -> bool {
        let owned = api.parameters.iter().any(|p| {
            matches!(&p.role, ParamRole::ResourceOut(c)
                if self.catalog.lookup_class(c).is_ok_and(|c| c.ownership != OwnershipMode::Borrowed))
        });
        owned
            || matches!(&api.returns, ReturnSemantics::NewResource { class, owner_param: None, .. }
                if self.catalog.lookup_class(class).is_ok_and(|c| c.ownership != OwnershipMode::Borrowed))
    }

    fn satisfiable(&self, tracker: &Tracker<'_>, api: &ApiSpec) -> bool {
        api.parameters.iter().enumerate().all(|(idx, p)| {
            if !p.role.is_consuming() {
                return true;
            }
            if p.implicit {
                return p
                    .role
                    .class()
                    .is_some_and(|c| tracker.state().live_global(c).is_some());
            }
            (p.nullable && self.settings.negative_rate > 0.0)
                || !self.eligible(tracker, api, idx, &[]).is_empty()
        })
    }

    /// Live resources that may be bound to consuming parameter `idx` of `api`.
    fn eligible(
        &self,
        tracker: &Tracker<'_>,
        api: &ApiSpec,
        idx: usize,
        already_bound: &[ResourceId],
    ) -> Vec<ResourceId> {
        let param = &api.parameters[idx];
        let Some(class) = param.role.class() else {
            return Vec::new();
        };
        tracker
            .live_resources()
            .into_iter()
            .filter(|r| r.class == class && param.accepts_state(&r.state))
            .filter(|r| !already_bound.contains(&r.id))
            .filter(|r| {
                !param.frees()
                    || (r.effective_ownership() != OwnershipMode::Borrowed
                        && !tracker.has_live_dependents(r.id))
            })
            .filter(|r| param.adopt_into.is_none() || r.owner.is_none())
            .map(|r| r.id)
            .collect()
    }

    /// Binds every argument of `api`; `pinned` forces one resource parameter.
    fn bind<R: RngCore>(
        &mut self,
        tracker: &Tracker<'_>,
        api: &ApiSpec,
        pinned: Option<(usize, ResourceId)>,
        rng: &mut R,
    ) -> Option<CallSite> {
        let mut ctx = ArgContext::new(tracker.next_slot());
        let mut call = CallSite::new(api.name.clone());
        let fresh = tracker.fresh_ids(api.produced_classes().len());
        let mut fresh_iter = fresh.iter().copied();
        let mut bound: Vec<ResourceId> = Vec::new();
        let negative_rate = self.settings.negative_rate;

        for (idx, param) in api.parameters.iter().enumerate() {
            let binding = match &param.role {
                ParamRole::ValueIn => self.literals.value_in(param, &mut ctx, rng),
                ParamRole::ValueOut => self.literals.value_out(param, &mut ctx, rng),
                ParamRole::ResourceOut(_) => Binding::Resource {
                    id: fresh_iter.next()?,
                },
                ParamRole::ResourceIn(class) | ParamRole::ResourceInOut(class) => {
                    if param.implicit {
                        Binding::Resource {
                            id: tracker.state().live_global(class)?,
                        }
                    } else if let Some((_, id)) = pinned.filter(|(p, _)| *p == idx) {
                        Binding::Resource { id }
                    } else if param.nullable && negative_rate > 0.0 && rng.random_bool(negative_rate)
                    {
                        call.negative = true;
                        let stale: Vec<ResourceId> = tracker
                            .state()
                            .resources()
                            .filter(|r| r.is_freed() && r.class == *class)
                            .map(|r| r.id)
                            .collect();
                        match stale.choose(rng) {
                            Some(&id) => Binding::Stale { id },
                            None => Binding::Null,
                        }
                    } else {
                        let mut exclude = bound.clone();
                        if let Some((_, id)) = pinned {
                            exclude.push(id);
                        }
                        let choices = self.eligible(tracker, api, idx, &exclude);
                        Binding::Resource {
                            id: *choices.choose(rng)?,
                        }
                    }
                }
            };
            if let Some(id) = binding.resource() {
                bound.push(id);
            }
            call.bindings.push(binding);
        }

        call.produces = fresh;
        if api.returns.captured_type().is_some() {
            call.capture = Some(ctx.alloc_slot());
        }
        Some(call)
    }

    /// Binds, checks and commits one call. Leaves `tracker` dirty on failure.
    fn attempt<R: RngCore>(
        &mut self,
        tracker: &mut Tracker<'_>,
        api: &ApiSpec,
        pinned: Option<(usize, ResourceId)>,
        rng: &mut R,
    ) -> bool {
        let Some(call) = self.bind(tracker, api, pinned, rng) else {
            return false;
        };
        if let Err(violation) = self.enforcer.check(&call, tracker.state()) {
            debug!(api = %api.name, %violation, "candidate rejected");
            return false;
        }
        let errors = tracker.apply(api, &call);
        if let Some(error) = errors.first() {
            debug!(api = %api.name, %error, "candidate rejected by tracker");
            return false;
        }
        true
    }

    fn open_global<R: RngCore>(&mut self, tracker: &mut Tracker<'_>, class: &str, rng: &mut R) -> bool {
        let catalog = self.catalog;
        for api in catalog.apis_producing(class) {
            if catalog.banned.contains(&api.name) {
                continue;
            }
            let snapshot = tracker.snapshot();
            if self.attempt(tracker, api, None, rng) {
                return true;
            }
            tracker.restore(snapshot);
        }
        false
    }

    /// Drives every owned resource to `Freed`: newest first, globals last.
    fn cleanup<R: RngCore>(&mut self, tracker: &mut Tracker<'_>, rng: &mut R) -> bool {
        let mut guard = self.settings.max_steps;
        loop {
            let mut pending: Vec<(bool, usize, ResourceId)> = tracker
                .leaked()
                .iter()
                .map(|r| (r.global, r.created_at, r.id))
                .collect();
            pending.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(b.2.cmp(&a.2)));
            let Some(&(_, _, target)) = pending.first() else {
                return true;
            };
            if guard == 0 || !self.drive_to_freed(tracker, target, MAX_CLEANUP_DEPTH, rng) {
                debug!(resource = %target, "no cleanup path");
                return false;
            }
            guard -= 1;
        }
    }

    fn drive_to_freed<R: RngCore>(
        &mut self,
        tracker: &mut Tracker<'_>,
        target: ResourceId,
        depth: usize,
        rng: &mut R,
    ) -> bool {
        let catalog = self.catalog;
        let Some(record) = tracker.state().resource(target) else {
            return false;
        };
        let state = record.state.clone();
        let Ok(class) = catalog.lookup_class(&record.class) else {
            return false;
        };

        for (api, idx) in catalog.destructors(&class.name, &state) {
            let snapshot = tracker.snapshot();
            if self.attempt(tracker, api, Some((idx, target)), rng) {
                return true;
            }
            tracker.restore(snapshot);
        }
        if depth == 0 {
            return false;
        }

        for edge in class.edges_from(&state) {
            if edge.to == state || edge.to == FREED {
                continue;
            }
            let Ok(api) = catalog.lookup_api(&edge.api) else {
                continue;
            };
            let Some(idx) = api.parameters.iter().position(|p| {
                p.role.is_consuming()
                    && p.role.class() == Some(class.name.as_str())
                    && p.accepts_state(&state)
                    && p.becomes.as_deref() == Some(edge.to.as_str())
            }) else {
                continue;
            };
            let snapshot = tracker.snapshot();
            if self.attempt(tracker, api, Some((idx, target)), rng)
                && self.drive_to_freed(tracker, target, depth - 1, rng)
            {
                return true;
            }
            tracker.restore(snapshot);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_catalogs::{TREE, WIDGET};
    use crate::enforcer::{LintOptions, lint_calls};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn request(target_len: usize) -> SynthesisRequest {
        SynthesisRequest {
            id: 0,
            seed: 42,
            target_len,
            leak: false,
        }
    }

    fn api_names(seq: &Sequence) -> Vec<&str> {
        seq.calls.iter().map(|c| c.api.as_str()).collect()
    }

    #[test]
    fn widget_of_length_two_is_create_then_free() {
        let catalog = Catalog::load_from_str(WIDGET).unwrap();
        for seed in 0..16u8 {
            let mut synth = Synthesizer::new(&catalog, SynthesisSettings::default());
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            let seq = synth.synthesize(&request(2), &mut rng).unwrap();
            assert_eq!(api_names(&seq), vec!["widget_create", "widget_free"], "seed {}", seed);
            assert_eq!(seq.termination, Termination::Cleaned);
            assert_eq!(synth.phase(), SynthesisPhase::Committed);
        }
    }

    #[test]
    fn adopted_children_are_never_freed_explicitly() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        for seed in 0..32u8 {
            let mut synth = Synthesizer::new(&catalog, SynthesisSettings::default());
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            let seq = synth.synthesize(&request(8), &mut rng).unwrap();

            let violations =
                lint_calls(&catalog, &seq.calls, LintOptions { no_leak: true }).unwrap();
            assert!(violations.is_empty(), "seed {}: {:?}", seed, violations);

            let adopted: Vec<ResourceId> = seq
                .calls
                .iter()
                .filter(|c| c.api == "node_add_child")
                .filter_map(|c| c.bindings[1].resource())
                .collect();
            for call in seq.calls.iter().filter(|c| c.api == "node_delete") {
                let freed = call.bindings[0].resource().unwrap();
                assert!(
                    !adopted.contains(&freed),
                    "seed {}: adopted child {} freed explicitly",
                    seed,
                    freed
                );
            }
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let catalog = crate::catalog::builtin("cJSON").unwrap();
        let run = || {
            let mut synth = Synthesizer::new(&catalog, SynthesisSettings::default());
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            synth.synthesize(&request(10), &mut rng).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn leak_requests_skip_cleanup() {
        let catalog = Catalog::load_from_str(WIDGET).unwrap();
        let mut synth = Synthesizer::new(&catalog, SynthesisSettings::default());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let seq = synth
            .synthesize(
                &SynthesisRequest {
                    leak: true,
                    ..request(1)
                },
                &mut rng,
            )
            .unwrap();
        assert_eq!(api_names(&seq), vec!["widget_create"]);
        assert_eq!(seq.termination, Termination::Leaked);
        assert_eq!(seq.cleanup_start, 1);
    }

    #[test]
    fn exhausted_budget_is_a_dead_end() {
        let catalog = Catalog::load_from_str(WIDGET).unwrap();
        let settings = SynthesisSettings {
            max_steps: 3,
            ..SynthesisSettings::default()
        };
        let mut synth = Synthesizer::new(&catalog, settings);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        match synth.synthesize(&request(50), &mut rng) {
            Err(SynthesisError::DeadEnd { steps, .. }) => assert!(steps <= 4),
            other => panic!("expected a dead end, got {:?}", other),
        }
        assert_eq!(synth.phase(), SynthesisPhase::DeadEnd);
    }

    #[test]
    fn open_resource_budget_caps_live_handles() {
        let catalog = Catalog::load_from_str(WIDGET).unwrap();
        let settings = SynthesisSettings {
            max_open_resources: 1,
            ..SynthesisSettings::default()
        };
        let mut synth = Synthesizer::new(&catalog, settings);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let seq = synth.synthesize(&request(6), &mut rng).unwrap();
        assert_eq!(
            api_names(&seq),
            vec![
                "widget_create",
                "widget_free",
                "widget_create",
                "widget_free",
                "widget_create",
                "widget_free"
            ]
        );
    }

    #[test]
    fn globals_open_first_and_close_last() {
        let catalog = crate::catalog::builtin("sqlite3").unwrap();
        let mut committed = 0;
        for seed in 0..8 {
            let mut synth = Synthesizer::new(&catalog, SynthesisSettings::default());
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let Ok(seq) = synth.synthesize(&request(6), &mut rng) else {
                continue;
            };
            committed += 1;
            assert_eq!(seq.calls.first().unwrap().api, "sqlite3_initialize");
            assert_eq!(seq.calls.last().unwrap().api, "sqlite3_shutdown");
            let violations =
                lint_calls(&catalog, &seq.calls, LintOptions { no_leak: true }).unwrap();
            assert!(violations.is_empty(), "seed {}: {:?}", seed, violations);
        }
        assert!(committed > 0);
    }

    #[test]
    fn batch_usage_steers_the_first_call() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        for (busy, expected) in [("node_new", "blob_new"), ("blob_new", "node_new")] {
            let mut usage = BatchUsage::new();
            usage.record(&vec![CallSite::new(busy); 20]);
            for seed in 0..8 {
                let mut synth =
                    Synthesizer::new(&catalog, SynthesisSettings::default()).with_usage(usage.clone());
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let seq = synth.synthesize(&request(3), &mut rng).unwrap();
                assert_eq!(seq.calls[0].api, expected, "seed {}: {:?}", seed, api_names(&seq));
            }
        }
    }

    #[test]
    fn nulls_are_bound_only_in_marked_negative_calls() {
        let catalog = crate::catalog::builtin("zlib").unwrap();
        let mut checked = 0;
        for seed in 0..40 {
            let mut synth = Synthesizer::new(&catalog, SynthesisSettings::default());
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let Ok(seq) = synth.synthesize(&request(8), &mut rng) else {
                continue;
            };
            checked += 1;
            for call in &seq.calls {
                assert!(!call.negative, "seed {}: {:?}", seed, call);
                let api = catalog.lookup_api(&call.api).unwrap();
                for (param, binding) in api.parameters.iter().zip(&call.bindings) {
                    if param.role.class().is_some() {
                        assert!(
                            !matches!(binding, Binding::Null | Binding::Stale { .. }),
                            "seed {}: {} binds {:?}",
                            seed,
                            call.api,
                            binding
                        );
                    }
                }
            }
        }
        assert!(checked > 0);
    }

    #[test]
    fn negative_cases_stay_lint_clean() {
        let catalog = crate::catalog::builtin("zlib").unwrap();
        let settings = SynthesisSettings {
            negative_rate: 0.5,
            ..SynthesisSettings::default()
        };
        let mut negative = 0;
        for seed in 0..8 {
            let mut synth = Synthesizer::new(&catalog, settings.clone());
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let Ok(seq) = synth.synthesize(&request(10), &mut rng) else {
                continue;
            };
            negative += seq.calls.iter().filter(|c| c.negative).count();
            let violations = lint_calls(&catalog, &seq.calls, LintOptions { no_leak: true }).unwrap();
            assert!(violations.is_empty(), "seed {}: {:?}", seed, violations);
        }
        assert!(negative > 0);
    }
}
