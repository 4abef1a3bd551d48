use crate::catalog::{ApiSpec, Catalog, CatalogError, OwnershipMode, ParamRole, ReturnSemantics};
use crate::sequence::{Binding, CallSite, ResourceId};
use crate::tracker::{SequenceState, Tracker, TrackerError};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// A broken resource-safety invariant, with enough context to locate it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Violation {
    #[error("call #{call} `{api}`: unknown API")]
    UnknownApi { call: usize, api: String },

    #[error("call #{call} `{api}` param {param}: {resource} used after it was freed")]
    UseAfterFree {
        call: usize,
        api: String,
        param: usize,
        resource: ResourceId,
    },

    #[error("call #{call} `{api}` param {param}: {resource} freed twice")]
    DoubleFree {
        call: usize,
        api: String,
        param: usize,
        resource: ResourceId,
    },

    #[error(
        "call #{call} `{api}` param {param}: {resource} is `{actual}`, expected one of {expected:?}"
    )]
    UnsatisfiedPrecondition {
        call: usize,
        api: String,
        param: usize,
        resource: ResourceId,
        expected: Vec<String>,
        actual: String,
    },

    #[error("call #{call} `{api}` param {param}: no live resource bound ({resource:?})")]
    DanglingParameter {
        call: usize,
        api: String,
        param: usize,
        resource: Option<ResourceId>,
    },

    #[error("call #{call} `{api}` param {param}: {resource} is owned by {owner:?}")]
    OwnershipConflict {
        call: usize,
        api: String,
        param: usize,
        resource: ResourceId,
        owner: Option<ResourceId>,
    },

    #[error("call #{call} `{api}` param {param}: {resource} cannot go from `{from}` to `{to}`")]
    IllegalTransition {
        call: usize,
        api: String,
        param: usize,
        resource: ResourceId,
        from: String,
        to: String,
    },

    #[error("call #{call} `{api}`: {actual} arguments bound, {expected} expected")]
    ArityMismatch {
        call: usize,
        api: String,
        expected: usize,
        actual: usize,
    },

    #[error("{resource} ({class}) created by call #{created_at} is still `{state}` at the end")]
    Leak {
        resource: ResourceId,
        class: String,
        state: String,
        created_at: usize,
    },
}

impl Violation {
    pub fn call_index(&self) -> Option<usize> {
        match self {
            Violation::UnknownApi { call, .. }
            | Violation::UseAfterFree { call, .. }
            | Violation::DoubleFree { call, .. }
            | Violation::UnsatisfiedPrecondition { call, .. }
            | Violation::DanglingParameter { call, .. }
            | Violation::OwnershipConflict { call, .. }
            | Violation::IllegalTransition { call, .. }
            | Violation::ArityMismatch { call, .. } => Some(*call),
            Violation::Leak { .. } => None,
        }
    }
}

/// Checks proposed calls against the current sequence state.
pub struct Enforcer<'c> {
    catalog: &'c Catalog,
}

impl<'c> Enforcer<'c> {
    pub fn new(catalog: &'c Catalog) -> Self {
        Self { catalog }
    }

    /// Returns the first violation `call` would cause if appended to `state`.
    pub fn check(&self, call: &CallSite, state: &SequenceState) -> Result<(), Violation> {
        let index = state.call_log().len();
        let api = match self.catalog.lookup_api(&call.api) {
            Ok(api) => api,
            Err(_) => {
                return Err(Violation::UnknownApi {
                    call: index,
                    api: call.api.clone(),
                });
            }
        };
        match self.inspect(index, api, call, state).into_iter().next() {
            Some(v) => Err(v),
            None => Ok(()),
        }
    }

    /// Every violation of `call`, at most one per parameter plus one for its return value.
    pub fn inspect(
        &self,
        index: usize,
        api: &ApiSpec,
        call: &CallSite,
        state: &SequenceState,
    ) -> Vec<Violation> {
        if call.bindings.len() != api.parameters.len() {
            return vec![Violation::ArityMismatch {
                call: index,
                api: api.name.clone(),
                expected: api.parameters.len(),
                actual: call.bindings.len(),
            }];
        }
        let mut found: Vec<Violation> = api
            .parameters
            .iter()
            .enumerate()
            .filter_map(|(idx, _)| self.check_param(index, api, idx, call, state))
            .collect();
        found.extend(self.check_returned(index, api, call, state));
        found
    }

    /// Checks the id a `new-resource` return value is registered under.
    fn check_returned(
        &self,
        index: usize,
        api: &ApiSpec,
        call: &CallSite,
        state: &SequenceState,
    ) -> Option<Violation> {
        let ReturnSemantics::NewResource { class, .. } = &api.returns else {
            return None;
        };
        let outs = api
            .parameters
            .iter()
            .filter(|p| matches!(p.role, ParamRole::ResourceOut(_)))
            .count();
        let id = *call.produces.get(outs)?;
        self.check_fresh(index, api, api.parameters.len(), id, class, state)
    }

    /// A produced id must be unused and a global class may have one live instance.
    fn check_fresh(
        &self,
        index: usize,
        api: &ApiSpec,
        param: usize,
        id: ResourceId,
        class_name: &str,
        state: &SequenceState,
    ) -> Option<Violation> {
        match state.resource(id) {
            Some(existing) if !existing.is_freed() => {
                return Some(Violation::OwnershipConflict {
                    call: index,
                    api: api.name.clone(),
                    param,
                    resource: id,
                    owner: existing.owner,
                });
            }
            Some(_) => {
                return Some(Violation::DanglingParameter {
                    call: index,
                    api: api.name.clone(),
                    param,
                    resource: Some(id),
                });
            }
            None => {}
        }
        let global = self
            .catalog
            .lookup_class(class_name)
            .map(|c| c.global)
            .unwrap_or(false);
        let existing = global.then(|| state.live_global(class_name)).flatten()?;
        Some(Violation::OwnershipConflict {
            call: index,
            api: api.name.clone(),
            param,
            resource: existing,
            owner: None,
        })
    }

    fn check_param(
        &self,
        index: usize,
        api: &ApiSpec,
        idx: usize,
        call: &CallSite,
        state: &SequenceState,
    ) -> Option<Violation> {
        let param = &api.parameters[idx];
        let binding = &call.bindings[idx];
        let class_name = param.role.class()?;
        let name = || api.name.clone();

        if let ParamRole::ResourceOut(_) = &param.role {
            let id = match binding {
                Binding::Resource { id } => *id,
                Binding::Null if param.nullable && call.negative => return None,
                _ => {
                    return Some(Violation::DanglingParameter {
                        call: index,
                        api: name(),
                        param: idx,
                        resource: None,
                    });
                }
            };
            return self.check_fresh(index, api, idx, id, class_name, state);
        }

        let id = match binding {
            Binding::Null | Binding::Stale { .. } if param.nullable && call.negative => {
                return None;
            }
            Binding::Resource { id } | Binding::Stale { id } => *id,
            _ => {
                return Some(Violation::DanglingParameter {
                    call: index,
                    api: name(),
                    param: idx,
                    resource: None,
                });
            }
        };
        let Some(record) = state.resource(id) else {
            return Some(Violation::DanglingParameter {
                call: index,
                api: name(),
                param: idx,
                resource: Some(id),
            });
        };

        if record.is_freed() {
            return Some(if param.frees() {
                Violation::DoubleFree {
                    call: index,
                    api: name(),
                    param: idx,
                    resource: id,
                }
            } else {
                Violation::UseAfterFree {
                    call: index,
                    api: name(),
                    param: idx,
                    resource: id,
                }
            });
        }

        let freed_parent = record
            .parent
            .filter(|p| state.resource(*p).is_some_and(|r| r.is_freed()));
        if let Some(parent) = freed_parent {
            return Some(Violation::UseAfterFree {
                call: index,
                api: name(),
                param: idx,
                resource: parent,
            });
        }

        if record.class != class_name {
            return Some(Violation::UnsatisfiedPrecondition {
                call: index,
                api: name(),
                param: idx,
                resource: id,
                expected: vec![format!("class {}", class_name)],
                actual: format!("class {}", record.class),
            });
        }

        if param.frees() && record.effective_ownership() == OwnershipMode::Borrowed {
            return Some(Violation::OwnershipConflict {
                call: index,
                api: name(),
                param: idx,
                resource: id,
                owner: record.owner,
            });
        }

        if param.frees() {
            let freed_here: Vec<ResourceId> = api
                .parameters
                .iter()
                .zip(&call.bindings)
                .filter(|(p, _)| p.frees())
                .filter_map(|(_, b)| b.resource())
                .collect();
            if let Some(dependent) = state
                .live_dependents(id)
                .find(|d| !freed_here.contains(d))
            {
                return Some(Violation::OwnershipConflict {
                    call: index,
                    api: name(),
                    param: idx,
                    resource: dependent,
                    owner: Some(id),
                });
            }
        }

        if !param.accepts_state(&record.state) {
            return Some(Violation::UnsatisfiedPrecondition {
                call: index,
                api: name(),
                param: idx,
                resource: id,
                expected: param.requires.clone(),
                actual: record.state.clone(),
            });
        }

        if let Some(target) = param.adopt_into.and_then(|t| call.bindings[t].resource()) {
            let foreign_owner = record.owner.filter(|o| *o != target);
            if foreign_owner.is_some() || state.owned_through(target, id) {
                return Some(Violation::OwnershipConflict {
                    call: index,
                    api: name(),
                    param: idx,
                    resource: id,
                    owner: foreign_owner.or(Some(target)),
                });
            }
        }

        if let Some(to) = param.becomes.as_deref().filter(|to| !param.frees() && *to != record.state) {
            let legal = self
                .catalog
                .lookup_class(class_name)
                .map(|c| c.has_edge(&record.state, to))
                .unwrap_or(false);
            if !legal {
                return Some(Violation::IllegalTransition {
                    call: index,
                    api: name(),
                    param: idx,
                    resource: id,
                    from: record.state.clone(),
                    to: to.to_string(),
                });
            }
        }

        None
    }

    /// Owned resources still alive in `state`.
    pub fn leaks(&self, state: &SequenceState) -> Vec<Violation> {
        state
            .resources()
            .filter(|r| !r.is_freed() && r.effective_ownership() != OwnershipMode::Borrowed)
            .map(|r| Violation::Leak {
                resource: r.id,
                class: r.class.clone(),
                state: r.state.clone(),
                created_at: r.created_at,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LintOptions {
    /// Report resources still alive at the end of the sequence.
    pub no_leak: bool,
}

/// Replays `calls` from an empty state, collecting every violation.
///
/// Each call is checked and then applied best-effort, so one mistake does
/// not hide the ones after it. An API missing from the catalog is fatal.
pub fn lint_calls(
    catalog: &Catalog,
    calls: &[CallSite],
    options: LintOptions,
) -> Result<Vec<Violation>, CatalogError> {
    let enforcer = Enforcer::new(catalog);
    let mut tracker = Tracker::new(catalog);
    let mut violations = Vec::new();
    for (index, call) in calls.iter().enumerate() {
        let api = catalog.lookup_api(&call.api)?;
        let found = enforcer.inspect(index, api, call, tracker.state());
        if !found.is_empty() {
            debug!(call = index, api = %api.name, count = found.len(), "violations");
        }
        let errors = tracker.apply(api, call);
        if found.is_empty() {
            for error in errors {
                violations.push(from_tracker_error(index, api, call, error)?);
            }
        }
        violations.extend(found);
    }
    if options.no_leak {
        violations.extend(enforcer.leaks(tracker.state()));
    }
    Ok(violations)
}

/// Maps a lifecycle effect the tracker refused onto the violation it amounts to.
fn from_tracker_error(
    index: usize,
    api: &ApiSpec,
    call: &CallSite,
    error: TrackerError,
) -> Result<Violation, CatalogError> {
    let param_of = |id: ResourceId| {
        call.bindings
            .iter()
            .position(|b| b.resource() == Some(id))
            .unwrap_or(api.parameters.len())
    };
    let conflict = |resource: ResourceId, owner: Option<ResourceId>| Violation::OwnershipConflict {
        call: index,
        api: api.name.clone(),
        param: param_of(resource),
        resource,
        owner,
    };
    Ok(match error {
        TrackerError::Catalog(e) => return Err(e),
        TrackerError::UnknownResource(id) => Violation::DanglingParameter {
            call: index,
            api: api.name.clone(),
            param: param_of(id),
            resource: Some(id),
        },
        TrackerError::DoubleFree(id) => Violation::DoubleFree {
            call: index,
            api: api.name.clone(),
            param: param_of(id),
            resource: id,
        },
        TrackerError::IllegalTransition { resource, from, to, .. } => Violation::IllegalTransition {
            call: index,
            api: api.name.clone(),
            param: param_of(resource),
            resource,
            from,
            to,
        },
        TrackerError::NotOwned { resource, owner } => conflict(resource, owner),
        TrackerError::AlreadyOwned { resource, owner }
        | TrackerError::OwnershipCycle { resource, owner } => conflict(resource, Some(owner)),
        TrackerError::DuplicateResource(id) | TrackerError::NotShared(id) => conflict(id, None),
        TrackerError::DuplicateGlobal { existing, .. } => conflict(existing, None),
        TrackerError::ArityMismatch { expected, actual, .. } => Violation::ArityMismatch {
            call: index,
            api: api.name.clone(),
            expected,
            actual,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_catalogs::{TREE, WIDGET};

    fn res(id: u32) -> Binding {
        Binding::Resource { id: ResourceId(id) }
    }

    fn call(api: &str, bindings: Vec<Binding>, produces: Vec<u32>) -> CallSite {
        CallSite {
            api: api.to_string(),
            bindings,
            produces: produces.into_iter().map(ResourceId).collect(),
            capture: None,
            negative: false,
        }
    }

    #[test]
    fn freeing_a_never_created_widget_is_dangling() {
        let catalog = Catalog::load_from_str(WIDGET).unwrap();
        let tracker = Tracker::new(&catalog);
        let enforcer = Enforcer::new(&catalog);
        assert_eq!(
            enforcer.check(&call("widget_free", vec![res(5)], vec![]), tracker.state()),
            Err(Violation::DanglingParameter {
                call: 0,
                api: "widget_free".to_string(),
                param: 0,
                resource: Some(ResourceId(5)),
            })
        );
    }

    #[test]
    fn use_after_free_and_double_free_are_distinguished() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let calls = vec![
            call("node_new", vec![], vec![0]),
            call("node_delete", vec![res(0)], vec![]),
            call("node_size", vec![res(0)], vec![]),
            call("node_delete", vec![res(0)], vec![]),
        ];
        let violations = lint_calls(&catalog, &calls, LintOptions::default()).unwrap();
        assert_eq!(violations.len(), 2, "violations: {:?}", violations);
        assert!(matches!(violations[0], Violation::UseAfterFree { call: 2, .. }));
        assert!(matches!(violations[1], Violation::DoubleFree { call: 3, .. }));
    }

    #[test]
    fn freeing_an_adopted_child_is_a_single_ownership_conflict() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let calls = vec![
            call("node_new", vec![], vec![0]),
            call("node_new", vec![], vec![1]),
            call("node_add_child", vec![res(0), res(1)], vec![]),
            call("node_delete", vec![res(1)], vec![]),
            call("node_delete", vec![res(0)], vec![]),
        ];
        let violations = lint_calls(&catalog, &calls, LintOptions { no_leak: true }).unwrap();
        assert_eq!(
            violations,
            vec![Violation::OwnershipConflict {
                call: 3,
                api: "node_delete".to_string(),
                param: 0,
                resource: ResourceId(1),
                owner: Some(ResourceId(0)),
            }]
        );
    }

    #[test]
    fn leaks_are_reported_only_in_no_leak_mode() {
        let catalog = Catalog::load_from_str(WIDGET).unwrap();
        let calls = vec![
            call("widget_create", vec![], vec![0]),
            call("widget_create", vec![], vec![1]),
            call("widget_free", vec![res(0)], vec![]),
        ];
        assert!(lint_calls(&catalog, &calls, LintOptions::default()).unwrap().is_empty());

        let strict = lint_calls(&catalog, &calls, LintOptions { no_leak: true }).unwrap();
        assert_eq!(strict.len(), 1);
        match &strict[0] {
            Violation::Leak { resource, state, created_at, .. } => {
                assert_eq!(*resource, ResourceId(1));
                assert_eq!(state, "Created");
                assert_eq!(*created_at, 1);
            }
            other => panic!("expected a leak, got {:?}", other),
        }
    }

    #[test]
    fn resource_out_over_a_live_resource_conflicts() {
        let catalog = crate::catalog::builtin("zlib").unwrap();
        let mut tracker = Tracker::new(&catalog);
        tracker.register("z_stream", "Deflating", None).unwrap();
        let api = catalog.lookup_api("inflateInit_").unwrap();
        let mut bindings = vec![res(0)];
        bindings.extend(
            api.parameters[1..]
                .iter()
                .map(|_| Binding::Literal { text: "0".to_string() }),
        );
        let violations =
            Enforcer::new(&catalog).inspect(1, api, &call("inflateInit_", bindings, vec![1]), tracker.state());
        assert!(
            matches!(violations.as_slice(), [Violation::OwnershipConflict { param: 0, .. }]),
            "violations: {:?}",
            violations
        );
    }

    #[test]
    fn stale_binding_needs_negative_marker_and_nullable_param() {
        let catalog = crate::catalog::builtin("zlib").unwrap();
        let mut tracker = Tracker::new(&catalog);
        let gz = tracker.register("gzFile", "Writing", None).unwrap();
        tracker.free(gz).unwrap();
        let enforcer = Enforcer::new(&catalog);

        let mut close = call("gzclose", vec![Binding::Stale { id: gz }], vec![]);
        assert!(matches!(
            enforcer.check(&close, tracker.state()),
            Err(Violation::DoubleFree { .. })
        ));
        close.negative = true;
        assert_eq!(enforcer.check(&close, tracker.state()), Ok(()));
    }

    #[test]
    fn null_handle_needs_a_negative_marker() {
        let catalog = crate::catalog::builtin("zlib").unwrap();
        let tracker = Tracker::new(&catalog);
        let enforcer = Enforcer::new(&catalog);

        let mut tell = call("gztell", vec![Binding::Null], vec![]);
        assert_eq!(
            enforcer.check(&tell, tracker.state()),
            Err(Violation::DanglingParameter {
                call: 0,
                api: "gztell".to_string(),
                param: 0,
                resource: None,
            })
        );
        tell.negative = true;
        assert_eq!(enforcer.check(&tell, tracker.state()), Ok(()));
    }

    #[test]
    fn parent_outliving_its_dependents_is_enforced() {
        let catalog = crate::catalog::builtin("lcms2").unwrap();
        let null = || Binding::Literal { text: "NULL".to_string() };
        let calls = vec![
            call("cmsCreateContext", vec![null(), null()], vec![0]),
            call("cmsCreate_sRGBProfileTHR", vec![res(0)], vec![1]),
            call("cmsDeleteContext", vec![res(0)], vec![]),
            call("cmsGetColorSpace", vec![res(1)], vec![]),
            call("cmsCloseProfile", vec![res(1)], vec![]),
        ];
        let violations = lint_calls(&catalog, &calls, LintOptions { no_leak: true }).unwrap();
        assert_eq!(
            violations,
            vec![
                Violation::OwnershipConflict {
                    call: 2,
                    api: "cmsDeleteContext".to_string(),
                    param: 0,
                    resource: ResourceId(1),
                    owner: Some(ResourceId(0)),
                },
                Violation::UseAfterFree {
                    call: 3,
                    api: "cmsGetColorSpace".to_string(),
                    param: 0,
                    resource: ResourceId(0),
                },
                Violation::UseAfterFree {
                    call: 4,
                    api: "cmsCloseProfile".to_string(),
                    param: 0,
                    resource: ResourceId(0),
                },
            ]
        );

        let ordered = vec![
            calls[0].clone(),
            calls[1].clone(),
            calls[3].clone(),
            calls[4].clone(),
            calls[2].clone(),
        ];
        let violations = lint_calls(&catalog, &ordered, LintOptions { no_leak: true }).unwrap();
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn reused_result_ids_are_reported() {
        let catalog = crate::catalog::builtin("cJSON").unwrap();
        let calls = vec![
            call("cJSON_CreateObject", vec![], vec![0]),
            call("cJSON_CreateObject", vec![], vec![0]),
            call("cJSON_Delete", vec![res(0)], vec![]),
        ];
        let violations = lint_calls(&catalog, &calls, LintOptions { no_leak: true }).unwrap();
        assert_eq!(
            violations,
            vec![Violation::OwnershipConflict {
                call: 1,
                api: "cJSON_CreateObject".to_string(),
                param: 0,
                resource: ResourceId(0),
                owner: None,
            }]
        );

        let calls = vec![
            call("cJSON_CreateObject", vec![], vec![0]),
            call("cJSON_Delete", vec![res(0)], vec![]),
            call("cJSON_CreateObject", vec![], vec![0]),
        ];
        let violations = lint_calls(&catalog, &calls, LintOptions::default()).unwrap();
        assert!(
            matches!(
                violations.as_slice(),
                [Violation::DanglingParameter { call: 2, resource: Some(ResourceId(0)), .. }]
            ),
            "{:?}",
            violations
        );
    }

    #[test]
    fn refused_tracker_effects_become_violations() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let new = catalog.lookup_api("node_new").unwrap();
        let calls = vec![call("node_new", vec![], vec![])];
        let violations = lint_calls(&catalog, &calls, LintOptions::default()).unwrap();
        assert_eq!(
            violations,
            vec![Violation::ArityMismatch {
                call: 0,
                api: "node_new".to_string(),
                expected: new.produced_classes().len(),
                actual: 0,
            }]
        );
    }

    #[test]
    fn arity_mismatch_counts_implicit_parameters() {
        let catalog = crate::catalog::builtin("sqlite3").unwrap();
        let shutdown = catalog.lookup_api("sqlite3_shutdown").unwrap();
        let tracker = Tracker::new(&catalog);
        let violations = Enforcer::new(&catalog).inspect(
            0,
            shutdown,
            &call("sqlite3_shutdown", vec![], vec![]),
            tracker.state(),
        );
        assert_eq!(
            violations,
            vec![Violation::ArityMismatch {
                call: 0,
                api: "sqlite3_shutdown".to_string(),
                expected: 1,
                actual: 0,
            }]
        );
    }

    #[test]
    fn unknown_api_is_fatal_for_lint() {
        let catalog = Catalog::load_from_str(WIDGET).unwrap();
        let calls = vec![call("widget_explode", vec![], vec![])];
        assert_eq!(
            lint_calls(&catalog, &calls, LintOptions::default()),
            Err(CatalogError::UnknownApi("widget_explode".to_string()))
        );
    }
}
