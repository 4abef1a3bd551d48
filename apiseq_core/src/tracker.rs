use crate::catalog::{
    ApiSpec, Catalog, CatalogError, FREED, OwnershipMode, ParamRole, ReturnSemantics,
    UNINITIALIZED,
};
use crate::sequence::{Binding, CallSite, ResourceDecl, ResourceId};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised when a lifecycle operation is not permitted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Illegal transition of {resource} ({class}): {from} -> {to}")]
    IllegalTransition {
        resource: ResourceId,
        class: String,
        from: String,
        to: String,
    },

    #[error("Resource {0} is already freed")]
    DoubleFree(ResourceId),

    #[error("Resource {resource} is borrowed and may not be freed (owner: {owner:?})")]
    NotOwned {
        resource: ResourceId,
        owner: Option<ResourceId>,
    },

    #[error("Resource id {0} is already registered")]
    DuplicateResource(ResourceId),

    #[error("Global class `{class}` already has a live instance {existing}")]
    DuplicateGlobal { class: String, existing: ResourceId },

    #[error("Resource {0} is not reference counted")]
    NotShared(ResourceId),

    #[error("Resource {resource} is already owned by {owner}")]
    AlreadyOwned {
        resource: ResourceId,
        owner: ResourceId,
    },

    #[error("Adopting {resource} into {owner} would create an ownership cycle")]
    OwnershipCycle {
        resource: ResourceId,
        owner: ResourceId,
    },

    #[error("Call to `{api}` binds {actual} values where {expected} are expected")]
    ArityMismatch {
        api: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub class: String,
    pub state: String,
    pub ownership: OwnershipMode,
    /// Container responsible for freeing this resource.
    pub owner: Option<ResourceId>,
    /// Resource this one was derived from and must not outlive.
    pub parent: Option<ResourceId>,
    pub refcount: u32,
    /// Index of the creating call in the call log.
    pub created_at: usize,
    pub global: bool,
}

impl ResourceRecord {
    pub fn is_freed(&self) -> bool {
        self.state == FREED
    }

    /// A resource with an owner is borrowed regardless of its class mode.
    pub fn effective_ownership(&self) -> OwnershipMode {
        if self.owner.is_some() {
            OwnershipMode::Borrowed
        } else {
            self.ownership
        }
    }
}

/// Resource table plus committed calls. Cloning is O(1); writes copy on demand.
#[derive(Debug, Clone, Default)]
pub struct SequenceState {
    resources: Arc<BTreeMap<ResourceId, ResourceRecord>>,
    call_log: Arc<Vec<CallSite>>,
    next_id: u32,
    next_slot: u32,
}

impl SequenceState {
    pub fn resource(&self, id: ResourceId) -> Option<&ResourceRecord> {
        self.resources.get(&id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.resources.values()
    }

    pub fn call_log(&self) -> &[CallSite] {
        &self.call_log
    }

    /// True if `ancestor` appears on the owner chain of `id` (or is `id`).
    pub fn owned_through(&self, id: ResourceId, ancestor: ResourceId) -> bool {
        let mut current = Some(id);
        let mut hops = 0;
        while let Some(cur) = current {
            if cur == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.resources.len() {
                return false;
            }
            current = self.resources.get(&cur).and_then(|r| r.owner);
        }
        false
    }

    /// Live resources derived from `id` through a parent link.
    pub fn live_dependents(&self, id: ResourceId) -> impl Iterator<Item = ResourceId> + '_ {
        self.resources
            .values()
            .filter(move |r| r.parent == Some(id) && !r.is_freed())
            .map(|r| r.id)
    }

    pub fn live_global(&self, class: &str) -> Option<ResourceId> {
        self.resources
            .values()
            .find(|r| r.global && r.class == class && !r.is_freed())
            .map(|r| r.id)
    }
}

/// Checkpoint of a [`SequenceState`].
#[derive(Debug, Clone)]
pub struct Snapshot(SequenceState);

/// Tracks the lifecycle of every resource of one sequence under construction.
pub struct Tracker<'c> {
    catalog: &'c Catalog,
    state: SequenceState,
}

impl<'c> Tracker<'c> {
    pub fn new(catalog: &'c Catalog) -> Self {
        Self {
            catalog,
            state: SequenceState::default(),
        }
    }

    pub fn catalog(&self) -> &'c Catalog {
        self.catalog
    }

    pub fn state(&self) -> &SequenceState {
        &self.state
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.state.clone())
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        self.state = snapshot.0;
    }

    /// Next id `register` would hand out.
    pub fn fresh_id(&self) -> ResourceId {
        ResourceId(self.state.next_id)
    }

    /// Ids `n` consecutive registrations would receive.
    pub fn fresh_ids(&self, n: usize) -> Vec<ResourceId> {
        (0..n as u32).map(|k| ResourceId(self.state.next_id + k)).collect()
    }

    pub fn next_slot(&self) -> u32 {
        self.state.next_slot
    }

    pub fn register(
        &mut self,
        class: &str,
        initial_state: &str,
        owner: Option<ResourceId>,
    ) -> Result<ResourceId, TrackerError> {
        let id = self.fresh_id();
        self.register_as(id, class, initial_state, owner, None)
    }

    pub fn register_as(
        &mut self,
        id: ResourceId,
        class: &str,
        initial_state: &str,
        owner: Option<ResourceId>,
        parent: Option<ResourceId>,
    ) -> Result<ResourceId, TrackerError> {
        let rc = self.catalog.lookup_class(class)?;
        if self.state.resources.contains_key(&id) {
            return Err(TrackerError::DuplicateResource(id));
        }
        if rc.global {
            if let Some(existing) = self.state.live_global(class) {
                return Err(TrackerError::DuplicateGlobal {
                    class: class.to_string(),
                    existing,
                });
            }
        }
        if !rc.has_edge(UNINITIALIZED, initial_state) {
            return Err(TrackerError::IllegalTransition {
                resource: id,
                class: class.to_string(),
                from: UNINITIALIZED.to_string(),
                to: initial_state.to_string(),
            });
        }
        for link in [owner, parent].into_iter().flatten() {
            if !self.state.resources.contains_key(&link) {
                return Err(TrackerError::UnknownResource(link));
            }
        }
        let record = ResourceRecord {
            id,
            class: class.to_string(),
            state: initial_state.to_string(),
            ownership: rc.ownership,
            owner,
            parent,
            refcount: 1,
            created_at: self.state.call_log.len(),
            global: rc.global,
        };
        Arc::make_mut(&mut self.state.resources).insert(id, record);
        self.state.next_id = self.state.next_id.max(id.0 + 1);
        Ok(id)
    }

    fn record(&self, id: ResourceId) -> Result<&ResourceRecord, TrackerError> {
        self.state
            .resources
            .get(&id)
            .ok_or(TrackerError::UnknownResource(id))
    }

    fn record_mut(&mut self, id: ResourceId) -> Result<&mut ResourceRecord, TrackerError> {
        Arc::make_mut(&mut self.state.resources)
            .get_mut(&id)
            .ok_or(TrackerError::UnknownResource(id))
    }

    pub fn transition(&mut self, id: ResourceId, to: &str) -> Result<(), TrackerError> {
        if to == FREED {
            return self.free(id);
        }
        let record = self.record(id)?;
        if record.state == to {
            return Ok(());
        }
        let class = self.catalog.lookup_class(&record.class)?;
        if record.is_freed() || !class.has_edge(&record.state, to) {
            return Err(TrackerError::IllegalTransition {
                resource: id,
                class: record.class.clone(),
                from: record.state.clone(),
                to: to.to_string(),
            });
        }
        self.record_mut(id)?.state = to.to_string();
        Ok(())
    }

    /// Frees `id`, cascading to every resource it owns.
    pub fn free(&mut self, id: ResourceId) -> Result<(), TrackerError> {
        let record = self.record(id)?;
        if record.is_freed() {
            return Err(TrackerError::DoubleFree(id));
        }
        match record.effective_ownership() {
            OwnershipMode::Borrowed => {
                return Err(TrackerError::NotOwned {
                    resource: id,
                    owner: record.owner,
                });
            }
            OwnershipMode::Shared if record.refcount > 1 => {
                self.record_mut(id)?.refcount -= 1;
                return Ok(());
            }
            _ => {}
        }

        let mut pending = vec![id];
        let resources = Arc::make_mut(&mut self.state.resources);
        while let Some(next) = pending.pop() {
            if let Some(r) = resources.get_mut(&next) {
                r.state = FREED.to_string();
                r.refcount = 0;
            }
            pending.extend(
                resources
                    .values()
                    .filter(|r| r.owner == Some(next) && !r.is_freed())
                    .map(|r| r.id),
            );
        }
        Ok(())
    }

    pub fn retain(&mut self, id: ResourceId) -> Result<(), TrackerError> {
        let record = self.record(id)?;
        if record.is_freed() {
            return Err(TrackerError::DoubleFree(id));
        }
        if record.ownership != OwnershipMode::Shared {
            return Err(TrackerError::NotShared(id));
        }
        self.record_mut(id)?.refcount += 1;
        Ok(())
    }

    /// Hands ownership of `child` to `owner`.
    pub fn adopt(&mut self, child: ResourceId, owner: ResourceId) -> Result<(), TrackerError> {
        let record = self.record(child)?;
        self.record(owner)?;
        if let Some(existing) = record.owner {
            if existing != owner {
                return Err(TrackerError::AlreadyOwned {
                    resource: child,
                    owner: existing,
                });
            }
        }
        if self.state.owned_through(owner, child) {
            return Err(TrackerError::OwnershipCycle {
                resource: child,
                owner,
            });
        }
        self.record_mut(child)?.owner = Some(owner);
        Ok(())
    }

    pub fn live_resources(&self) -> Vec<&ResourceRecord> {
        self.state.resources.values().filter(|r| !r.is_freed()).collect()
    }

    /// Live resources the sequence itself is responsible for freeing.
    pub fn leaked(&self) -> Vec<&ResourceRecord> {
        self.state
            .resources
            .values()
            .filter(|r| !r.is_freed() && r.effective_ownership() != OwnershipMode::Borrowed)
            .collect()
    }

    pub fn has_live_dependents(&self, id: ResourceId) -> bool {
        self.state.live_dependents(id).next().is_some()
    }

    pub fn declarations(&self) -> Vec<ResourceDecl> {
        self.state
            .resources
            .values()
            .map(|r| ResourceDecl {
                id: r.id,
                class: r.class.clone(),
            })
            .collect()
    }

    /// Applies every effect of `call` and appends it to the log.
    ///
    /// Effects that are not permitted are skipped and returned, so a linter
    /// can keep going after a violation while the synthesizer treats any
    /// returned error as a failed step.
    pub fn apply(&mut self, api: &ApiSpec, call: &CallSite) -> Vec<TrackerError> {
        let mut errors = Vec::new();
        if call.bindings.len() != api.parameters.len() {
            errors.push(TrackerError::ArityMismatch {
                api: api.name.clone(),
                expected: api.parameters.len(),
                actual: call.bindings.len(),
            });
            self.push_call(call);
            return errors;
        }

        let bound = |idx: usize| match call.bindings.get(idx) {
            Some(Binding::Resource { id }) => Some(*id),
            _ => None,
        };

        let mut frees = Vec::new();
        for (idx, param) in api.parameters.iter().enumerate() {
            if !param.role.is_consuming() {
                continue;
            }
            let Some(id) = bound(idx) else { continue };
            if param.retain {
                if let Err(e) = self.retain(id) {
                    errors.push(e);
                }
            }
            if let Some(target) = param.adopt_into.and_then(bound) {
                if let Err(e) = self.adopt(id, target) {
                    errors.push(e);
                }
            }
            match param.becomes.as_deref() {
                Some(FREED) => frees.push(id),
                Some(next) => {
                    if let Err(e) = self.transition(id, next) {
                        errors.push(e);
                    }
                }
                None => {}
            }
        }
        for id in frees {
            if let Err(e) = self.free(id) {
                errors.push(e);
            }
        }

        let produced = api.produced_classes().len();
        if call.produces.len() != produced {
            errors.push(TrackerError::ArityMismatch {
                api: api.name.clone(),
                expected: produced,
                actual: call.produces.len(),
            });
        } else {
            let mut ids = call.produces.iter().copied();
            for (idx, param) in api.parameters.iter().enumerate() {
                let ParamRole::ResourceOut(class) = &param.role else {
                    continue;
                };
                let Some(id) = ids.next() else { break };
                let initial = param.becomes.as_deref().unwrap_or_default();
                let parent = api.out_parents.get(&idx).and_then(|&p| bound(p));
                if let Err(e) = self.register_as(id, class, initial, None, parent) {
                    errors.push(e);
                }
            }
            if let ReturnSemantics::NewResource {
                class,
                state,
                owner_param,
                parent_param,
                ..
            } = &api.returns
            {
                if let Some(id) = ids.next() {
                    let owner = owner_param.and_then(bound);
                    let parent = parent_param.and_then(bound);
                    match self.register_as(id, class, state, owner, parent) {
                        Ok(id) if owner_param.is_some() && owner.is_none() => {
                            if let Ok(r) = self.record_mut(id) {
                                r.ownership = OwnershipMode::Borrowed;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => errors.push(e),
                    }
                }
            }
        }

        self.push_call(call);
        errors
    }

    fn push_call(&mut self, call: &CallSite) {
        let highest = call
            .bindings
            .iter()
            .filter_map(|b| match b {
                Binding::Buffer { slot, .. }
                | Binding::BufferLen { slot }
                | Binding::LenRef { slot, .. }
                | Binding::Out { slot } => Some(*slot),
                _ => None,
            })
            .chain(call.capture)
            .max();
        if let Some(slot) = highest {
            self.state.next_slot = self.state.next_slot.max(slot + 1);
        }
        Arc::make_mut(&mut self.state.call_log).push(call.clone());
    }
}
