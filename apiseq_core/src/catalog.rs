use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// State every resource starts in before its producing call.
pub const UNINITIALIZED: &str = "Uninitialized";
/// Terminal, absorbing state of every resource class.
pub const FREED: &str = "Freed";

/// Errors raised while loading or querying a capability catalog.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The requested API is not part of the catalog.
    #[error("Unknown API `{0}` in catalog")]
    UnknownApi(String),

    /// The requested resource class is not part of the catalog.
    #[error("Unknown resource class `{0}` in catalog")]
    UnknownClass(String),

    /// No built-in catalog exists under this name.
    #[error("No built-in catalog for library `{0}`")]
    UnknownLibrary(String),

    /// The catalog source could not be read.
    #[error("Catalog I/O error: {0}")]
    Io(String),

    /// The catalog source is not valid TOML or does not match the schema.
    #[error("Catalog parse error: {0}")]
    Parse(String),

    /// The catalog parsed but describes an inconsistent API surface.
    #[error("Invalid catalog `{library}`: {reason}")]
    Invalid { library: String, reason: String },
}

/// Who is responsible for destroying a resource.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipMode {
    /// Only the creator may free it.
    #[default]
    Exclusive,
    /// Reference counted; freed when the last reference drops.
    Shared,
    /// Never freed by the sequence; owned by a container.
    Borrowed,
}

/// How a handle is materialized in emitted source.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Storage {
    /// An opaque pointer-typed handle, initialized to `NULL`.
    #[default]
    Pointer,
    /// A struct living on the stack, passed by address.
    Value,
    /// Process-wide library context; has no variable at all.
    Context,
}

/// How a `ValueIn` argument is filled in.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LiteralKind {
    Int {
        #[serde(default)]
        min: i64,
        #[serde(default = "default_int_max")]
        max: i64,
    },
    Uint {
        #[serde(default)]
        min: u64,
        #[serde(default = "default_uint_max")]
        max: u64,
    },
    Double,
    Bool,
    String {
        #[serde(default)]
        pool: Vec<String>,
    },
    Null,
    /// A local byte array declared by the emitter.
    Buffer {
        #[serde(default = "default_buffer_len")]
        len: usize,
    },
    /// `sizeof` the most recent buffer argument of the same call.
    BufferLen,
    /// Address of a local initialized to the size of the most recent buffer.
    BufferLenRef,
    /// `strlen` of the most recent string argument of the same call.
    StrLen,
    Choice {
        options: Vec<String>,
    },
    /// A fixed C expression, emitted verbatim.
    Expr {
        text: String,
    },
}

fn default_int_max() -> i64 {
    16
}

fn default_uint_max() -> u64 {
    64
}

fn default_buffer_len() -> usize {
    64
}

/// Role a parameter plays with respect to resources.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ParamRole {
    ValueIn,
    ValueOut,
    ResourceIn(String),
    ResourceOut(String),
    ResourceInOut(String),
}

impl ParamRole {
    pub fn class(&self) -> Option<&str> {
        match self {
            ParamRole::ResourceIn(c) | ParamRole::ResourceOut(c) | ParamRole::ResourceInOut(c) => {
                Some(c)
            }
            _ => None,
        }
    }

    /// True for roles that consume an already existing resource.
    pub fn is_consuming(&self) -> bool {
        matches!(self, ParamRole::ResourceIn(_) | ParamRole::ResourceInOut(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub role: ParamRole,
    pub type_tag: String,
    /// Accepted states for consuming roles; empty means any live state.
    pub requires: Vec<String>,
    /// Postcondition: state the resource is in after the call.
    pub becomes: Option<String>,
    pub literal: Option<LiteralKind>,
    /// The call tolerates a NULL or invalid handle here.
    pub nullable: bool,
    pub by_ref: bool,
    /// After the call the bound resource is owned by the resource bound at this index.
    pub adopt_into: Option<usize>,
    /// The call takes an additional reference on a shared resource.
    pub retain: bool,
    /// Bound to the global context instance; absent from the C argument list.
    pub implicit: bool,
}

impl Parameter {
    pub fn frees(&self) -> bool {
        self.becomes.as_deref() == Some(FREED)
    }

    pub fn accepts_state(&self, state: &str) -> bool {
        state != FREED
            && state != UNINITIALIZED
            && (self.requires.is_empty() || self.requires.iter().any(|s| s == state))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReturnSemantics {
    None,
    StatusCode {
        type_tag: String,
    },
    Value {
        type_tag: String,
    },
    NewResource {
        class: String,
        state: String,
        type_tag: Option<String>,
        /// Parameter whose resource owns the returned handle (borrowed result).
        owner_param: Option<usize>,
        /// Parameter whose resource must outlive the returned handle.
        parent_param: Option<usize>,
    },
}

impl ReturnSemantics {
    pub fn captured_type(&self) -> Option<&str> {
        match self {
            ReturnSemantics::StatusCode { type_tag } | ReturnSemantics::Value { type_tag } => {
                Some(type_tag)
            }
            _ => None,
        }
    }
}

/// One callable operation of a library.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiSpec {
    pub name: String,
    /// The C function emitted for this spec; several specs may share one symbol.
    pub symbol: String,
    /// Logical operation this API is an interchangeable variant of.
    pub variant_of: Option<String>,
    pub parameters: Vec<Parameter>,
    pub returns: ReturnSemantics,
    /// Parent links declared by `ResourceOut` parameters: param index -> parent param index.
    pub out_parents: BTreeMap<usize, usize>,
}

impl ApiSpec {
    pub fn logical_name(&self) -> &str {
        self.variant_of.as_deref().unwrap_or(&self.name)
    }

    pub fn frees_any(&self) -> bool {
        self.parameters.iter().any(|p| p.frees())
    }

    pub fn produces_any(&self) -> bool {
        matches!(self.returns, ReturnSemantics::NewResource { .. })
            || self
                .parameters
                .iter()
                .any(|p| matches!(p.role, ParamRole::ResourceOut(_)))
    }

    /// Classes of every resource this call produces, in production order.
    pub fn produced_classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self
            .parameters
            .iter()
            .filter_map(|p| match &p.role {
                ParamRole::ResourceOut(c) => Some(c.as_str()),
                _ => None,
            })
            .collect();
        if let ReturnSemantics::NewResource { class, .. } = &self.returns {
            classes.push(class);
        }
        classes
    }

    pub fn explicit_arity(&self) -> usize {
        self.parameters.iter().filter(|p| !p.implicit).count()
    }
}

/// A `state -> state` edge of a resource class, labelled by the API causing it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub api: String,
    pub logical: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceClass {
    pub name: String,
    pub c_type: String,
    pub storage: Storage,
    pub ownership: OwnershipMode,
    /// Always starts with `Uninitialized` and ends with `Freed`.
    pub states: Vec<String>,
    pub var_prefix: String,
    pub global: bool,
    pub cross_library: bool,
    pub transitions: Vec<Transition>,
}

impl ResourceClass {
    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn live_states(&self) -> impl Iterator<Item = &str> {
        self.states
            .iter()
            .map(String::as_str)
            .filter(|s| *s != UNINITIALIZED && *s != FREED)
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    pub fn edges_from<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions.iter().filter(move |t| t.from == from)
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
struct RawCatalog {
    library: String,
    #[serde(default)]
    headers: Vec<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    ban: Vec<String>,
    #[serde(default, rename = "class")]
    classes: Vec<RawClass>,
    #[serde(default, rename = "api")]
    apis: Vec<RawApi>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
struct RawClass {
    name: String,
    c_type: String,
    #[serde(default)]
    storage: Storage,
    #[serde(default)]
    ownership: OwnershipMode,
    #[serde(default)]
    states: Vec<String>,
    var_prefix: Option<String>,
    #[serde(default)]
    global: bool,
    #[serde(default)]
    cross_library: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
struct RawApi {
    name: String,
    symbol: Option<String>,
    variant_of: Option<String>,
    #[serde(default)]
    returns: RawReturn,
    #[serde(default)]
    params: Vec<RawParam>,
    #[serde(default)]
    needs: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum RawReturn {
    #[default]
    None,
    Status {
        #[serde(rename = "type")]
        type_tag: String,
    },
    Value {
        #[serde(rename = "type")]
        type_tag: String,
    },
    NewResource {
        class: String,
        state: String,
        #[serde(rename = "type")]
        type_tag: Option<String>,
        #[serde(rename = "owner-param")]
        owner_param: Option<usize>,
        #[serde(rename = "parent-param")]
        parent_param: Option<usize>,
    },
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum RawRole {
    ValueIn,
    ValueOut,
    ResourceIn,
    ResourceOut,
    ResourceInOut,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
struct RawParam {
    role: RawRole,
    #[serde(rename = "type", default)]
    type_tag: String,
    class: Option<String>,
    #[serde(default)]
    requires: Vec<String>,
    becomes: Option<String>,
    literal: Option<LiteralKind>,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    by_ref: bool,
    adopt_into: Option<usize>,
    parent_param: Option<usize>,
    #[serde(default)]
    retain: bool,
    #[serde(default)]
    implicit: bool,
}

/// The declarative API surface of one library.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub library: String,
    pub headers: Vec<String>,
    pub description: String,
    /// APIs never chosen by the synthesizer (still known to the linter).
    pub banned: BTreeSet<String>,
    classes: BTreeMap<String, ResourceClass>,
    apis: Vec<ApiSpec>,
    by_name: HashMap<String, usize>,
    producers: BTreeMap<String, Vec<usize>>,
}

impl Catalog {
    pub fn load_from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CatalogError::Io(format!("Failed to read catalog at {:?}: {}", path, e))
        })?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, CatalogError> {
        let raw: RawCatalog =
            toml::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawCatalog) -> Result<Self, CatalogError> {
        let library = raw.library.clone();
        let invalid = |reason: String| CatalogError::Invalid {
            library: library.clone(),
            reason,
        };

        let mut classes = BTreeMap::new();
        for rc in raw.classes {
            if rc.states.iter().any(|s| s == UNINITIALIZED || s == FREED) {
                return Err(invalid(format!(
                    "class `{}` lists a reserved state; `{}` and `{}` are implicit",
                    rc.name, UNINITIALIZED, FREED
                )));
            }
            if rc.states.is_empty() {
                return Err(invalid(format!("class `{}` has no live state", rc.name)));
            }
            let mut states = vec![UNINITIALIZED.to_string()];
            states.extend(rc.states);
            states.push(FREED.to_string());
            let var_prefix = rc.var_prefix.unwrap_or_else(|| default_var_prefix(&rc.name));
            let class = ResourceClass {
                name: rc.name.clone(),
                c_type: rc.c_type,
                storage: rc.storage,
                ownership: rc.ownership,
                states,
                var_prefix,
                global: rc.global,
                cross_library: rc.cross_library,
                transitions: Vec::new(),
            };
            if classes.insert(rc.name.clone(), class).is_some() {
                return Err(invalid(format!("duplicate class `{}`", rc.name)));
            }
        }

        let mut apis = Vec::with_capacity(raw.apis.len());
        let mut by_name = HashMap::new();
        for ra in raw.apis {
            let api = convert_api(ra, &classes).map_err(invalid)?;
            if by_name.insert(api.name.clone(), apis.len()).is_some() {
                return Err(invalid(format!("duplicate API `{}`", api.name)));
            }
            apis.push(api);
        }

        for banned in &raw.ban {
            if !by_name.contains_key(banned) {
                return Err(invalid(format!("banned API `{}` is not declared", banned)));
            }
        }

        let mut producers: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, api) in apis.iter().enumerate() {
            for class_name in api.produced_classes() {
                producers.entry(class_name.to_string()).or_default().push(idx);
            }
            for (from, to, class_name) in api_edges(api, &classes) {
                if let Some(class) = classes.get_mut(&class_name) {
                    let edge = Transition {
                        from,
                        to,
                        api: api.name.clone(),
                        logical: api.logical_name().to_string(),
                    };
                    if !class.transitions.contains(&edge) {
                        class.transitions.push(edge);
                    }
                }
            }
        }
        for class in classes.values_mut() {
            class.transitions.sort();
        }

        for class in classes.values() {
            if class.ownership == OwnershipMode::Borrowed {
                continue;
            }
            if !producers.contains_key(&class.name) {
                return Err(invalid(format!("class `{}` has no producing API", class.name)));
            }
            let has_destructor = apis.iter().any(|api| {
                api.parameters
                    .iter()
                    .any(|p| p.role.class() == Some(class.name.as_str()) && p.frees())
            });
            if !has_destructor {
                return Err(invalid(format!("class `{}` has no destructor", class.name)));
            }
        }

        Ok(Self {
            library: raw.library,
            headers: raw.headers,
            description: raw.description,
            banned: raw.ban.into_iter().collect(),
            classes,
            apis,
            by_name,
            producers,
        })
    }

    pub fn lookup_api(&self, name: &str) -> Result<&ApiSpec, CatalogError> {
        self.by_name
            .get(name)
            .map(|&idx| &self.apis[idx])
            .ok_or_else(|| CatalogError::UnknownApi(name.to_string()))
    }

    pub fn lookup_class(&self, name: &str) -> Result<&ResourceClass, CatalogError> {
        self.classes
            .get(name)
            .ok_or_else(|| CatalogError::UnknownClass(name.to_string()))
    }

    /// Transition edges of `class`, creation and destruction included.
    pub fn edges(&self, class: &str) -> Result<&[Transition], CatalogError> {
        self.lookup_class(class).map(|c| c.transitions.as_slice())
    }

    /// All APIs emitted as the given C symbol, in catalog order.
    pub fn apis_by_symbol(&self, symbol: &str) -> Vec<&ApiSpec> {
        self.apis.iter().filter(|a| a.symbol == symbol).collect()
    }

    pub fn apis(&self) -> &[ApiSpec] {
        &self.apis
    }

    pub fn classes(&self) -> impl Iterator<Item = &ResourceClass> {
        self.classes.values()
    }

    pub fn apis_producing(&self, class: &str) -> Vec<&ApiSpec> {
        self.producers
            .get(class)
            .map(|idxs| idxs.iter().map(|&i| &self.apis[i]).collect())
            .unwrap_or_default()
    }

    /// APIs that accept a resource of `class` in `state` as a consuming parameter.
    pub fn apis_consuming(&self, class: &str, state: &str) -> Vec<&ApiSpec> {
        self.apis
            .iter()
            .filter(|api| {
                api.parameters.iter().any(|p| {
                    p.role.is_consuming()
                        && p.role.class() == Some(class)
                        && p.accepts_state(state)
                })
            })
            .collect()
    }

    /// APIs that can free a resource of `class` currently in `state`, with the param index.
    pub fn destructors(&self, class: &str, state: &str) -> Vec<(&ApiSpec, usize)> {
        let mut found = Vec::new();
        for api in &self.apis {
            for (idx, p) in api.parameters.iter().enumerate() {
                if p.role.is_consuming()
                    && p.role.class() == Some(class)
                    && p.frees()
                    && p.accepts_state(state)
                {
                    found.push((api, idx));
                }
            }
        }
        found
    }

    pub fn global_classes(&self) -> impl Iterator<Item = &ResourceClass> {
        self.classes.values().filter(|c| c.global)
    }

    /// Global classes some synthesizable API depends on through an implicit parameter.
    pub fn required_globals(&self) -> BTreeSet<String> {
        self.apis
            .iter()
            .filter(|api| !self.banned.contains(&api.name))
            .flat_map(|api| api.parameters.iter())
            .filter(|p| p.implicit && p.role.is_consuming())
            .filter_map(|p| p.role.class().map(str::to_string))
            .collect()
    }

    pub fn total_edges(&self) -> usize {
        self.classes.values().map(|c| c.transitions.len()).sum()
    }

    /// Two catalogs may appear in one sequence only through explicitly compatible classes.
    pub fn is_cross_library_compatible(&self, other: &Catalog, class: &str) -> bool {
        if self.library == other.library {
            return true;
        }
        match (self.classes.get(class), other.classes.get(class)) {
            (Some(a), Some(b)) => a.cross_library && b.cross_library,
            _ => false,
        }
    }
}

fn default_var_prefix(class: &str) -> String {
    let mut prefix: String = class
        .trim_start_matches("struct ")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    if prefix.is_empty() || prefix.starts_with(|c: char| c.is_ascii_digit()) {
        prefix.insert(0, 'r');
    }
    prefix
}

fn convert_api(ra: RawApi, classes: &BTreeMap<String, ResourceClass>) -> Result<ApiSpec, String> {
    let name = ra.name;
    let class_of = |class: &Option<String>, idx: usize| -> Result<String, String> {
        let class = class
            .clone()
            .ok_or_else(|| format!("API `{}` param {} needs a class", name, idx))?;
        if !classes.contains_key(&class) {
            return Err(format!("API `{}` param {} names unknown class `{}`", name, idx, class));
        }
        Ok(class)
    };

    let mut parameters = Vec::with_capacity(ra.params.len() + ra.needs.len());
    let mut out_parents = BTreeMap::new();
    for (idx, rp) in ra.params.into_iter().enumerate() {
        let role = match rp.role {
            RawRole::ValueIn | RawRole::ValueOut => {
                if rp.class.is_some() {
                    return Err(format!("API `{}` value param {} cannot name a class", name, idx));
                }
                if rp.role == RawRole::ValueIn {
                    ParamRole::ValueIn
                } else {
                    ParamRole::ValueOut
                }
            }
            RawRole::ResourceIn => ParamRole::ResourceIn(class_of(&rp.class, idx)?),
            RawRole::ResourceOut => ParamRole::ResourceOut(class_of(&rp.class, idx)?),
            RawRole::ResourceInOut => ParamRole::ResourceInOut(class_of(&rp.class, idx)?),
        };
        if let Some(class_name) = role.class() {
            let class = &classes[class_name];
            for s in &rp.requires {
                if !class.has_state(s) || s == FREED || s == UNINITIALIZED {
                    return Err(format!(
                        "API `{}` param {} requires unknown state `{}` of `{}`",
                        name, idx, s, class_name
                    ));
                }
            }
            if let Some(b) = &rp.becomes {
                if !class.has_state(b) || b == UNINITIALIZED {
                    return Err(format!(
                        "API `{}` param {} becomes unknown state `{}` of `{}`",
                        name, idx, b, class_name
                    ));
                }
            }
            if matches!(role, ParamRole::ResourceOut(_))
                && matches!(rp.becomes.as_deref(), None | Some(FREED))
            {
                return Err(format!(
                    "API `{}` resource-out param {} needs a live initial state",
                    name, idx
                ));
            }
            if rp.implicit && !class.global {
                return Err(format!(
                    "API `{}` param {} is implicit but `{}` is not global",
                    name, idx, class_name
                ));
            }
        } else if rp.becomes.is_some() || !rp.requires.is_empty() {
            return Err(format!("API `{}` value param {} cannot carry states", name, idx));
        }
        if let Some(parent) = rp.parent_param {
            out_parents.insert(idx, parent);
        }
        parameters.push(Parameter {
            role,
            type_tag: rp.type_tag,
            requires: rp.requires,
            becomes: rp.becomes,
            literal: rp.literal,
            nullable: rp.nullable,
            by_ref: rp.by_ref,
            adopt_into: rp.adopt_into,
            retain: rp.retain,
            implicit: rp.implicit,
        });
    }

    for need in ra.needs {
        let class = classes
            .get(&need)
            .ok_or_else(|| format!("API `{}` needs unknown class `{}`", name, need))?;
        if !class.global {
            return Err(format!("API `{}` needs `{}` which is not global", name, need));
        }
        parameters.push(Parameter {
            role: ParamRole::ResourceIn(need),
            type_tag: String::new(),
            requires: Vec::new(),
            becomes: None,
            literal: None,
            nullable: false,
            by_ref: false,
            adopt_into: None,
            retain: false,
            implicit: true,
        });
    }

    let resource_param = |idx: usize, what: &str| -> Result<(), String> {
        match parameters.get(idx) {
            Some(p) if p.role.is_consuming() => Ok(()),
            _ => Err(format!(
                "API `{}` {} {} does not point at a consuming resource param",
                name, what, idx
            )),
        }
    };
    for (idx, p) in parameters.iter().enumerate() {
        if let Some(target) = p.adopt_into {
            if target == idx {
                return Err(format!("API `{}` param {} adopts into itself", name, idx));
            }
            resource_param(target, "adopt-into")?;
        }
    }
    for parent in out_parents.values() {
        resource_param(*parent, "parent-param")?;
    }

    let returns = match ra.returns {
        RawReturn::None => ReturnSemantics::None,
        RawReturn::Status { type_tag } => ReturnSemantics::StatusCode { type_tag },
        RawReturn::Value { type_tag } => ReturnSemantics::Value { type_tag },
        RawReturn::NewResource {
            class,
            state,
            type_tag,
            owner_param,
            parent_param,
        } => {
            let rc = classes
                .get(&class)
                .ok_or_else(|| format!("API `{}` returns unknown class `{}`", name, class))?;
            if !rc.has_state(&state) || state == FREED || state == UNINITIALIZED {
                return Err(format!(
                    "API `{}` returns `{}` in unknown state `{}`",
                    name, class, state
                ));
            }
            if let Some(owner) = owner_param {
                resource_param(owner, "owner-param")?;
            }
            if let Some(parent) = parent_param {
                resource_param(parent, "parent-param")?;
            }
            ReturnSemantics::NewResource {
                class,
                state,
                type_tag,
                owner_param,
                parent_param,
            }
        }
    };

    Ok(ApiSpec {
        symbol: ra.symbol.unwrap_or_else(|| name.clone()),
        name,
        variant_of: ra.variant_of,
        parameters,
        returns,
        out_parents,
    })
}

/// `(from, to, class)` edges contributed by one API.
fn api_edges(
    api: &ApiSpec,
    classes: &BTreeMap<String, ResourceClass>,
) -> Vec<(String, String, String)> {
    let mut edges = Vec::new();
    for p in &api.parameters {
        let Some(class_name) = p.role.class() else {
            continue;
        };
        let class = &classes[class_name];
        match &p.role {
            ParamRole::ResourceOut(_) => {
                if let Some(to) = &p.becomes {
                    edges.push((UNINITIALIZED.to_string(), to.clone(), class_name.to_string()));
                }
            }
            _ => {
                let Some(to) = &p.becomes else { continue };
                let froms: Vec<String> = if p.requires.is_empty() {
                    class.live_states().map(str::to_string).collect()
                } else {
                    p.requires.clone()
                };
                for from in froms {
                    edges.push((from, to.clone(), class_name.to_string()));
                }
            }
        }
    }
    if let ReturnSemantics::NewResource { class, state, .. } = &api.returns {
        edges.push((UNINITIALIZED.to_string(), state.clone(), class.clone()));
    }
    edges
}

/// Libraries with a catalog bundled into the crate.
pub const BUILTIN_LIBRARIES: [&str; 7] =
    ["cJSON", "lcms2", "libpcap", "libpng", "cre2", "sqlite3", "zlib"];

const BUILTIN_SOURCES: [&str; 7] = [
    include_str!("../catalogs/cjson.toml"),
    include_str!("../catalogs/lcms2.toml"),
    include_str!("../catalogs/libpcap.toml"),
    include_str!("../catalogs/libpng.toml"),
    include_str!("../catalogs/cre2.toml"),
    include_str!("../catalogs/sqlite3.toml"),
    include_str!("../catalogs/zlib.toml"),
];

static BUILTIN_CACHE: [OnceLock<Result<Arc<Catalog>, CatalogError>>; 7] =
    [const { OnceLock::new() }; 7];

fn builtin_index(name: &str) -> Option<usize> {
    let lowered = name.to_ascii_lowercase();
    let canonical = match lowered.as_str() {
        "cjson" => "cJSON",
        "lcms" | "lcms2" => "lcms2",
        "pcap" | "libpcap" => "libpcap",
        "png" | "libpng" => "libpng",
        "re2" | "cre2" => "cre2",
        "sqlite" | "sqlite3" => "sqlite3",
        "zlib" | "z" => "zlib",
        _ => return None,
    };
    BUILTIN_LIBRARIES.iter().position(|l| *l == canonical)
}

/// Returns the bundled catalog for `name`, parsing it at most once per process.
pub fn builtin(name: &str) -> Result<Arc<Catalog>, CatalogError> {
    let idx = builtin_index(name).ok_or_else(|| CatalogError::UnknownLibrary(name.to_string()))?;
    BUILTIN_CACHE[idx]
        .get_or_init(|| Catalog::load_from_str(BUILTIN_SOURCES[idx]).map(Arc::new))
        .clone()
}
