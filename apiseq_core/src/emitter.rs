use crate::catalog::{
    ApiSpec, Catalog, CatalogError, ParamRole, ReturnSemantics, Storage, UNINITIALIZED,
};
use crate::sequence::{Binding, CallSite, ResourceId, Sequence, Termination};
use crate::tracker::Tracker;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Value every emitted test function returns on completion.
pub const SENTINEL: i32 = 66;

/// Local names the emitter reserves for itself.
const RESERVED_PREFIXES: [&str; 5] = ["v", "o", "buf", "len", "checksum"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("call #{call} `{api}`: {actual} bindings for {expected} parameters")]
    ArityMismatch {
        call: usize,
        api: String,
        expected: usize,
        actual: usize,
    },

    #[error("call #{call} `{api}` binds {resource}, which the sequence never declares")]
    UndeclaredResource {
        call: usize,
        api: String,
        resource: ResourceId,
    },

    #[error("call #{call} `{api}` param {param} cannot be rendered: {reason}")]
    Unrenderable {
        call: usize,
        api: String,
        param: usize,
        reason: String,
    },

    #[error("Metadata serialization failed: {0}")]
    Serialization(String),
}

/// Summary figures carried in the `<Quality>` header and the metadata record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Quality {
    pub distinct_apis: usize,
    /// Distinct `(class, from, to)` lifecycle edges the sequence walks.
    pub edges_covered: usize,
    /// `edges_covered` over all edges of the catalog.
    pub edge_coverage: f64,
    pub captured_values: usize,
    pub negative_calls: usize,
}

/// Sidecar record written next to every emitted source file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SequenceMetadata {
    pub id: u64,
    pub library: String,
    pub seed: u64,
    pub length: usize,
    /// API multiset.
    pub apis: BTreeMap<String, usize>,
    pub classes: BTreeSet<String>,
    pub triples: Vec<[String; 3]>,
    /// Fraction of calls that consume a resource produced by an earlier call.
    pub density: f64,
    pub score: f64,
    pub quality: Quality,
    /// md5 of the emitted source, lowercase hex.
    pub digest: String,
    pub termination: Termination,
}

/// Source text plus its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub source: String,
    pub metadata: SequenceMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CKind {
    Pointer,
    Integer,
    Floating,
    Aggregate,
}

/// Rough C classification of a type spelling, enough to declare and fold a local.
fn classify(type_tag: &str) -> CKind {
    let t = type_tag.trim();
    const POINTER_TYPEDEFS: [&str; 6] = ["charp", "voidp", "voidpc", "bytep", "structp", "infop"];
    if t.contains('*') || POINTER_TYPEDEFS.iter().any(|s| t.ends_with(s)) {
        return CKind::Pointer;
    }
    if t.contains("double") || t.contains("float") || t.contains("Float") {
        return CKind::Floating;
    }
    const INTEGER_MARKERS: [&str; 14] = [
        "int", "Int", "long", "Long", "short", "char", "unsigned", "bool", "Bool", "Number",
        "Signature", "byte", "Byte", "_t",
    ];
    if INTEGER_MARKERS.iter().any(|m| t.contains(m)) {
        return CKind::Integer;
    }
    CKind::Aggregate
}

/// `T *` -> `T`; anything else is returned unchanged.
fn strip_pointer(type_tag: &str) -> &str {
    let t = type_tag.trim();
    match t.strip_suffix('*') {
        Some(inner) => inner.trim_end(),
        None => t,
    }
}

fn join_decl(type_tag: &str, name: &str) -> String {
    let t = type_tag.trim();
    if t.ends_with('*') {
        format!("{}{}", t, name)
    } else {
        format!("{} {}", t, name)
    }
}

fn declare(out: &mut Vec<String>, type_tag: &str, name: &str) {
    match classify(type_tag) {
        CKind::Pointer => out.push(format!("{} = NULL;", join_decl(type_tag, name))),
        CKind::Integer | CKind::Floating => out.push(format!("{} = 0;", join_decl(type_tag, name))),
        CKind::Aggregate => {
            out.push(format!("{};", join_decl(type_tag, name)));
            out.push(format!("memset(&{0}, 0, sizeof({0}));", name));
        }
    }
}

fn checksum_term(type_tag: &str, name: &str) -> String {
    match classify(type_tag) {
        CKind::Pointer => format!("(unsigned long)(uintptr_t){}", name),
        CKind::Floating => format!("(unsigned long)(long){}", name),
        CKind::Integer => format!("(unsigned long){}", name),
        CKind::Aggregate => format!("(unsigned long)*(const unsigned char *)&{}", name),
    }
}

fn cast(type_tag: &str, expr: String) -> String {
    let t = type_tag.trim();
    if t.is_empty() {
        expr
    } else {
        format!("({}){}", t, expr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initialize,
    Configure,
    Operate,
    Cleanup,
}

impl Phase {
    fn of(api: &ApiSpec, index: usize, cleanup_start: usize) -> Self {
        if index >= cleanup_start || api.frees_any() {
            Phase::Cleanup
        } else if api.produces_any() {
            Phase::Initialize
        } else if api
            .parameters
            .iter()
            .any(|p| p.role.is_consuming() && !p.implicit && p.becomes.is_some())
            || (matches!(api.returns, ReturnSemantics::None)
                && api.parameters.iter().any(|p| p.role.is_consuming()))
        {
            Phase::Configure
        } else {
            Phase::Operate
        }
    }

    fn label(self) -> &'static str {
        match self {
            Phase::Initialize => "Initialize",
            Phase::Configure => "Configure",
            Phase::Operate => "Operate",
            Phase::Cleanup => "Cleanup",
        }
    }
}

/// Locals other than resource handles, keyed by slot.
enum Local {
    Capture { type_tag: String },
    Out { type_tag: String },
    Buffer { len: u32 },
    LenRef { type_tag: String, buffer: u32 },
}

/// Renders sequences of one catalog into C test functions.
pub struct Emitter<'c> {
    catalog: &'c Catalog,
}

impl<'c> Emitter<'c> {
    pub fn new(catalog: &'c Catalog) -> Self {
        Self { catalog }
    }

    /// Renders `sequence` and derives its metadata.
    ///
    /// # Arguments
    /// * `sequence`: A sequence built against this emitter's catalog.
    ///
    /// # Returns
    /// The source text and metadata, or an `EmitError` if the sequence names an
    /// unknown API, binds the wrong number of arguments or refers to an
    /// undeclared resource.
    pub fn emit(&self, sequence: &Sequence) -> Result<Emitted, EmitError> {
        let apis = self.resolve(sequence)?;
        let quality = self.quality(sequence, &apis);
        let density = density(sequence, &apis);
        let score = round2(quality.distinct_apis as f64 + quality.edges_covered as f64 + density);
        let source = self.render(sequence, &apis, &quality, score)?;

        let mut api_counts = BTreeMap::new();
        for call in &sequence.calls {
            *api_counts.entry(call.api.clone()).or_insert(0) += 1;
        }
        let mut classes: BTreeSet<String> =
            sequence.resources.iter().map(|r| r.class.clone()).collect();
        for api in &apis {
            classes.extend(api.parameters.iter().filter_map(|p| p.role.class().map(str::to_string)));
        }

        let metadata = SequenceMetadata {
            id: sequence.id,
            library: sequence.library.clone(),
            seed: sequence.seed,
            length: sequence.len(),
            apis: api_counts,
            classes,
            triples: sequence.api_triples(),
            density,
            score,
            quality,
            digest: format!("{:x}", md5::compute(source.as_bytes())),
            termination: sequence.termination,
        };
        Ok(Emitted { source, metadata })
    }

    fn resolve(&self, sequence: &Sequence) -> Result<Vec<&'c ApiSpec>, EmitError> {
        sequence
            .calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                let api = self.catalog.lookup_api(&call.api)?;
                if call.bindings.len() != api.parameters.len() {
                    return Err(EmitError::ArityMismatch {
                        call: index,
                        api: api.name.clone(),
                        expected: api.parameters.len(),
                        actual: call.bindings.len(),
                    });
                }
                Ok(api)
            })
            .collect()
    }

    fn quality(&self, sequence: &Sequence, apis: &[&'c ApiSpec]) -> Quality {
        let mut tracker = Tracker::new(self.catalog);
        let mut covered: BTreeSet<(String, String, String)> = BTreeSet::new();
        for (call, api) in sequence.calls.iter().zip(apis) {
            for (param, binding) in api.parameters.iter().zip(&call.bindings) {
                let (Some(class), Some(to), Binding::Resource { id }) =
                    (param.role.class(), param.becomes.as_deref(), binding)
                else {
                    continue;
                };
                if let Some(record) = tracker.state().resource(*id).filter(|_| param.role.is_consuming()) {
                    covered.insert((class.to_string(), record.state.clone(), to.to_string()));
                }
            }
            let _ = tracker.apply(api, call);
            for id in &call.produces {
                if let Some(record) = tracker.state().resource(*id) {
                    covered.insert((
                        record.class.clone(),
                        UNINITIALIZED.to_string(),
                        record.state.clone(),
                    ));
                }
            }
        }

        let total: BTreeSet<(&str, &str, &str)> = self
            .catalog
            .classes()
            .flat_map(|c| {
                c.transitions
                    .iter()
                    .map(move |t| (c.name.as_str(), t.from.as_str(), t.to.as_str()))
            })
            .collect();
        let distinct: BTreeSet<&str> = sequence.calls.iter().map(|c| c.api.as_str()).collect();
        let captured_values = sequence
            .calls
            .iter()
            .map(|c| {
                c.capture.iter().count()
                    + c.bindings.iter().filter(|b| matches!(b, Binding::Out { .. })).count()
            })
            .sum();

        Quality {
            distinct_apis: distinct.len(),
            edges_covered: covered.len(),
            edge_coverage: if total.is_empty() {
                0.0
            } else {
                round2(covered.len() as f64 / total.len() as f64)
            },
            captured_values,
            negative_calls: sequence.calls.iter().filter(|c| c.negative).count(),
        }
    }

    fn names(&self, sequence: &Sequence) -> Result<HashMap<ResourceId, String>, EmitError> {
        let mut counters: HashMap<String, usize> = HashMap::new();
        let mut names = HashMap::new();
        for decl in &sequence.resources {
            let class = self.catalog.lookup_class(&decl.class)?;
            if class.storage == Storage::Context {
                continue;
            }
            let mut prefix = class.var_prefix.clone();
            if RESERVED_PREFIXES.contains(&prefix.as_str()) {
                prefix.push('r');
            }
            let n = counters.entry(prefix.clone()).or_insert(0);
            names.insert(decl.id, format!("{}{}", prefix, n));
            *n += 1;
        }
        Ok(names)
    }

    fn render(
        &self,
        sequence: &Sequence,
        apis: &[&'c ApiSpec],
        quality: &Quality,
        score: f64,
    ) -> Result<String, EmitError> {
        let names = self.names(sequence)?;
        let mut lines: Vec<String> = Vec::new();

        let prompt = serde_json::to_string(&sequence.distinct_apis())
            .map_err(|e| EmitError::Serialization(e.to_string()))?;
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for call in &sequence.calls {
            *counts.entry(call.api.as_str()).or_insert(0) += 1;
        }
        let combination: Vec<String> = counts.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
        let quality_json =
            serde_json::to_string(quality).map_err(|e| EmitError::Serialization(e.to_string()))?;
        lines.push(format!("// <ID> {}", sequence.id));
        lines.push(format!("// <Prompt> {}", prompt));
        lines.push(format!("// <Combination> {}", combination.join(", ")));
        lines.push(format!("// <score> {:.2}", score));
        lines.push(format!("// <Quality> {}", quality_json));
        for header in &self.catalog.headers {
            lines.push(format!("#include <{}>", header));
        }
        lines.push("#include <stdint.h>".to_string());
        lines.push("#include <string.h>".to_string());
        lines.push(String::new());
        lines.push(format!("int test_{}_api_sequence() {{", c_identifier(&sequence.library)));

        let mut body: Vec<String> = Vec::new();
        for decl in &sequence.resources {
            let Some(name) = names.get(&decl.id) else {
                continue;
            };
            let class = self.catalog.lookup_class(&decl.class)?;
            match class.storage {
                Storage::Value => {
                    body.push(format!("{};", join_decl(&class.c_type, name)));
                    body.push(format!("memset(&{0}, 0, sizeof({0}));", name));
                }
                _ => body.push(format!("{} = NULL;", join_decl(&class.c_type, name))),
            }
        }

        let locals = self.locals(sequence, apis);
        for (slot, local) in &locals {
            match local {
                Local::Capture { type_tag } => declare(&mut body, type_tag, &format!("v{}", slot)),
                Local::Out { type_tag } => {
                    declare(&mut body, strip_pointer(type_tag), &format!("o{}", slot))
                }
                Local::Buffer { len } => {
                    body.push(format!("unsigned char buf{}[{}];", slot, len));
                    body.push(format!("memset(buf{0}, 'A', sizeof(buf{0}));", slot));
                }
                Local::LenRef { type_tag, buffer } => {
                    let t = strip_pointer(type_tag);
                    body.push(format!(
                        "{} = ({})sizeof(buf{});",
                        join_decl(t, &format!("len{}", slot)),
                        t,
                        buffer
                    ));
                }
            }
        }
        body.push("unsigned long checksum = 0;".to_string());

        let mut tracker = Tracker::new(self.catalog);
        let mut phase: Option<Phase> = None;
        let mut step = 0;
        for (index, (call, api)) in sequence.calls.iter().zip(apis).enumerate() {
            let current = Phase::of(api, index, sequence.cleanup_start);
            if phase != Some(current) {
                step += 1;
                body.push(String::new());
                body.push(format!("// step {}: {}", step, current.label()));
                phase = Some(current);
            }
            body.push(self.render_call(index, call, api, &names)?);

            let live_before: Vec<ResourceId> =
                tracker.live_resources().iter().map(|r| r.id).collect();
            let _ = tracker.apply(api, call);
            for id in live_before {
                let freed = tracker.state().resource(id).is_some_and(|r| r.is_freed());
                let pointer = tracker
                    .state()
                    .resource(id)
                    .and_then(|r| self.catalog.lookup_class(&r.class).ok())
                    .is_some_and(|c| c.storage == Storage::Pointer);
                if let (true, true, Some(name)) = (freed, pointer, names.get(&id)) {
                    body.push(format!("{} = NULL;", name));
                }
            }
        }

        body.push(String::new());
        if sequence.termination == Termination::Leaked {
            body.push("// resources intentionally left alive".to_string());
        }
        for (slot, local) in &locals {
            match local {
                Local::Capture { type_tag } => body.push(format!(
                    "checksum ^= {};",
                    checksum_term(type_tag, &format!("v{}", slot))
                )),
                Local::Out { type_tag } => body.push(format!(
                    "checksum ^= {};",
                    checksum_term(strip_pointer(type_tag), &format!("o{}", slot))
                )),
                _ => {}
            }
        }
        body.push("(void)checksum;".to_string());
        body.push("// API sequence test completed successfully".to_string());
        body.push(format!("return {};", SENTINEL));

        for line in body {
            if line.is_empty() {
                lines.push(line);
            } else {
                lines.push(format!("    {}", line));
            }
        }
        lines.push("}".to_string());
        let mut source = lines.join("\n");
        source.push('\n');
        Ok(source)
    }

    fn locals(&self, sequence: &Sequence, apis: &[&'c ApiSpec]) -> BTreeMap<u32, Local> {
        let mut locals = BTreeMap::new();
        for (call, api) in sequence.calls.iter().zip(apis) {
            for (param, binding) in api.parameters.iter().zip(&call.bindings) {
                match binding {
                    Binding::Buffer { slot, len } => {
                        locals.insert(*slot, Local::Buffer { len: *len });
                    }
                    Binding::LenRef { slot, buffer } => {
                        locals.insert(
                            *slot,
                            Local::LenRef {
                                type_tag: param.type_tag.clone(),
                                buffer: *buffer,
                            },
                        );
                    }
                    Binding::Out { slot } => {
                        locals.insert(
                            *slot,
                            Local::Out {
                                type_tag: param.type_tag.clone(),
                            },
                        );
                    }
                    _ => {}
                }
            }
            if let (Some(slot), Some(type_tag)) = (call.capture, api.returns.captured_type()) {
                locals.insert(
                    slot,
                    Local::Capture {
                        type_tag: type_tag.to_string(),
                    },
                );
            }
        }
        locals
    }

    fn render_call(
        &self,
        index: usize,
        call: &CallSite,
        api: &ApiSpec,
        names: &HashMap<ResourceId, String>,
    ) -> Result<String, EmitError> {
        let mut args = Vec::with_capacity(api.parameters.len());
        for (idx, (param, binding)) in api.parameters.iter().zip(&call.bindings).enumerate() {
            if param.implicit {
                continue;
            }
            let arg = match binding {
                Binding::Resource { id } | Binding::Stale { id } => {
                    let name = self.resource_name(index, api, idx, *id, names)?;
                    let class = param
                        .role
                        .class()
                        .map(|c| self.catalog.lookup_class(c))
                        .transpose()?;
                    let by_address = matches!(param.role, ParamRole::ResourceOut(_))
                        || param.by_ref
                        || class.is_some_and(|c| c.storage == Storage::Value);
                    if by_address {
                        format!("&{}", name)
                    } else {
                        name.to_string()
                    }
                }
                Binding::Null => "NULL".to_string(),
                Binding::Literal { text } => text.clone(),
                Binding::Buffer { slot, .. } => cast(&param.type_tag, format!("buf{}", slot)),
                Binding::BufferLen { slot } => {
                    cast(&param.type_tag, format!("sizeof(buf{})", slot))
                }
                Binding::LenRef { slot, .. } => format!("&len{}", slot),
                Binding::Out { slot } => format!("&o{}", slot),
            };
            args.push(arg);
        }
        let invocation = format!("{}({})", api.symbol, args.join(", "));

        let lhs = match &api.returns {
            ReturnSemantics::NewResource { .. } => match call.produces.last() {
                Some(id) => names.get(id).cloned(),
                None => None,
            },
            _ => call.capture.map(|slot| format!("v{}", slot)),
        };
        let mut statement = match lhs {
            Some(lhs) => format!("{} = {};", lhs, invocation),
            None => format!("{};", invocation),
        };
        if call.negative {
            statement.push_str(" // negative case");
        }
        Ok(statement)
    }

    fn resource_name<'n>(
        &self,
        index: usize,
        api: &ApiSpec,
        param: usize,
        id: ResourceId,
        names: &'n HashMap<ResourceId, String>,
    ) -> Result<&'n str, EmitError> {
        if let Some(name) = names.get(&id) {
            return Ok(name);
        }
        let class = api.parameters[param].role.class().unwrap_or_default();
        let context = self
            .catalog
            .lookup_class(class)
            .is_ok_and(|c| c.storage == Storage::Context);
        if context {
            Err(EmitError::Unrenderable {
                call: index,
                api: api.name.clone(),
                param,
                reason: format!("context class `{}` has no variable", class),
            })
        } else {
            Err(EmitError::UndeclaredResource {
                call: index,
                api: api.name.clone(),
                resource: id,
            })
        }
    }
}

fn density(sequence: &Sequence, apis: &[&ApiSpec]) -> f64 {
    if sequence.is_empty() {
        return 0.0;
    }
    let linked = sequence
        .calls
        .iter()
        .zip(apis)
        .filter(|(call, api)| {
            api.parameters
                .iter()
                .zip(&call.bindings)
                .any(|(p, b)| p.role.is_consuming() && !p.implicit && b.resource().is_some())
        })
        .count();
    round2(linked as f64 / sequence.len() as f64)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn c_identifier(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
