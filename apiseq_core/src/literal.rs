use crate::catalog::{LiteralKind, Parameter};
use crate::sequence::Binding;
use rand::Rng;
use rand::seq::IndexedRandom;

/// Strings drawn when a `char *` parameter has no pool of its own.
const DEFAULT_STRING_POOL: [&str; 6] = ["alpha", "key", "value", "{\"a\":1}", "test", ""];
/// Doubles drawn for floating point parameters.
const DEFAULT_DOUBLES: [f64; 6] = [0.0, 1.0, 2.5, -1.5, 100.25, 0.5];

/// Per-call scratch state shared by the arguments of one call.
///
/// Length-style literals (`buffer-len`, `strlen`) refer back to the most
/// recent buffer or string argument of the same call.
#[derive(Debug, Clone)]
pub struct ArgContext {
    next_slot: u32,
    last_buffer: Option<u32>,
    last_string: Option<String>,
}

impl ArgContext {
    pub fn new(first_slot: u32) -> Self {
        Self {
            next_slot: first_slot,
            last_buffer: None,
            last_string: None,
        }
    }

    /// Reserves a fresh local slot.
    pub fn alloc_slot(&mut self) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }
}

/// A `LiteralSource` fills in the value arguments of a call.
///
/// # Type Parameters
/// * `R`: The random number generator driving every choice, so that a seeded
///   generator always yields the same arguments.
pub trait LiteralSource<R: Rng + ?Sized> {
    /// Produces a binding for a `ValueIn` parameter.
    ///
    /// # Arguments
    /// * `param`: The parameter being bound; its `literal` kind wins over the
    ///   kind inferred from its C type.
    /// * `ctx`: Scratch state of the call being built.
    /// * `rng`: The random number generator.
    fn value_in(&mut self, param: &Parameter, ctx: &mut ArgContext, rng: &mut R) -> Binding;

    /// Produces a binding for a `ValueOut` parameter.
    fn value_out(&mut self, _param: &Parameter, ctx: &mut ArgContext, _rng: &mut R) -> Binding {
        Binding::Out {
            slot: ctx.alloc_slot(),
        }
    }
}

/// Draws type-appropriate defaults, honoring the catalog's literal hints.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLiterals;

impl DefaultLiterals {
    pub fn new() -> Self {
        DefaultLiterals
    }
}

impl<R: Rng + ?Sized> LiteralSource<R> for DefaultLiterals {
    fn value_in(&mut self, param: &Parameter, ctx: &mut ArgContext, rng: &mut R) -> Binding {
        let kind = param
            .literal
            .clone()
            .unwrap_or_else(|| infer_kind(&param.type_tag));
        let literal = |text: String| Binding::Literal { text };
        match kind {
            LiteralKind::Int { min, max } => {
                let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
                literal(rng.random_range(lo..=hi).to_string())
            }
            LiteralKind::Uint { min, max } => {
                let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
                literal(rng.random_range(lo..=hi).to_string())
            }
            LiteralKind::Double => {
                let v = DEFAULT_DOUBLES.choose(rng).copied().unwrap_or_default();
                literal(format!("{:?}", v))
            }
            LiteralKind::Bool => literal(if rng.random_bool(0.5) { "1" } else { "0" }.to_string()),
            LiteralKind::String { pool } => {
                let chosen = match pool.choose(rng) {
                    Some(s) => s.clone(),
                    None => DEFAULT_STRING_POOL
                        .choose(rng)
                        .copied()
                        .unwrap_or_default()
                        .to_string(),
                };
                let text = c_string_literal(&chosen);
                ctx.last_string = Some(text.clone());
                literal(text)
            }
            LiteralKind::Null => literal("NULL".to_string()),
            LiteralKind::Buffer { len } => {
                let slot = ctx.alloc_slot();
                ctx.last_buffer = Some(slot);
                Binding::Buffer {
                    slot,
                    len: len.max(1) as u32,
                }
            }
            LiteralKind::BufferLen => match ctx.last_buffer {
                Some(slot) => Binding::BufferLen { slot },
                None => literal("0".to_string()),
            },
            LiteralKind::BufferLenRef => match ctx.last_buffer {
                Some(buffer) => Binding::LenRef {
                    slot: ctx.alloc_slot(),
                    buffer,
                },
                None => literal("NULL".to_string()),
            },
            LiteralKind::StrLen => match &ctx.last_string {
                Some(s) => literal(format!("({})strlen({})", param.type_tag.trim(), s)),
                None => literal("0".to_string()),
            },
            LiteralKind::Choice { options } => match options.choose(rng) {
                Some(option) => literal(option.clone()),
                None => literal("0".to_string()),
            },
            LiteralKind::Expr { text } => literal(text),
        }
    }
}

/// Picks a literal kind from a C type when the catalog is silent.
pub fn infer_kind(type_tag: &str) -> LiteralKind {
    let t = type_tag.trim();
    if t.contains('*') {
        if t.contains("char") {
            return LiteralKind::String { pool: Vec::new() };
        }
        return LiteralKind::Null;
    }
    if t.contains("double") || t.contains("float") || t.contains("Float") {
        return LiteralKind::Double;
    }
    if t.contains("bool") || t.contains("Bool") {
        return LiteralKind::Bool;
    }
    if t.contains("unsigned")
        || t.contains("size_t")
        || t.starts_with("uInt")
        || t.starts_with("uLong")
        || t.contains("UInt")
    {
        return LiteralKind::Uint { min: 0, max: 64 };
    }
    if t.contains("void") && !t.contains('*') {
        return LiteralKind::Null;
    }
    LiteralKind::Int { min: 0, max: 16 }
}

/// Quotes `s` as a C string literal.
pub fn c_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_ascii_graphic() || c == ' ' => out.push(c),
            c => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\x{:02x}", b));
                }
            }
        }
    }
    out.push('"');
    out
}
