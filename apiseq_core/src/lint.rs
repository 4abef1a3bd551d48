use crate::catalog::{ApiSpec, Catalog, CatalogError, LiteralKind, ParamRole, ReturnSemantics};
use crate::corpus::{CorpusError, decode_sequence};
use crate::enforcer::{LintOptions, Violation, lint_calls};
use crate::literal::c_string_literal;
use crate::sequence::{Binding, CallSite, ResourceId, Sequence};
use crate::tracker::Tracker;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LintError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed sequence file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("line {line}: `{name}` is not an API of {library}")]
    UnknownCallee {
        line: usize,
        name: String,
        library: String,
    },
}

/// Outcome of linting one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintReport {
    pub calls: Vec<CallSite>,
    /// Source line of each call; empty for structured inputs.
    pub lines: Vec<usize>,
    pub violations: Vec<Violation>,
}

impl LintReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn line_of(&self, violation: &Violation) -> Option<usize> {
        violation
            .call_index()
            .and_then(|idx| self.lines.get(idx).copied())
    }
}

/// Calls recovered from C source, with their line numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSource {
    pub calls: Vec<CallSite>,
    pub lines: Vec<usize>,
}

/// Lints a file, picking the reader from its extension: `.json` sequences,
/// `.seq` corpus records, anything else as C source.
pub fn lint_file(
    catalog: &Catalog,
    path: &Path,
    options: LintOptions,
) -> Result<LintReport, LintError> {
    let io_err = |source| LintError::Io {
        path: path.to_path_buf(),
        source,
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let text = fs::read_to_string(path).map_err(io_err)?;
            let sequence = Sequence::from_json(&text).map_err(|e| LintError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            lint_sequence(catalog, &sequence, options)
        }
        Some("seq") => {
            let bytes = fs::read(path).map_err(io_err)?;
            let sequence = decode_sequence(&bytes).map_err(|e: CorpusError| LintError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            lint_sequence(catalog, &sequence, options)
        }
        _ => {
            let source = fs::read_to_string(path).map_err(io_err)?;
            lint_source(catalog, &source, options)
        }
    }
}

pub fn lint_sequence(
    catalog: &Catalog,
    sequence: &Sequence,
    options: LintOptions,
) -> Result<LintReport, LintError> {
    if sequence.library != catalog.library {
        warn!(
            sequence = %sequence.library,
            catalog = %catalog.library,
            "Sequence was built for another library"
        );
    }
    let violations = lint_calls(catalog, &sequence.calls, options)?;
    Ok(LintReport {
        calls: sequence.calls.clone(),
        lines: Vec::new(),
        violations,
    })
}

pub fn lint_source(
    catalog: &Catalog,
    source: &str,
    options: LintOptions,
) -> Result<LintReport, LintError> {
    let parsed = parse_source(catalog, source)?;
    let violations = lint_calls(catalog, &parsed.calls, options)?;
    Ok(LintReport {
        calls: parsed.calls,
        lines: parsed.lines,
        violations,
    })
}

/// Recovers the API calls of a straight-line C test function.
///
/// Only the body between the first `{` and the last `}` is read. Statements
/// without a catalog call (declarations, `memset`, `name = NULL;`, the
/// checksum) are skipped. A comment mentioning "negative" marks the call it
/// trails, or the call it precedes when it sits on its own line.
pub fn parse_source(catalog: &Catalog, source: &str) -> Result<ParsedSource, LintError> {
    let scan = tokenize(source);
    let statements = split_statements(&scan);
    let mut parser = SourceParser::new(catalog);
    for statement in &statements {
        if let Some(raw) = raw_call(statement) {
            parser.push(raw)?;
        }
    }
    Ok(ParsedSource {
        calls: parser.calls,
        lines: parser.lines,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Ident,
    Number,
    Str,
    Punct,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    text: String,
    line: usize,
}

impl Token {
    fn is(&self, text: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == text
    }

    fn is_word(&self) -> bool {
        matches!(self.kind, TokenKind::Ident | TokenKind::Number)
    }
}

struct Scan {
    tokens: Vec<Token>,
    /// `(token position, line)` of every comment mentioning "negative".
    negative_marks: Vec<(usize, usize)>,
}

const TWO_CHAR_PUNCT: [&str; 18] = [
    "==", "!=", "<=", ">=", "->", "^=", "+=", "-=", "|=", "&=", "*=", "/=", "&&", "||", "<<",
    ">>", "++", "--",
];

fn tokenize(source: &str) -> Scan {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut negative_marks = Vec::new();
    let mut i = 0;
    let mut line = 1;
    let mut line_start = true;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            line_start = true;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if line_start && c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                if chars[i] == '\\' && chars.get(i + 1) == Some(&'\n') {
                    line += 1;
                    i += 1;
                }
                i += 1;
            }
            continue;
        }
        line_start = false;

        if c == '/' && chars.get(i + 1) == Some(&'/') {
            let start = i;
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            if text.contains("negative") {
                negative_marks.push((tokens.len(), line));
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            let start = i;
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            i = (i + 2).min(chars.len());
            let text: String = chars[start..i].iter().collect();
            if text.contains("negative") {
                negative_marks.push((tokens.len(), line));
            }
            continue;
        }
        if c == '"' || c == '\'' {
            let start = i;
            let start_line = line;
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                if chars.get(i) == Some(&'\n') {
                    line += 1;
                }
                i += 1;
            }
            i = (i + 1).min(chars.len());
            tokens.push(Token {
                kind: TokenKind::Str,
                text: chars[start..i].iter().collect(),
                line: start_line,
            });
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' || c.is_ascii_digit() {
            let start = i;
            let kind = if c.is_ascii_digit() {
                TokenKind::Number
            } else {
                TokenKind::Ident
            };
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric()
                    || chars[i] == '_'
                    || (kind == TokenKind::Number && chars[i] == '.'))
            {
                i += 1;
            }
            tokens.push(Token {
                kind,
                text: chars[start..i].iter().collect(),
                line,
            });
            continue;
        }

        let pair: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let text = if TWO_CHAR_PUNCT.contains(&pair.as_str()) {
            pair
        } else {
            c.to_string()
        };
        i += text.chars().count();
        tokens.push(Token {
            kind: TokenKind::Punct,
            text,
            line,
        });
    }

    Scan {
        tokens,
        negative_marks,
    }
}

struct Statement<'t> {
    tokens: &'t [Token],
    /// Token position one past the statement's end.
    end: usize,
    end_line: usize,
    negative: bool,
}

fn split_statements(scan: &Scan) -> Vec<Statement<'_>> {
    let tokens = &scan.tokens;
    let open = tokens.iter().position(|t| t.is("{"));
    let close = tokens.iter().rposition(|t| t.is("}"));
    let (body_start, body_end) = match (open, close) {
        (Some(o), Some(c)) if o < c => (o + 1, c),
        _ => (0, tokens.len()),
    };

    let mut statements: Vec<Statement<'_>> = Vec::new();
    let mut start = body_start;
    let mut depth = 0i32;
    for idx in body_start..body_end {
        let token = &tokens[idx];
        if token.is("(") || token.is("[") {
            depth += 1;
        } else if token.is(")") || token.is("]") {
            depth -= 1;
        }
        let boundary = depth <= 0 && (token.is(";") || token.is("{") || token.is("}"));
        if boundary {
            if idx > start {
                statements.push(Statement {
                    tokens: &tokens[start..idx],
                    end: idx + 1,
                    end_line: token.line,
                    negative: false,
                });
            }
            start = idx + 1;
            depth = 0;
        }
    }
    if body_end > start {
        statements.push(Statement {
            tokens: &tokens[start..body_end],
            end: body_end,
            end_line: tokens[body_end - 1].line,
            negative: false,
        });
    }

    for &(pos, line) in &scan.negative_marks {
        if pos < body_start || pos > body_end {
            continue;
        }
        let trailing = statements
            .iter()
            .rposition(|s| s.end <= pos)
            .filter(|&k| statements[k].end_line == line);
        let target = trailing.or_else(|| statements.iter().position(|s| s.end > pos));
        if let Some(k) = target {
            statements[k].negative = true;
        }
    }
    statements
}

const C_KEYWORDS: [&str; 28] = [
    "if", "else", "while", "for", "do", "switch", "case", "default", "return", "goto", "break",
    "continue", "typedef", "struct", "union", "enum", "const", "volatile", "static", "unsigned",
    "signed", "int", "char", "long", "short", "void", "float", "double",
];

/// Library-independent calls that never count as API calls.
const HELPERS: [&str; 15] = [
    "memset", "memcpy", "memcmp", "strlen", "strcmp", "strncmp", "sizeof", "printf", "fprintf",
    "snprintf", "puts", "malloc", "calloc", "free", "abs",
];

struct RawCall<'t> {
    callee: &'t str,
    lhs: Option<&'t str>,
    args: Vec<&'t [Token]>,
    line: usize,
    negative: bool,
}

fn raw_call<'t>(statement: &Statement<'t>) -> Option<RawCall<'t>> {
    let toks = statement.tokens;
    let at = (0..toks.len().saturating_sub(1)).find(|&i| {
        toks[i].kind == TokenKind::Ident
            && toks[i + 1].is("(")
            && !C_KEYWORDS.contains(&toks[i].text.as_str())
    })?;
    let callee = toks[at].text.as_str();
    if HELPERS.contains(&callee) {
        return None;
    }

    let lhs = toks[..at].iter().rposition(|t| t.is("=")).and_then(|eq| {
        toks[..eq]
            .iter()
            .rev()
            .find(|t| t.kind == TokenKind::Ident)
            .map(|t| t.text.as_str())
    });

    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut arg_start = at + 2;
    let mut idx = at + 2;
    while idx < toks.len() {
        let t = &toks[idx];
        if t.is("(") || t.is("[") || t.is("{") {
            depth += 1;
        } else if t.is(")") || t.is("]") || t.is("}") {
            if depth == 0 {
                if idx > arg_start || !args.is_empty() {
                    args.push(&toks[arg_start..idx]);
                }
                break;
            }
            depth -= 1;
        } else if t.is(",") && depth == 0 {
            args.push(&toks[arg_start..idx]);
            arg_start = idx + 1;
        }
        idx += 1;
    }

    Some(RawCall {
        callee,
        lhs,
        args,
        line: toks[at].line,
        negative: statement.negative,
    })
}

fn arg_text(arg: &[Token]) -> String {
    let mut out = String::new();
    for (i, t) in arg.iter().enumerate() {
        if i > 0 && arg[i - 1].is_word() && t.is_word() {
            out.push(' ');
        }
        out.push_str(&t.text);
    }
    out
}

fn normalize(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

enum Operand<'t> {
    Null,
    Var(&'t str),
    Other,
}

/// Reads a resource argument, looking through casts and `&`.
fn resource_operand(arg: &[Token]) -> Operand<'_> {
    let mut rest = arg;
    while rest.first().is_some_and(|t| t.is("(")) {
        let Some(close) = rest.iter().position(|t| t.is(")")) else {
            break;
        };
        let is_cast = close + 1 < rest.len()
            && rest[1..close]
                .iter()
                .all(|t| t.kind == TokenKind::Ident || t.is("*"));
        if !is_cast {
            break;
        }
        rest = &rest[close + 1..];
    }
    if rest.first().is_some_and(|t| t.is("&")) {
        rest = &rest[1..];
    }
    match rest {
        [t] if t.text == "NULL" || t.text == "0" || t.text == "nullptr" => Operand::Null,
        [t] if t.kind == TokenKind::Ident => Operand::Var(&t.text),
        _ => Operand::Other,
    }
}

struct SourceParser<'c> {
    catalog: &'c Catalog,
    tracker: Tracker<'c>,
    vars: HashMap<String, ResourceId>,
    next_id: u32,
    next_slot: u32,
    calls: Vec<CallSite>,
    lines: Vec<usize>,
}

impl<'c> SourceParser<'c> {
    fn new(catalog: &'c Catalog) -> Self {
        Self {
            catalog,
            tracker: Tracker::new(catalog),
            vars: HashMap::new(),
            next_id: 0,
            next_slot: 0,
            calls: Vec::new(),
            lines: Vec::new(),
        }
    }

    fn fresh(&mut self) -> ResourceId {
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Picks the catalog entry a call of `raw.callee` most plausibly is; `false` if no
    /// entry of that symbol takes this many arguments.
    fn choose(&self, raw: &RawCall<'_>) -> Result<(&'c ApiSpec, bool), LintError> {
        let candidates = self.catalog.apis_by_symbol(raw.callee);
        let Some(&first) = candidates.first() else {
            return Err(LintError::UnknownCallee {
                line: raw.line,
                name: raw.callee.to_string(),
                library: self.catalog.library.clone(),
            });
        };
        let mut best: Option<(&'c ApiSpec, i32)> = None;
        for &api in candidates
            .iter()
            .filter(|a| a.explicit_arity() == raw.args.len())
        {
            let score = self.affinity(api, raw);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((api, score));
            }
        }
        Ok(match best {
            Some((api, _)) => (api, true),
            None => (first, false),
        })
    }

    fn affinity(&self, api: &ApiSpec, raw: &RawCall<'_>) -> i32 {
        let explicit = api.parameters.iter().filter(|p| !p.implicit);
        let mut score = 0;
        for (param, arg) in explicit.zip(&raw.args) {
            if let Some(class) = param.role.class() {
                if !param.role.is_consuming() {
                    continue;
                }
                if let Operand::Var(name) = resource_operand(arg) {
                    let record = self
                        .vars
                        .get(name)
                        .and_then(|id| self.tracker.state().resource(*id));
                    if let Some(record) = record {
                        score += if record.class == class { 2 } else { -4 };
                    }
                }
                continue;
            }
            let text = normalize(&arg_text(arg));
            let hit = match &param.literal {
                Some(LiteralKind::Choice { options }) => {
                    options.iter().any(|o| normalize(o) == text)
                }
                Some(LiteralKind::Expr { text: expr }) => normalize(expr) == text,
                Some(LiteralKind::String { pool }) => pool
                    .iter()
                    .any(|s| normalize(&c_string_literal(s)) == text),
                _ => false,
            };
            if hit {
                score += 1;
            }
        }
        score
    }

    fn push(&mut self, raw: RawCall<'_>) -> Result<(), LintError> {
        let (api, arity_ok) = self.choose(&raw)?;
        let mut call = CallSite::new(api.name.clone());
        call.negative = raw.negative;

        if !arity_ok {
            debug!(line = raw.line, api = %api.name, args = raw.args.len(), "Arity mismatch");
            call.bindings = raw
                .args
                .iter()
                .map(|a| Binding::Literal { text: arg_text(a) })
                .collect();
            let _ = self.tracker.apply(api, &call);
            self.calls.push(call);
            self.lines.push(raw.line);
            return Ok(());
        }

        let mut assigned: Vec<(&str, ResourceId)> = Vec::new();
        let mut args = raw.args.iter();
        for param in &api.parameters {
            let binding = if param.implicit {
                self.implicit_binding(&param.role, &mut call)
            } else {
                let Some(arg) = args.next() else { break };
                match &param.role {
                    ParamRole::ResourceOut(_) => match resource_operand(arg) {
                        Operand::Null => Binding::Null,
                        operand => {
                            let id = self.fresh();
                            call.produces.push(id);
                            if let Operand::Var(name) = operand {
                                assigned.push((name, id));
                            }
                            Binding::Resource { id }
                        }
                    },
                    ParamRole::ResourceIn(_) | ParamRole::ResourceInOut(_) => {
                        match resource_operand(arg) {
                            Operand::Null => Binding::Null,
                            Operand::Var(name) => match self.vars.get(name).copied() {
                                Some(id) => {
                                    let freed = self
                                        .tracker
                                        .state()
                                        .resource(id)
                                        .is_some_and(|r| r.is_freed());
                                    if freed && call.negative {
                                        Binding::Stale { id }
                                    } else {
                                        Binding::Resource { id }
                                    }
                                }
                                None => Binding::Resource { id: self.fresh() },
                            },
                            Operand::Other => Binding::Resource { id: self.fresh() },
                        }
                    }
                    ParamRole::ValueIn | ParamRole::ValueOut => Binding::Literal {
                        text: arg_text(arg),
                    },
                }
            };
            call.bindings.push(binding);
        }

        match &api.returns {
            ReturnSemantics::NewResource { .. } => {
                let id = self.fresh();
                call.produces.push(id);
                if let Some(lhs) = raw.lhs {
                    assigned.push((lhs, id));
                }
            }
            ReturnSemantics::None => {}
            ReturnSemantics::StatusCode { .. } | ReturnSemantics::Value { .. } => {
                if raw.lhs.is_some() {
                    call.capture = Some(self.next_slot);
                    self.next_slot += 1;
                }
            }
        }

        let _ = self.tracker.apply(api, &call);
        for (name, id) in assigned {
            self.vars.insert(name.to_string(), id);
        }
        self.calls.push(call);
        self.lines.push(raw.line);
        Ok(())
    }

    fn implicit_binding(&mut self, role: &ParamRole, call: &mut CallSite) -> Binding {
        match role {
            ParamRole::ResourceOut(_) => {
                let id = self.fresh();
                call.produces.push(id);
                Binding::Resource { id }
            }
            ParamRole::ResourceIn(class) | ParamRole::ResourceInOut(class) => {
                let id = match self.tracker.state().live_global(class) {
                    Some(id) => id,
                    None => self.fresh(),
                };
                Binding::Resource { id }
            }
            ParamRole::ValueIn | ParamRole::ValueOut => Binding::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_catalogs::{TREE, WIDGET};

    fn widget() -> Catalog {
        Catalog::load_from_str(WIDGET).unwrap()
    }

    #[test]
    fn straight_line_source_is_parsed_into_calls() {
        let src = r#"
#include <widget.h>
// <Quality> {"negative_calls":0}
int test_widget_api_sequence() {
    widget_t *widget0 = NULL;
    unsigned long checksum = 0;

    // step 1: Initialize
    widget0 = widget_create();
    /* widget_free(widget0); */
    printf("widget_free(widget0);\n");

    // step 2: Cleanup
    widget_free(widget0);
    widget0 = NULL;
    (void)checksum;
    return 66;
}
"#;
        let parsed = parse_source(&widget(), src).unwrap();
        assert_eq!(parsed.calls.len(), 2, "calls: {:?}", parsed.calls);
        assert_eq!(parsed.calls[0].api, "widget_create");
        assert_eq!(parsed.calls[0].produces, vec![ResourceId(0)]);
        assert_eq!(parsed.calls[1].bindings, vec![Binding::Resource { id: ResourceId(0) }]);
        assert_eq!(parsed.lines, vec![9, 14]);
        assert!(parsed.calls.iter().all(|c| !c.negative));

        let report = lint_source(&widget(), src, LintOptions { no_leak: true }).unwrap();
        assert!(report.is_clean(), "violations: {:?}", report.violations);
    }

    #[test]
    fn freeing_an_adopted_child_reports_one_ownership_conflict() {
        let catalog = Catalog::load_from_str(TREE).unwrap();
        let src = r#"
int test_tree_api_sequence() {
    node_t *node0 = NULL;
    node_t *node1 = NULL;
    node0 = node_new();
    node1 = node_new();
    node_add_child(node0, node1);
    node_delete(node1);
    node_delete(node0);
    return 66;
}
"#;
        let report = lint_source(&catalog, src, LintOptions { no_leak: true }).unwrap();
        assert_eq!(report.violations.len(), 1, "violations: {:?}", report.violations);
        assert!(matches!(
            report.violations[0],
            Violation::OwnershipConflict { call: 3, resource: ResourceId(1), .. }
        ));
        assert_eq!(report.line_of(&report.violations[0]), Some(8));
    }

    #[test]
    fn deleting_a_context_under_a_live_profile_is_reported() {
        let catalog = crate::catalog::builtin("lcms2").unwrap();
        let src = r#"
ctx0 = cmsCreateContext(NULL, NULL);
profile0 = cmsCreate_sRGBProfileTHR(ctx0);
cmsDeleteContext(ctx0);
v0 = cmsGetColorSpace(profile0);
cmsCloseProfile(profile0);
"#;
        let report = lint_source(&catalog, src, LintOptions { no_leak: true }).unwrap();
        assert!(
            matches!(
                report.violations.as_slice(),
                [
                    Violation::OwnershipConflict { call: 2, resource: ResourceId(1), .. },
                    Violation::UseAfterFree { call: 3, resource: ResourceId(0), .. },
                    Violation::UseAfterFree { call: 4, resource: ResourceId(0), .. },
                ]
            ),
            "violations: {:?}",
            report.violations
        );
        assert_eq!(report.line_of(&report.violations[0]), Some(4));
    }

    #[test]
    fn second_create_leaks_only_in_no_leak_mode() {
        let src = "widget0 = widget_create();\nwidget1 = widget_create();\nwidget_free(widget0);\n";
        let relaxed = lint_source(&widget(), src, LintOptions::default()).unwrap();
        assert!(relaxed.is_clean(), "violations: {:?}", relaxed.violations);

        let strict = lint_source(&widget(), src, LintOptions { no_leak: true }).unwrap();
        assert_eq!(strict.violations.len(), 1);
        assert!(matches!(
            strict.violations[0],
            Violation::Leak { resource: ResourceId(1), .. }
        ));
    }

    #[test]
    fn negative_marker_binds_freed_handle_as_stale() {
        let src = "widget0 = widget_create();\nwidget_free(widget0);\nwidget_free(widget0); // negative case\n";
        let report = lint_source(&widget(), src, LintOptions::default()).unwrap();
        assert!(!report.calls[1].negative);
        assert!(report.calls[2].negative);
        assert_eq!(report.calls[2].bindings, vec![Binding::Stale { id: ResourceId(0) }]);
        // widget_free is not nullable, so even a marked negative case is a double free.
        assert!(matches!(
            report.violations.as_slice(),
            [Violation::DoubleFree { call: 2, .. }]
        ));
    }

    #[test]
    fn missing_arguments_are_an_arity_mismatch() {
        let src = "widget0 = widget_create();\nwidget_free();\nwidget_free(widget0);\n";
        let report = lint_source(&widget(), src, LintOptions::default()).unwrap();
        assert!(matches!(
            report.violations.as_slice(),
            [Violation::ArityMismatch { call: 1, expected: 1, actual: 0, .. }]
        ));
    }

    #[test]
    fn unknown_variables_and_unknown_functions() {
        let report = lint_source(&widget(), "widget_free(ghost);", LintOptions::default()).unwrap();
        assert!(matches!(
            report.violations.as_slice(),
            [Violation::DanglingParameter { call: 0, .. }]
        ));

        let err = lint_source(&widget(), "widget0 = widget_make();", LintOptions::default())
            .unwrap_err();
        assert!(matches!(err, LintError::UnknownCallee { line: 1, ref name, .. } if name == "widget_make"));
    }

    #[test]
    fn shared_symbols_resolve_by_literal_and_class() {
        let catalog = crate::catalog::builtin("zlib").unwrap();
        let src = r#"
gz0 = gzopen("/tmp/apiseq_zlib.gz", "rb");
v0 = gzeof(gz0);
gzclose(gz0);
"#;
        let parsed = parse_source(&catalog, src).unwrap();
        assert_eq!(parsed.calls[0].api, "gzopen_read");
        assert_eq!(parsed.calls[1].capture, Some(0));

        let png = crate::catalog::builtin("libpng").unwrap();
        let src = r#"
png_write0 = png_create_write_struct(PNG_LIBPNG_VER_STRING, NULL, NULL, NULL);
info0 = png_create_info_struct(png_write0);
png_destroy_info_struct(png_write0, &info0);
"#;
        let parsed = parse_source(&png, src).unwrap();
        assert_eq!(parsed.calls[1].api, "png_create_info_struct_write");
        assert_eq!(parsed.calls[2].api, "png_destroy_info_struct_write");
    }

    #[test]
    fn json_and_corpus_records_are_linted_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = widget();
        let mut create = CallSite::new("widget_create");
        create.produces = vec![ResourceId(0)];
        let sequence = Sequence {
            id: 0,
            library: "widget".to_string(),
            seed: 0,
            calls: vec![create],
            resources: vec![crate::sequence::ResourceDecl {
                id: ResourceId(0),
                class: "Widget".to_string(),
            }],
            cleanup_start: 1,
            termination: crate::sequence::Termination::Leaked,
        };

        let json = dir.path().join("0.json");
        fs::write(&json, sequence.to_json().unwrap()).unwrap();
        let report = lint_file(&catalog, &json, LintOptions { no_leak: true }).unwrap();
        assert_eq!(report.violations.len(), 1);

        let seq = dir.path().join("0.seq");
        fs::write(&seq, crate::corpus::encode_sequence(&sequence).unwrap()).unwrap();
        let report = lint_file(&catalog, &seq, LintOptions::default()).unwrap();
        assert!(report.is_clean());

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{").unwrap();
        assert!(matches!(
            lint_file(&catalog, &broken, LintOptions::default()),
            Err(LintError::Parse { .. })
        ));
    }
}
