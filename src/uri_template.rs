//! RFC 6570 URI template matching, expansion, and overlap detection.
//!
//! Resource references may carry either a concrete URI or a template such as
//! `file:///{+path}`. The group model uses these operations for conflict
//! reporting at startup and the frontend router uses them to find which refs
//! can serve a concrete URI at request time.

use std::collections::HashMap;
use std::fmt::Write as _;

/// Operator prefix of a template expression.
///
/// Covers the RFC 6570 operators that appear in MCP resource templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    /// `{var}` - simple string expansion, comma-joined.
    Simple,
    /// `{+var}` - reserved expansion, `/` and friends pass through.
    Reserved,
    /// `{#var}` - fragment expansion.
    Fragment,
    /// `{.var}` - label expansion with dot prefix.
    Label,
    /// `{/var}` - path segment expansion.
    PathSegment,
    /// `{;var}` - path-style parameters.
    PathParam,
    /// `{?var}` - query component.
    Query,
    /// `{&var}` - query continuation.
    QueryContinuation,
}

impl Operator {
    fn from_prefix(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Reserved),
            '#' => Some(Self::Fragment),
            '.' => Some(Self::Label),
            '/' => Some(Self::PathSegment),
            ';' => Some(Self::PathParam),
            '?' => Some(Self::Query),
            '&' => Some(Self::QueryContinuation),
            _ => None,
        }
    }
}

/// One parsed piece of a template: literal text or a `{...}` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Expression {
        operator: Operator,
        /// Variable names with modifiers (`*`, `:n`) stripped.
        vars: Vec<String>,
        /// Inner text as written, operator prefix removed.
        raw: String,
    },
}

/// Strip RFC 6570 value modifiers (`*` explode, `:n` prefix) from a name.
fn strip_modifiers(name: &str) -> String {
    let name = name.strip_suffix('*').unwrap_or(name);
    name.split_once(':')
        .map_or_else(|| name.to_string(), |(base, _)| base.to_string())
}

/// Parse a template into literal and expression parts.
///
/// Malformed input (unclosed brace, empty `{}`) is treated as literal text so
/// that a non-template string round-trips unchanged.
fn parse(template: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let (before, after_open) = rest.split_at(open);
        literal.push_str(before);
        let Some(close) = after_open.find('}') else {
            // Unclosed brace: the remainder is literal.
            literal.push_str(after_open);
            rest = "";
            break;
        };
        let inner = &after_open[1..close];
        if inner.is_empty() || inner.contains('{') {
            literal.push_str(&after_open[..=close]);
            rest = &after_open[close + 1..];
            continue;
        }

        let (operator, body) = inner
            .chars()
            .next()
            .and_then(Operator::from_prefix)
            .map_or((Operator::Simple, inner), |op| (op, &inner[1..]));

        if body.is_empty() {
            literal.push_str(&after_open[..=close]);
            rest = &after_open[close + 1..];
            continue;
        }

        if !literal.is_empty() {
            parts.push(Part::Literal(std::mem::take(&mut literal)));
        }
        parts.push(Part::Expression {
            operator,
            vars: body.split(',').map(strip_modifiers).collect(),
            raw: body.to_string(),
        });
        rest = &after_open[close + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }
    parts
}

/// Returns true iff `s` contains at least one well-formed `{...}` expression.
///
/// Empty braces are not a template.
pub fn is_template(s: &str) -> bool {
    parse(s)
        .iter()
        .any(|p| matches!(p, Part::Expression { .. }))
}

/// Variable names of a template, in order of appearance.
///
/// Operator prefixes are stripped. Grouped expressions like `{?a,b}` yield a
/// single entry with the raw comma-joined inner (`"a,b"`).
pub fn variables(template: &str) -> Vec<String> {
    parse(template)
        .iter()
        .filter_map(|p| match p {
            Part::Literal(_) => None,
            Part::Expression { vars, raw, .. } => {
                if vars.len() == 1 {
                    Some(vars[0].clone())
                } else {
                    Some(raw.clone())
                }
            }
        })
        .collect()
}

/// Match a concrete URI against a template, extracting variable values.
///
/// If `template` contains no expression this degenerates to string equality
/// (with an empty variable map). The last path-segment variable may capture
/// remaining segments greedily; an empty capture is a valid match.
pub fn match_uri(uri: &str, template: &str) -> Option<HashMap<String, String>> {
    let parts = parse(template);
    if !parts.iter().any(|p| matches!(p, Part::Expression { .. })) {
        return (uri == template).then(HashMap::new);
    }

    let mut captured = HashMap::new();
    let mut pos = 0usize;

    for (index, part) in parts.iter().enumerate() {
        match part {
            Part::Literal(lit) => {
                if !uri[pos..].starts_with(lit.as_str()) {
                    return None;
                }
                pos += lit.len();
            }
            Part::Expression { operator, vars, .. } => {
                // Prefix characters consumed by the operator itself.
                let prefix = match operator {
                    Operator::Simple | Operator::Reserved => None,
                    Operator::Fragment => Some('#'),
                    Operator::Label => Some('.'),
                    Operator::PathSegment => Some('/'),
                    Operator::PathParam => Some(';'),
                    Operator::Query => Some('?'),
                    Operator::QueryContinuation => Some('&'),
                };
                if let Some(p) = prefix {
                    if !uri[pos..].starts_with(p) {
                        // A query/path-param expression may expand to nothing.
                        if matches!(
                            operator,
                            Operator::Query | Operator::QueryContinuation | Operator::PathParam
                        ) {
                            for var in vars {
                                captured.insert(var.clone(), String::new());
                            }
                            continue;
                        }
                        return None;
                    }
                    pos += p.len_utf8();
                }

                // The capture runs until the next literal part (or the end).
                let end = match parts.get(index + 1) {
                    Some(Part::Literal(next)) => pos + uri[pos..].find(next.as_str())?,
                    _ => uri.len(),
                };
                let capture = &uri[pos..end];
                pos = end;

                match operator {
                    Operator::Query | Operator::QueryContinuation | Operator::PathParam => {
                        let pair_sep = if *operator == Operator::PathParam {
                            ';'
                        } else {
                            '&'
                        };
                        let pairs: HashMap<&str, &str> = capture
                            .split(pair_sep)
                            .filter(|s| !s.is_empty())
                            .map(|pair| {
                                pair.split_once('=').unwrap_or((pair, ""))
                            })
                            .collect();
                        for var in vars {
                            captured.insert(
                                var.clone(),
                                (*pairs.get(var.as_str()).unwrap_or(&"")).to_string(),
                            );
                        }
                    }
                    _ => {
                        // Only a trailing variable may swallow the rest of
                        // the path; reserved and fragment expansions always
                        // cross segment boundaries.
                        let crosses_segments = matches!(
                            operator,
                            Operator::Reserved | Operator::Fragment
                        ) || parts.get(index + 1).is_none();
                        if !crosses_segments && capture.contains('/') {
                            return None;
                        }
                        if vars.len() == 1 {
                            captured.insert(vars[0].clone(), capture.to_string());
                        } else {
                            let sep = match operator {
                                Operator::Label => '.',
                                Operator::PathSegment => '/',
                                _ => ',',
                            };
                            let mut values = capture.split(sep);
                            for var in vars {
                                captured.insert(
                                    var.clone(),
                                    values.next().unwrap_or("").to_string(),
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    (pos == uri.len()).then_some(captured)
}

/// Percent-encode everything outside the unreserved set.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// Expand a template with the given variables. Missing variables expand to
/// the empty string.
pub fn expand(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::new();
    let value_of = |name: &str| vars.get(name).cloned().unwrap_or_default();

    for part in parse(template) {
        match part {
            Part::Literal(lit) => out.push_str(&lit),
            Part::Expression {
                operator,
                vars: names,
                ..
            } => match operator {
                Operator::Simple => {
                    let joined: Vec<String> = names
                        .iter()
                        .map(|n| encode_component(&value_of(n)))
                        .collect();
                    out.push_str(&joined.join(","));
                }
                Operator::Reserved => {
                    let joined: Vec<String> = names.iter().map(|n| value_of(n)).collect();
                    out.push_str(&joined.join(","));
                }
                Operator::Fragment => {
                    out.push('#');
                    let joined: Vec<String> = names.iter().map(|n| value_of(n)).collect();
                    out.push_str(&joined.join(","));
                }
                Operator::Label => {
                    for name in &names {
                        out.push('.');
                        out.push_str(&encode_component(&value_of(name)));
                    }
                }
                Operator::PathSegment => {
                    for name in &names {
                        out.push('/');
                        out.push_str(&encode_component(&value_of(name)));
                    }
                }
                Operator::PathParam => {
                    for name in &names {
                        out.push(';');
                        out.push_str(name);
                        let value = value_of(name);
                        if !value.is_empty() {
                            out.push('=');
                            out.push_str(&encode_component(&value));
                        }
                    }
                }
                Operator::Query | Operator::QueryContinuation => {
                    let lead = if operator == Operator::Query { '?' } else { '&' };
                    for (i, name) in names.iter().enumerate() {
                        out.push(if i == 0 { lead } else { '&' });
                        out.push_str(name);
                        out.push('=');
                        out.push_str(&encode_component(&value_of(name)));
                    }
                }
            },
        }
    }
    out
}

/// Static skeleton of a template: literal text with every expression removed.
fn static_skeleton(template: &str) -> String {
    parse(template)
        .iter()
        .filter_map(|p| match p {
            Part::Literal(lit) => Some(lit.as_str()),
            Part::Expression { .. } => None,
        })
        .collect()
}

/// URI scheme of a string, if it carries one (`scheme:` prefix).
fn scheme_of(s: &str) -> Option<&str> {
    let colon = s.find(':')?;
    let candidate = &s[..colon];
    let mut chars = candidate.chars();
    let first = chars.next()?;
    (first.is_ascii_alphabetic() && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')))
        .then_some(candidate)
}

/// Leading literal prefix of a template, truncated to the last `/` boundary.
fn boundary_prefix(template: &str) -> String {
    let prefix: String = match parse(template).first() {
        Some(Part::Literal(lit)) => lit.clone(),
        _ => String::new(),
    };
    prefix
        .rfind('/')
        .map_or(prefix.clone(), |i| prefix[..=i].to_string())
}

/// Decide whether two refs (exact or template) can serve the same URI.
///
/// The predicate over-approximates: false positives are acceptable, false
/// negatives are not. Exact/exact compares strings; exact/template runs the
/// matcher; template/template compares static skeletons (scheme plus common
/// prefix at path-separator boundaries).
pub fn templates_can_overlap(a: &str, b: &str) -> bool {
    match (is_template(a), is_template(b)) {
        (false, false) => a == b,
        (true, false) => match_uri(b, a).is_some(),
        (false, true) => match_uri(a, b).is_some(),
        (true, true) => {
            let skel_a = static_skeleton(a);
            let skel_b = static_skeleton(b);
            if let (Some(sa), Some(sb)) = (scheme_of(&skel_a), scheme_of(&skel_b)) {
                if sa != sb {
                    return false;
                }
            }
            let pa = boundary_prefix(a);
            let pb = boundary_prefix(b);
            pa.starts_with(&pb) || pb.starts_with(&pa)
        }
    }
}

/// Substitute each variable with `example-<name>` to produce a plausible URI
/// for conflict messages.
pub fn generate_example_uri(template: &str) -> String {
    let mut vars = HashMap::new();
    for part in parse(template) {
        if let Part::Expression { vars: names, .. } = part {
            for name in names {
                let value = format!("example-{name}");
                vars.insert(name, value);
            }
        }
    }
    expand(template, &vars)
}
