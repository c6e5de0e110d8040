//! Symbol Extractor (C7, spec §4.7).
//!
//! Works off node text rather than per-grammar query files: a chunk's source
//! already starts at a declaration, so signature/parameter/call extraction can
//! be done with a small set of language-agnostic heuristics plus a handful of
//! node-type names that are common across tree-sitter grammars.

use std::collections::HashSet;

use tree_sitter::Node;

const CALL_NODE_TYPES: &[&str] = &[
    "call_expression",
    "call",
    "method_invocation",
    "function_call",
    "method_call",
];

const MAX_CALLS: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct ExtractedSymbol {
    pub signature: Option<String>,
    pub parameters: Vec<Parameter>,
    pub return_type: Option<String>,
    pub calls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub type_hint: Option<String>,
    pub default_value: Option<String>,
}

/// Extracts signature/parameters/return type/calls from `node`'s slice of `source`.
pub fn extract(node: Node, source: &str) -> ExtractedSymbol {
    ExtractedSymbol {
        signature: extract_signature(node, source),
        parameters: extract_parameters(node, source),
        return_type: extract_return_type(node, source),
        calls: extract_calls(node, source),
    }
}

/// signature = substring up to `(` + balanced parameter list + optional
/// single-line return-type annotation, with internal newlines collapsed.
fn extract_signature(node: Node, source: &str) -> Option<String> {
    let text = node.utf8_text(source.as_bytes()).ok()?;
    let open = text.find('(')?;
    let mut depth = 0i32;
    let mut close = None;
    for (i, ch) in text.char_indices().skip(open) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let close = close?;
    let mut sig = text[..=close].to_string();

    // Append a single-line return-type tail if one immediately follows, up to
    // the first `{` or end of line (covers `-> T`, `: T`, `: T {`).
    let rest = &text[close + 1..];
    let tail_end = rest.find(['{', '\n']).unwrap_or(rest.len());
    let tail = rest[..tail_end].trim();
    if !tail.is_empty() && (tail.starts_with("->") || tail.starts_with(':')) {
        sig.push(' ');
        sig.push_str(tail);
    }

    Some(normalize_single_line(&sig))
}

fn normalize_single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_return_type(node: Node, source: &str) -> Option<String> {
    for child in node.children(&mut node.walk()) {
        let ty = child.kind();
        if ty.contains("return_type") || ty == "type_annotation" {
            if let Ok(t) = child.utf8_text(source.as_bytes()) {
                return Some(normalize_single_line(t.trim_start_matches("->").trim_start_matches(':').trim()));
            }
        }
    }
    None
}

fn extract_parameters(node: Node, source: &str) -> Vec<Parameter> {
    let mut out = Vec::new();
    let Some(params_node) = find_child_by_kind_suffix(node, "parameters") else {
        return out;
    };

    let mut cursor = params_node.walk();
    for child in params_node.children(&mut cursor) {
        let kind = child.kind();
        if kind == "(" || kind == ")" || kind == "," {
            continue;
        }
        let Ok(text) = child.utf8_text(source.as_bytes()) else { continue };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        out.push(parse_parameter_text(text));
    }
    out
}

fn find_child_by_kind_suffix<'a>(node: Node<'a>, suffix: &str) -> Option<Node<'a>> {
    let mut cursor = node.walk();
    let result = node.children(&mut cursor).find(|c| c.kind().ends_with(suffix));
    result
}

/// Splits `name: Type = default` / `name = default` / `name` textually — grammar
/// differences in punctuation are handled rather than walking each grammar's
/// parameter sub-tree.
fn parse_parameter_text(text: &str) -> Parameter {
    let (name_and_type, default_value) = match text.split_once('=') {
        Some((a, b)) => (a.trim(), Some(b.trim().to_string())),
        None => (text, None),
    };
    let (name, type_hint) = match name_and_type.split_once(':') {
        Some((a, b)) => (a.trim().to_string(), Some(b.trim().to_string())),
        None => (name_and_type.trim().to_string(), None),
    };
    Parameter {
        name: name.trim_start_matches(['&', '*']).to_string(),
        type_hint,
        default_value,
    }
}

/// Deduplicated, insertion-order callee identifiers reached by descending
/// call-expression-like nodes, capped at [`MAX_CALLS`].
fn extract_calls(node: Node, source: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    walk_calls(node, source, &mut seen, &mut out);
    out
}

fn walk_calls(node: Node, source: &str, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    if out.len() >= MAX_CALLS {
        return;
    }
    if CALL_NODE_TYPES.contains(&node.kind()) {
        if let Some(callee) = callee_name(node, source) {
            if seen.insert(callee.clone()) {
                out.push(callee);
            }
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if out.len() >= MAX_CALLS {
            return;
        }
        walk_calls(child, source, seen, out);
    }
}

fn callee_name(call_node: Node, source: &str) -> Option<String> {
    let function_child = call_node
        .child_by_field_name("function")
        .or_else(|| call_node.child_by_field_name("method"))
        .or_else(|| call_node.child(0))?;

    let text = function_child.utf8_text(source.as_bytes()).ok()?;
    // For a member expression like `self.foo` or `obj.bar`, keep only the
    // final segment: the call target, not its receiver chain.
    let last_segment = text.rsplit(['.', ':']).next().unwrap_or(text);
    let cleaned: String = last_segment.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tree_sitter::Parser;

    fn parse_rust(src: &str) -> tree_sitter::Tree {
        let mut parser = Parser::new();
        parser.set_language(&tree_sitter_rust::LANGUAGE.into()).unwrap();
        parser.parse(src, None).unwrap()
    }

    #[test]
    fn extracts_signature_and_return_type() {
        let src = "fn add(a: i32, b: i32) -> i32 { a + b }";
        let tree = parse_rust(src);
        let root = tree.root_node();
        let func = root.child(0).unwrap();
        let sym = extract(func, src);
        assert_eq!(sym.signature.as_deref(), Some("fn add(a: i32, b: i32) -> i32"));
        assert_eq!(sym.parameters.len(), 2);
        assert_eq!(sym.parameters[0].name, "a");
        assert_eq!(sym.parameters[0].type_hint.as_deref(), Some("i32"));
    }

    #[test]
    fn extracts_deduplicated_calls_in_order() {
        let src = "fn run() { helper(); other(); helper(); }";
        let tree = parse_rust(src);
        let root = tree.root_node();
        let func = root.child(0).unwrap();
        let sym = extract(func, src);
        assert_eq!(sym.calls, vec!["helper".to_string(), "other".to_string()]);
    }

    #[test]
    fn caps_calls_at_max() {
        let mut body = String::from("fn run() { ");
        for i in 0..100 {
            body.push_str(&format!("fn_{i}(); "));
        }
        body.push('}');
        let tree = parse_rust(&body);
        let root = tree.root_node();
        let func = root.child(0).unwrap();
        let sym = extract(func, &body);
        assert_eq!(sym.calls.len(), MAX_CALLS);
    }
}
