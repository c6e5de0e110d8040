//! AST-driven hierarchical chunker (C6, spec §4.6).

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tree_sitter::{Node, Parser};

use crate::config::ChunkLimits;
use crate::languages::{self, LangRule};
use crate::tokenizer::{self, Decision, TokenCounter};

/// Full source below this size is parsed as one buffer; at or above it we feed
/// the parser a streaming byte-offset callback (spec §4.6 parsing policy).
const STREAMING_THRESHOLD_BYTES: usize = 30 * 1024;
const STREAM_SLICE_BYTES: usize = 30 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ChunkMetadata {
    pub doc_comment: Option<String>,
    pub pampa_tags: Vec<String>,
    pub pampa_intent: Option<String>,
    pub pampa_description: Option<String>,
    pub auto_tags: Vec<String>,
    pub important_variables: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct RawChunk {
    pub code: String,
    pub start_line: usize,
    pub end_line: usize,
    pub symbol: String,
    pub chunk_type: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkingStats {
    pub total_nodes: usize,
    pub normal_chunks: usize,
    pub subdivided: usize,
    pub merged_small: usize,
    pub statement_fallback: usize,
    pub skipped_small: usize,
}

struct Ctx<'a> {
    rule: &'a LangRule,
    limits: &'a ChunkLimits,
    counter: &'a dyn TokenCounter,
    processed: HashSet<(usize, usize)>,
    out: Vec<RawChunk>,
    stats: ChunkingStats,
}

/// Parses `source` as `lang` and emits chunks per the node-walk algorithm. On a
/// missing grammar or failed parse, falls back to one whole-file chunk.
pub fn chunk_file(source: &str, lang: &str, file_basename: &str, limits: &ChunkLimits, counter: &dyn TokenCounter) -> (Vec<RawChunk>, ChunkingStats) {
    let Some(rule) = languages::RULES.iter().find(|r| r.name == lang) else {
        return whole_file_fallback(source, file_basename);
    };
    let Some(language) = languages::resolve(lang) else {
        return whole_file_fallback(source, file_basename);
    };

    let mut parser = Parser::new();
    if parser.set_language(&language).is_err() {
        return whole_file_fallback(source, file_basename);
    }

    let tree = if source.len() >= STREAMING_THRESHOLD_BYTES {
        let bytes = source.as_bytes();
        parser.parse_with(
            &mut |byte_offset, _point| {
                if byte_offset >= bytes.len() {
                    &[]
                } else {
                    let end = (byte_offset + STREAM_SLICE_BYTES).min(bytes.len());
                    &bytes[byte_offset..end]
                }
            },
            None,
        )
    } else {
        parser.parse(source, None)
    };

    let Some(tree) = tree else {
        return whole_file_fallback(source, file_basename);
    };
    let root = tree.root_node();
    if root.child_count() == 0 && root.byte_range().is_empty() {
        return whole_file_fallback(source, file_basename);
    }

    let mut ctx = Ctx {
        rule,
        limits,
        counter,
        processed: HashSet::new(),
        out: Vec::new(),
        stats: ChunkingStats::default(),
    };
    walk(root, source, false, &mut ctx);
    (ctx.out, ctx.stats)
}

fn whole_file_fallback(source: &str, file_basename: &str) -> (Vec<RawChunk>, ChunkingStats) {
    let chunk = RawChunk {
        code: source.to_string(),
        start_line: 1,
        end_line: source.lines().count().max(1),
        symbol: file_basename.to_string(),
        chunk_type: "file".to_string(),
        metadata: extract_metadata(source, file_basename, &[]),
    };
    (vec![chunk], ChunkingStats { total_nodes: 1, normal_chunks: 1, ..Default::default() })
}

fn span_key(node: Node) -> (usize, usize) {
    (node.start_byte(), node.end_byte())
}

fn walk(node: Node, source: &str, entered: bool, ctx: &mut Ctx) {
    if ctx.rule.node_types.contains(&node.kind()) && !ctx.processed.contains(&span_key(node)) {
        ctx.processed.insert(span_key(node));
        ctx.stats.total_nodes += 1;

        let text = node.utf8_text(source.as_bytes()).unwrap_or_default();
        let size = tokenizer::analyze(text, ctx.limits, ctx.counter, false);

        if size.decision == Decision::TooSmall && entered {
            ctx.stats.skipped_small += 1;
            return;
        }

        if size.decision == Decision::TooLarge {
            let candidates = ctx.rule.subdivision_types.iter().find(|(k, _)| *k == node.kind()).map(|(_, v)| *v);
            if let Some(child_kinds) = candidates {
                subdivide(node, source, child_kinds, ctx);
                return;
            }
            statement_fallback(node, source, ctx);
            return;
        }

        emit_whole_node(node, source, ctx);
        // fall through: still descend for nested eligible nodes (e.g. a nested fn).
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, source, entered || ctx.rule.node_types.contains(&node.kind()), ctx);
    }
}

fn emit_whole_node(node: Node, source: &str, ctx: &mut Ctx) {
    let code = node.utf8_text(source.as_bytes()).unwrap_or_default().to_string();
    let symbol = extract_symbol_name(node, source, ctx.rule);
    let metadata = extract_metadata(&code, &symbol, &leading_comment_lines(node, source));
    ctx.out.push(RawChunk {
        code,
        start_line: node.start_position().row + 1,
        end_line: node.end_position().row + 1,
        symbol,
        chunk_type: node.kind().to_string(),
        metadata,
    });
    ctx.stats.normal_chunks += 1;
}

fn subdivide(node: Node, source: &str, child_kinds: &[&str], ctx: &mut Ctx) {
    ctx.stats.subdivided += 1;

    let mut candidates = Vec::new();
    collect_candidates(node, child_kinds, &mut candidates);

    let texts: Vec<String> = candidates
        .iter()
        .map(|c| c.utf8_text(source.as_bytes()).unwrap_or_default().to_string())
        .collect();
    let sizes = tokenizer::analyze_batch(&texts, ctx.limits, ctx.counter, true);

    let mut small_group: Vec<Node> = Vec::new();
    for (candidate, size) in candidates.into_iter().zip(sizes.into_iter()) {
        ctx.processed.insert(span_key(candidate));
        if size.decision == Decision::TooSmall {
            small_group.push(candidate);
        } else {
            walk(candidate, source, true, ctx);
        }
    }

    if !small_group.is_empty() {
        let combined: usize = small_group
            .iter()
            .map(|n| n.utf8_text(source.as_bytes()).unwrap_or_default().len())
            .sum();
        let combined_tokens = tokenizer::analyze(
            &small_group.iter().map(|n| n.utf8_text(source.as_bytes()).unwrap_or_default()).collect::<Vec<_>>().join("\n\n"),
            ctx.limits,
            ctx.counter,
            true,
        );
        let _ = combined; // chars fallback retained for readability only
        if combined_tokens.decision != Decision::TooSmall || small_group.len() >= 3 {
            emit_merged(&small_group, source, ctx);
        }
    }
}

fn collect_candidates<'a>(node: Node<'a>, child_kinds: &[&str], out: &mut Vec<Node<'a>>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child_kinds.contains(&child.kind()) {
            out.push(child);
        } else {
            collect_candidates(child, child_kinds, out);
        }
    }
}

fn emit_merged(nodes: &[Node], source: &str, ctx: &mut Ctx) {
    let snippets: Vec<&str> = nodes.iter().map(|n| n.utf8_text(source.as_bytes()).unwrap_or_default()).collect();
    let code = snippets.join("\n\n");
    let first = nodes.first().unwrap();
    let last = nodes.last().unwrap();
    let chunk_type = format!("{}_merged", first.kind());
    let symbol = format!("small_methods_{}", nodes.len());
    let metadata = extract_metadata(&code, &symbol, &[]);
    ctx.out.push(RawChunk {
        code,
        start_line: first.start_position().row + 1,
        end_line: last.end_position().row + 1,
        symbol,
        chunk_type,
        metadata,
    });
    ctx.stats.merged_small += 1;
}

/// Splits an oversized node with no subdivision candidates into statement-level
/// chunks by line, each `<= max_tokens`, carrying >= 20% line overlap.
fn statement_fallback(node: Node, source: &str, ctx: &mut Ctx) {
    ctx.stats.statement_fallback += 1;
    let text = node.utf8_text(source.as_bytes()).unwrap_or_default();
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return;
    }

    let base_symbol = extract_symbol_name(node, source, ctx.rule);
    let start_line0 = node.start_position().row;

    let mut part = 0usize;
    let mut i = 0usize;
    while i < lines.len() {
        let mut j = i;
        let mut acc = String::new();
        loop {
            if j >= lines.len() {
                break;
            }
            let candidate = if acc.is_empty() { lines[j].to_string() } else { format!("{acc}\n{}", lines[j]) };
            let size = tokenizer::analyze(&candidate, ctx.limits, ctx.counter, true);
            if size.decision == Decision::TooLarge && j > i {
                break;
            }
            acc = candidate;
            j += 1;
            if size.decision == Decision::TooLarge {
                break;
            }
        }
        let chunk_code = acc;
        let symbol = format!("{base_symbol}_part{part}");
        let metadata = extract_metadata(&chunk_code, &symbol, &[]);
        ctx.out.push(RawChunk {
            code: chunk_code,
            start_line: start_line0 + i + 1,
            end_line: start_line0 + j,
            symbol,
            chunk_type: format!("{}_statement_chunk", node.kind()),
            metadata,
        });
        part += 1;

        if j >= lines.len() {
            break;
        }
        let consumed = (j - i).max(1);
        let overlap = ((consumed as f64) * 0.2).ceil() as usize;
        i = j.saturating_sub(overlap.max(1)).max(i + 1);
    }
}

const KEYWORD_TOKENS: &[&str] = &[
    "public", "private", "protected", "static", "function", "class", "def", "fn", "func", "async",
    "export", "default", "const", "let", "var", "abstract", "final", "override", "struct", "enum",
    "trait", "impl", "interface", "type", "module", "namespace", "new", "return",
];

/// Walks `node` to extract a declaration identifier, skipping keyword tokens.
/// Fallback chain: non-keyword identifier subtree match -> regex over text ->
/// `<nodeType>_<startByte>`.
fn extract_symbol_name(node: Node, source: &str, rule: &LangRule) -> String {
    if let Some(name) = find_identifier_field(node, source) {
        return name;
    }
    if let Some(name) = find_first_identifier(node, source, rule.keyword_skip) {
        return name;
    }
    if let Some(name) = regex_declaration_name(node.utf8_text(source.as_bytes()).unwrap_or_default()) {
        return name;
    }
    format!("{}_{}", node.kind(), node.start_byte())
}

fn find_identifier_field(node: Node, source: &str) -> Option<String> {
    for field in ["name", "declarator"] {
        if let Some(child) = node.child_by_field_name(field) {
            if let Ok(text) = child.utf8_text(source.as_bytes()) {
                let cleaned: String = text.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
                if !cleaned.is_empty() {
                    return Some(cleaned);
                }
            }
        }
    }
    None
}

fn find_first_identifier(node: Node, source: &str, keyword_skip: &[&str]) -> Option<String> {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind().ends_with("identifier") {
            if let Ok(text) = child.utf8_text(source.as_bytes()) {
                if !keyword_skip.contains(&text) {
                    return Some(text.to_string());
                }
            }
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(found) = find_first_identifier(child, source, keyword_skip) {
            return Some(found);
        }
    }
    None
}

static DECLARATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*[:(<]").unwrap());

fn regex_declaration_name(text: &str) -> Option<String> {
    DECLARATION_RE.captures(text).map(|c| c[1].to_string())
}

fn leading_comment_lines<'a>(node: Node, source: &'a str) -> Vec<&'a str> {
    let mut lines_before = Vec::new();
    let mut prev = node.prev_sibling();
    while let Some(sib) = prev {
        let kind = sib.kind();
        if kind.contains("comment") {
            if let Ok(text) = sib.utf8_text(source.as_bytes()) {
                lines_before.insert(0, text);
            }
            prev = sib.prev_sibling();
        } else {
            break;
        }
    }
    lines_before
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)@pampa-tags:\s*(.+)").unwrap());
static INTENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)@pampa-intent:\s*(.+)").unwrap());
static DESC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)@pampa-description:\s*(.+)").unwrap());
static IMPORTANT_VAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:pub\s+)?(?:const|static|let|var|final)\s+([A-Z_][A-Z0-9_]*)\s*(?::[^=]+)?=\s*(.+?);?\s*$").unwrap()
});

const AUTO_TAG_KEYWORDS: &[&str] = &[
    "auth", "payment", "stripe", "checkout", "session", "user", "login", "logout", "token",
    "controller", "service", "repository", "handler", "middleware", "validate", "validator",
    "config", "api", "client", "server", "test", "util", "helper", "model", "schema", "route",
    "cache", "queue", "worker", "webhook", "database", "migration",
];

fn extract_metadata(code: &str, symbol: &str, leading_comments: &[&str]) -> ChunkMetadata {
    let doc_comment = if leading_comments.is_empty() { None } else { Some(leading_comments.join("\n")) };
    let doc_text = doc_comment.clone().unwrap_or_default();

    let pampa_tags: Vec<String> = TAG_RE
        .captures(&doc_text)
        .map(|c| c[1].split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let pampa_intent = INTENT_RE.captures(&doc_text).map(|c| c[1].trim().to_string());
    let pampa_description = DESC_RE.captures(&doc_text).map(|c| c[1].trim().to_string());

    let auto_tags = auto_tags(code, symbol);

    let important_variables = IMPORTANT_VAR_RE
        .captures_iter(code)
        .map(|c| {
            let name = c[1].to_string();
            let mut value = c[2].trim().to_string();
            if value.len() > 100 {
                value.truncate(100);
            }
            (name, value)
        })
        .take(20)
        .collect();

    ChunkMetadata {
        doc_comment,
        pampa_tags,
        pampa_intent,
        pampa_description,
        auto_tags,
        important_variables,
    }
}

/// Path/symbol tokenization + keyword-dictionary match, top-10 by insertion order.
fn auto_tags(code: &str, symbol: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tags = Vec::new();

    let lower_symbol = symbol.to_ascii_lowercase();
    for part in lower_symbol.split(|c: char| !c.is_alphanumeric()) {
        if part.len() < 3 {
            continue;
        }
        if AUTO_TAG_KEYWORDS.contains(&part) && seen.insert(part.to_string()) {
            tags.push(part.to_string());
        }
        if tags.len() >= 10 {
            return tags;
        }
    }

    let lower_code = code.to_ascii_lowercase();
    for kw in AUTO_TAG_KEYWORDS {
        if tags.len() >= 10 {
            break;
        }
        if lower_code.contains(kw) && seen.insert(kw.to_string()) {
            tags.push(kw.to_string());
        }
    }

    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::TiktokenCounter;

    fn limits() -> ChunkLimits {
        ChunkLimits { min_tokens: 5, optimal_tokens: 50, max_tokens: 120, overlap_tokens: 10 }
    }

    #[test]
    fn chunks_top_level_rust_functions() {
        let src = "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n\nfn sub(a: i32, b: i32) -> i32 {\n    a - b\n}\n";
        let counter = TiktokenCounter::new();
        let (chunks, stats) = chunk_file(src, "rust", "lib.rs", &limits(), &counter);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].symbol, "add");
        assert_eq!(chunks[1].symbol, "sub");
        assert_eq!(stats.normal_chunks, 2);
    }

    #[test]
    fn subdivides_large_impl_block_into_methods() {
        let mut src = String::from("struct Foo;\nimpl Foo {\n");
        for i in 0..10 {
            src.push_str(&format!("    fn method_{i}(&self) -> i32 {{\n        let mut total = 0;\n        for j in 0..50 {{ total += j; }}\n        total + {i}\n    }}\n"));
        }
        src.push_str("}\n");

        let counter = TiktokenCounter::new();
        let (chunks, stats) = chunk_file(&src, "rust", "lib.rs", &limits(), &counter);
        assert!(stats.subdivided >= 1);
        assert!(chunks.iter().any(|c| c.symbol.starts_with("method_")));
    }

    #[test]
    fn unsupported_language_falls_back_to_whole_file() {
        let src = "some made up content without a grammar";
        let counter = TiktokenCounter::new();
        let (chunks, _stats) = chunk_file(src, "nonexistent", "weird.xyz", &limits(), &counter);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, "file");
        assert_eq!(chunks[0].symbol, "weird.xyz");
    }

    #[test]
    fn pampa_tags_parsed_from_leading_comment() {
        let src = "// @pampa-tags: auth, session\n// @pampa-intent: validate the user token\nfn check(tok: &str) -> bool {\n    tok.len() > 0\n}\n";
        let counter = TiktokenCounter::new();
        let (chunks, _stats) = chunk_file(src, "rust", "lib.rs", &limits(), &counter);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.pampa_tags, vec!["auth".to_string(), "session".to_string()]);
        assert_eq!(chunks[0].metadata.pampa_intent.as_deref(), Some("validate the user token"));
    }

    #[test]
    fn important_variables_capped_at_100_chars() {
        let long_value = "x".repeat(200);
        let src = format!("fn setup() {{\n    const API_KEY: &str = \"{long_value}\";\n}}\n");
        let counter = TiktokenCounter::new();
        let (chunks, _stats) = chunk_file(&src, "rust", "lib.rs", &limits(), &counter);
        assert_eq!(chunks.len(), 1);
        let vars = &chunks[0].metadata.important_variables;
        assert_eq!(vars[0].0, "API_KEY");
        assert!(vars[0].1.len() <= 100);
    }
}
