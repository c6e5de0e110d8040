//! Static per-language chunking table (spec §4.6, §6 "Supported source languages").
//!
//! Each [`LangRule`] names the node types C6 treats as top-level chunk boundaries
//! and, for the oversized ones, which child node types are valid subdivision
//! candidates. Grammars behind a `lang-*` feature degrade gracefully: [`resolve`]
//! returns `None` for a language whose grammar crate wasn't compiled in, and
//! callers fall back to the whole-file chunk.

use std::collections::HashMap;

pub struct LangRule {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    /// AST node types considered top-level chunk boundaries.
    pub node_types: &'static [&'static str],
    /// For a subset of `node_types` that commonly exceed the max size, the
    /// child node types that make valid independent sub-chunks.
    pub subdivision_types: &'static [(&'static str, &'static [&'static str])],
    /// Keywords skipped while hunting for a declaration identifier.
    pub keyword_skip: &'static [&'static str],
}

const COMMON_KEYWORDS: &[&str] = &[
    "public", "private", "protected", "static", "function", "class", "def", "fn", "func",
    "async", "export", "default", "const", "let", "var", "abstract", "final", "override",
];

macro_rules! rule {
    ($name:expr, $exts:expr, $nodes:expr, $subdiv:expr) => {
        LangRule {
            name: $name,
            extensions: $exts,
            node_types: $nodes,
            subdivision_types: $subdiv,
            keyword_skip: COMMON_KEYWORDS,
        }
    };
}

pub static RULES: &[LangRule] = &[
    rule!(
        "javascript",
        &["js", "mjs", "cjs"],
        &["function_declaration", "class_declaration", "method_definition", "lexical_declaration"],
        &[("class_declaration", &["method_definition"])]
    ),
    rule!(
        "typescript",
        &["ts"],
        &["function_declaration", "class_declaration", "method_definition", "interface_declaration", "lexical_declaration"],
        &[("class_declaration", &["method_definition"]), ("interface_declaration", &["property_signature", "method_signature"])]
    ),
    rule!(
        "tsx",
        &["tsx", "jsx"],
        &["function_declaration", "class_declaration", "method_definition", "lexical_declaration"],
        &[("class_declaration", &["method_definition"])]
    ),
    rule!(
        "python",
        &["py", "pyi"],
        &["function_definition", "class_definition"],
        &[("class_definition", &["function_definition"])]
    ),
    rule!(
        "php",
        &["php"],
        &["function_definition", "class_declaration", "method_declaration"],
        &[("class_declaration", &["method_declaration"])]
    ),
    rule!(
        "java",
        &["java"],
        &["class_declaration", "interface_declaration", "method_declaration", "constructor_declaration"],
        &[("class_declaration", &["method_declaration", "constructor_declaration"])]
    ),
    rule!(
        "kotlin",
        &["kt", "kts"],
        &["class_declaration", "function_declaration", "object_declaration"],
        &[("class_declaration", &["function_declaration"])]
    ),
    rule!(
        "go",
        &["go"],
        &["function_declaration", "method_declaration", "type_declaration"],
        &[]
    ),
    rule!(
        "rust",
        &["rs"],
        &["function_item", "impl_item", "struct_item", "enum_item", "trait_item", "mod_item"],
        &[("impl_item", &["function_item"]), ("trait_item", &["function_item"]), ("mod_item", &["function_item", "struct_item", "enum_item"])]
    ),
    rule!("c", &["c", "h"], &["function_definition", "struct_specifier"], &[]),
    rule!(
        "cpp",
        &["cpp", "cc", "cxx", "hpp", "hh"],
        &["function_definition", "class_specifier", "struct_specifier"],
        &[("class_specifier", &["function_definition"])]
    ),
    rule!(
        "csharp",
        &["cs"],
        &["class_declaration", "interface_declaration", "method_declaration", "constructor_declaration"],
        &[("class_declaration", &["method_declaration", "constructor_declaration"])]
    ),
    rule!(
        "ruby",
        &["rb"],
        &["method", "class", "module"],
        &[("class", &["method"]), ("module", &["method"])]
    ),
    rule!(
        "scala",
        &["scala"],
        &["class_definition", "object_definition", "trait_definition", "function_definition"],
        &[("class_definition", &["function_definition"]), ("object_definition", &["function_definition"])]
    ),
    rule!(
        "swift",
        &["swift"],
        &["function_declaration", "class_declaration", "protocol_declaration"],
        &[("class_declaration", &["function_declaration"])]
    ),
    rule!("lua", &["lua"], &["function_declaration", "local_function"], &[]),
    rule!("ocaml", &["ml", "mli"], &["value_definition", "module_definition"], &[]),
    rule!("haskell", &["hs"], &["function", "signature"], &[]),
    rule!("elixir", &["ex", "exs"], &["call"], &[]),
    rule!("bash", &["sh", "bash"], &["function_definition"], &[]),
    rule!("html", &["html", "htm"], &["element"], &[]),
    rule!("css", &["css"], &["rule_set"], &[]),
    rule!("json", &["json"], &["pair"], &[]),
];

/// Looks up a [`LangRule`] by file extension (case-insensitive, no leading dot).
pub fn rule_for_extension(ext: &str) -> Option<&'static LangRule> {
    let ext = ext.to_ascii_lowercase();
    RULES.iter().find(|r| r.extensions.contains(&ext.as_str()))
}

pub fn all_extensions() -> Vec<&'static str> {
    RULES.iter().flat_map(|r| r.extensions.iter().copied()).collect()
}

/// Resolves the compiled-in `tree_sitter::Language` for a rule's name, or
/// `None` if its grammar crate was excluded via Cargo features.
pub fn resolve(lang_name: &str) -> Option<tree_sitter::Language> {
    match lang_name {
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        "javascript" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        #[cfg(feature = "lang-go")]
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        #[cfg(feature = "lang-java")]
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        #[cfg(feature = "lang-kotlin")]
        "kotlin" => Some(tree_sitter_kotlin_ng::LANGUAGE.into()),
        #[cfg(feature = "lang-csharp")]
        "csharp" => Some(tree_sitter_c_sharp::LANGUAGE.into()),
        #[cfg(feature = "lang-php")]
        "php" => Some(tree_sitter_php::LANGUAGE_PHP.into()),
        #[cfg(feature = "lang-c")]
        "c" => Some(tree_sitter_c::LANGUAGE.into()),
        #[cfg(feature = "lang-cpp")]
        "cpp" => Some(tree_sitter_cpp::LANGUAGE.into()),
        #[cfg(feature = "lang-ruby")]
        "ruby" => Some(tree_sitter_ruby::LANGUAGE.into()),
        #[cfg(feature = "lang-scala")]
        "scala" => Some(tree_sitter_scala::LANGUAGE.into()),
        #[cfg(feature = "lang-swift")]
        "swift" => Some(tree_sitter_swift::LANGUAGE.into()),
        #[cfg(feature = "lang-lua")]
        "lua" => Some(tree_sitter_lua::LANGUAGE.into()),
        #[cfg(feature = "lang-ocaml")]
        "ocaml" => Some(tree_sitter_ocaml::LANGUAGE_OCAML.into()),
        #[cfg(feature = "lang-haskell")]
        "haskell" => Some(tree_sitter_haskell::LANGUAGE.into()),
        #[cfg(feature = "lang-elixir")]
        "elixir" => Some(tree_sitter_elixir::LANGUAGE.into()),
        #[cfg(feature = "lang-bash")]
        "bash" => Some(tree_sitter_bash::LANGUAGE.into()),
        #[cfg(feature = "lang-html")]
        "html" => Some(tree_sitter_html::LANGUAGE.into()),
        #[cfg(feature = "lang-css")]
        "css" => Some(tree_sitter_css::LANGUAGE.into()),
        #[cfg(feature = "lang-json")]
        "json" => Some(tree_sitter_json::LANGUAGE.into()),
        _ => None,
    }
}

/// Builds a lookup of subdivision types for quick access during the node walk.
pub fn subdivision_map(rule: &LangRule) -> HashMap<&'static str, &'static [&'static str]> {
    rule.subdivision_types.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rule_resolves_or_is_feature_gated_out() {
        for rule in RULES {
            let _ = resolve(rule.name);
        }
    }

    #[test]
    fn core_languages_always_resolve() {
        assert!(resolve("rust").is_some());
        assert!(resolve("javascript").is_some());
        assert!(resolve("typescript").is_some());
        assert!(resolve("python").is_some());
    }

    #[test]
    fn extension_lookup_is_case_insensitive() {
        assert_eq!(rule_for_extension("RS").unwrap().name, "rust");
        assert_eq!(rule_for_extension("PY").unwrap().name, "python");
        assert!(rule_for_extension("xyz").is_none());
    }
}
