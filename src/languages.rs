//! Per-language grammar registry for the chunker.
//!
//! Each supported language is a `(grammar, capture query)` pair selected by
//! file extension. The capture query marks semantic blocks with `@block`
//! and their identifier (when the grammar exposes one in a stable
//! position) with `@name`.
//!
//! Queries are compiled once at startup. A query that fails to compile
//! against the linked grammar disables that language only; the table logs
//! what it loaded and the worker refuses to start only when *nothing*
//! loaded.

use std::collections::HashMap;
use std::sync::Arc;
use tree_sitter::{Language, Query};

/// A loaded grammar plus its compiled block/name capture query.
pub struct LanguageSpec {
    pub name: &'static str,
    pub language: Language,
    pub query: Query,
}

/// Extension → language lookup table, built once at startup.
pub struct LanguageTable {
    by_extension: HashMap<&'static str, Arc<LanguageSpec>>,
    loaded: Vec<&'static str>,
}

struct LanguageDef {
    name: &'static str,
    extensions: &'static [&'static str],
    language: Language,
    query: &'static str,
}

const TYPESCRIPT_QUERY: &str = r#"
(function_declaration name: (identifier) @name) @block
(generator_function_declaration name: (identifier) @name) @block
(class_declaration name: (type_identifier) @name) @block
(abstract_class_declaration name: (type_identifier) @name) @block
(method_definition name: (property_identifier) @name) @block
(interface_declaration name: (type_identifier) @name) @block
(enum_declaration name: (identifier) @name) @block
(type_alias_declaration name: (type_identifier) @name) @block
(variable_declarator name: (identifier) @name value: (arrow_function)) @block
(variable_declarator name: (identifier) @name value: (function_expression)) @block
"#;

const JAVASCRIPT_QUERY: &str = r#"
(function_declaration name: (identifier) @name) @block
(generator_function_declaration name: (identifier) @name) @block
(class_declaration name: (identifier) @name) @block
(method_definition name: (property_identifier) @name) @block
(variable_declarator name: (identifier) @name value: (arrow_function)) @block
(variable_declarator name: (identifier) @name value: (function_expression)) @block
"#;

const PYTHON_QUERY: &str = r#"
(function_definition name: (identifier) @name) @block
(class_definition name: (identifier) @name) @block
"#;

const RUST_QUERY: &str = r#"
(function_item name: (identifier) @name) @block
(struct_item name: (type_identifier) @name) @block
(enum_item name: (type_identifier) @name) @block
(trait_item name: (type_identifier) @name) @block
(impl_item type: (type_identifier) @name) @block
(impl_item) @block
(mod_item name: (identifier) @name) @block
"#;

const JAVA_QUERY: &str = r#"
(class_declaration name: (identifier) @name) @block
(interface_declaration name: (identifier) @name) @block
(enum_declaration name: (identifier) @name) @block
(record_declaration name: (identifier) @name) @block
(method_declaration name: (identifier) @name) @block
(constructor_declaration name: (identifier) @name) @block
"#;

const C_QUERY: &str = r#"
(function_definition declarator: (function_declarator declarator: (identifier) @name)) @block
(struct_specifier name: (type_identifier) @name body: (field_declaration_list)) @block
(enum_specifier name: (type_identifier) @name body: (enumerator_list)) @block
(type_definition declarator: (type_identifier) @name) @block
"#;

const CPP_QUERY: &str = r#"
(function_definition declarator: (function_declarator declarator: (identifier) @name)) @block
(function_definition declarator: (function_declarator declarator: (qualified_identifier) @name)) @block
(function_definition declarator: (function_declarator declarator: (field_identifier) @name)) @block
(class_specifier name: (type_identifier) @name body: (field_declaration_list)) @block
(struct_specifier name: (type_identifier) @name body: (field_declaration_list)) @block
(enum_specifier name: (type_identifier) @name body: (enumerator_list)) @block
"#;

const C_SHARP_QUERY: &str = r#"
(class_declaration name: (identifier) @name) @block
(interface_declaration name: (identifier) @name) @block
(struct_declaration name: (identifier) @name) @block
(enum_declaration name: (identifier) @name) @block
(record_declaration name: (identifier) @name) @block
(method_declaration name: (identifier) @name) @block
(constructor_declaration name: (identifier) @name) @block
"#;

const GO_QUERY: &str = r#"
(function_declaration name: (identifier) @name) @block
(method_declaration name: (field_identifier) @name) @block
(type_declaration (type_spec name: (type_identifier) @name)) @block
"#;

const RUBY_QUERY: &str = r#"
(method name: (identifier) @name) @block
(singleton_method name: (identifier) @name) @block
(class name: (constant) @name) @block
(module name: (constant) @name) @block
"#;

const PHP_QUERY: &str = r#"
(function_definition name: (name) @name) @block
(method_declaration name: (name) @name) @block
(class_declaration name: (name) @name) @block
(interface_declaration name: (name) @name) @block
(trait_declaration name: (name) @name) @block
"#;

const SCALA_QUERY: &str = r#"
(function_definition name: (identifier) @name) @block
(class_definition name: (identifier) @name) @block
(object_definition name: (identifier) @name) @block
(trait_definition name: (identifier) @name) @block
"#;

const CSS_QUERY: &str = r#"
(rule_set) @block
(media_statement) @block
(keyframes_statement) @block
"#;

const HTML_QUERY: &str = r#"
(document (element) @block)
(script_element) @block
(style_element) @block
"#;

const JSON_QUERY: &str = r#"
(document (object (pair key: (string) @name) @block))
"#;

const BASH_QUERY: &str = r#"
(function_definition name: (word) @name) @block
"#;

const OCAML_QUERY: &str = r#"
(value_definition (let_binding pattern: (value_name) @name)) @block
(type_definition (type_binding name: (type_constructor) @name)) @block
(module_definition (module_binding name: (module_name) @name)) @block
"#;

const EMBEDDED_TEMPLATE_QUERY: &str = r#"
(directive) @block
(output_directive) @block
"#;

fn definitions() -> Vec<LanguageDef> {
    vec![
        LanguageDef {
            name: "typescript",
            extensions: &["ts", "mts", "cts"],
            language: tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            query: TYPESCRIPT_QUERY,
        },
        LanguageDef {
            name: "tsx",
            extensions: &["tsx"],
            language: tree_sitter_typescript::LANGUAGE_TSX.into(),
            query: TYPESCRIPT_QUERY,
        },
        LanguageDef {
            name: "javascript",
            extensions: &["js", "mjs", "cjs", "jsx"],
            language: tree_sitter_javascript::LANGUAGE.into(),
            query: JAVASCRIPT_QUERY,
        },
        LanguageDef {
            name: "python",
            extensions: &["py", "pyi"],
            language: tree_sitter_python::LANGUAGE.into(),
            query: PYTHON_QUERY,
        },
        LanguageDef {
            name: "rust",
            extensions: &["rs"],
            language: tree_sitter_rust::LANGUAGE.into(),
            query: RUST_QUERY,
        },
        LanguageDef {
            name: "java",
            extensions: &["java"],
            language: tree_sitter_java::LANGUAGE.into(),
            query: JAVA_QUERY,
        },
        LanguageDef {
            name: "c",
            extensions: &["c", "h"],
            language: tree_sitter_c::LANGUAGE.into(),
            query: C_QUERY,
        },
        LanguageDef {
            name: "cpp",
            extensions: &["cpp", "cc", "cxx", "hpp", "hh"],
            language: tree_sitter_cpp::LANGUAGE.into(),
            query: CPP_QUERY,
        },
        LanguageDef {
            name: "c_sharp",
            extensions: &["cs"],
            language: tree_sitter_c_sharp::LANGUAGE.into(),
            query: C_SHARP_QUERY,
        },
        LanguageDef {
            name: "go",
            extensions: &["go"],
            language: tree_sitter_go::LANGUAGE.into(),
            query: GO_QUERY,
        },
        LanguageDef {
            name: "ruby",
            extensions: &["rb", "rake"],
            language: tree_sitter_ruby::LANGUAGE.into(),
            query: RUBY_QUERY,
        },
        LanguageDef {
            name: "php",
            extensions: &["php"],
            language: tree_sitter_php::LANGUAGE_PHP.into(),
            query: PHP_QUERY,
        },
        LanguageDef {
            name: "scala",
            extensions: &["scala", "sc"],
            language: tree_sitter_scala::LANGUAGE.into(),
            query: SCALA_QUERY,
        },
        LanguageDef {
            name: "css",
            extensions: &["css"],
            language: tree_sitter_css::LANGUAGE.into(),
            query: CSS_QUERY,
        },
        LanguageDef {
            name: "html",
            extensions: &["html", "htm"],
            language: tree_sitter_html::LANGUAGE.into(),
            query: HTML_QUERY,
        },
        LanguageDef {
            name: "json",
            extensions: &["json"],
            language: tree_sitter_json::LANGUAGE.into(),
            query: JSON_QUERY,
        },
        LanguageDef {
            name: "bash",
            extensions: &["sh", "bash"],
            language: tree_sitter_bash::LANGUAGE.into(),
            query: BASH_QUERY,
        },
        LanguageDef {
            name: "ocaml",
            extensions: &["ml"],
            language: tree_sitter_ocaml::LANGUAGE_OCAML.into(),
            query: OCAML_QUERY,
        },
        LanguageDef {
            name: "ocaml_interface",
            extensions: &["mli"],
            language: tree_sitter_ocaml::LANGUAGE_OCAML_INTERFACE.into(),
            query: OCAML_QUERY,
        },
        LanguageDef {
            name: "embedded_template",
            extensions: &["erb", "ejs"],
            language: tree_sitter_embedded_template::LANGUAGE.into(),
            query: EMBEDDED_TEMPLATE_QUERY,
        },
    ]
}

impl LanguageTable {
    /// Compiles every language's capture query. Languages whose query does
    /// not compile against the linked grammar are skipped with a warning.
    pub fn load() -> Self {
        let mut by_extension = HashMap::new();
        let mut loaded = Vec::new();

        for def in definitions() {
            let query = match Query::new(&def.language, def.query) {
                Ok(q) => q,
                Err(e) => {
                    tracing::warn!(language = def.name, error = %e, "capture query failed to compile, language disabled");
                    continue;
                }
            };
            let spec = Arc::new(LanguageSpec {
                name: def.name,
                language: def.language,
                query,
            });
            for ext in def.extensions {
                by_extension.insert(*ext, Arc::clone(&spec));
            }
            loaded.push(def.name);
        }

        tracing::info!(languages = ?loaded, "language table loaded");
        Self {
            by_extension,
            loaded,
        }
    }

    /// Looks up a language by lowercase extension (without the dot).
    pub fn for_extension(&self, ext: &str) -> Option<&LanguageSpec> {
        self.by_extension.get(ext).map(|s| s.as_ref())
    }

    /// True when no language loaded at all. The worker treats this as a
    /// fatal startup condition.
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    pub fn loaded_languages(&self) -> &[&'static str] {
        &self.loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_queries_compile() {
        let table = LanguageTable::load();
        // Every statically linked grammar must accept its query; a failure
        // here means a query references a node type the grammar lacks.
        assert!(table.loaded_languages().contains(&"rust"));
        assert!(table.loaded_languages().contains(&"typescript"));
        assert!(table.loaded_languages().contains(&"python"));
        assert_eq!(table.loaded_languages().len(), definitions().len());
    }

    #[test]
    fn extension_lookup_is_case_sensitive_lowercase() {
        let table = LanguageTable::load();
        assert!(table.for_extension("rs").is_some());
        assert!(table.for_extension("py").is_some());
        assert!(table.for_extension("tsx").is_some());
        assert!(table.for_extension("zig").is_none());
        assert!(table.for_extension("").is_none());
    }
}
