//! Syntax-aware code chunker.
//!
//! Splits a source file into named semantic chunks by parsing it with the
//! language grammar selected for its extension and running that language's
//! capture query over the tree (see [`crate::languages`]).
//!
//! # Algorithm
//!
//! 1. Select a grammar by lowercased file extension; unknown extensions
//!    yield an empty sequence without error.
//! 2. Parse into a concrete-syntax tree. Parse failures are non-fatal: the
//!    file is logged and skipped.
//! 3. Run the capture query; every `@block` capture becomes one chunk, in
//!    document order.
//! 4. Resolve the block's name from the `@name` capture of the same match
//!    (immediate child preferred, any capture inside the block accepted for
//!    grammars that nest identifiers); `"anonymous"` otherwise.
//! 5. Extend the chunk start backwards over the block's preceding sibling
//!    chain while those siblings are comments or decorators/attributes, so
//!    doc comments travel with the code they document.
//! 6. Verify chunk ids are pairwise distinct. A collision is logged here
//!    and rejected again by the vector store before upsert.
//!
//! Chunk ids take the form `"{filePath}:{name}:{nodeType}:L{startLine}"`.

use std::collections::{HashMap, HashSet};
use tree_sitter::{Node, Parser, QueryCursor, StreamingIterator};

use crate::languages::{LanguageSpec, LanguageTable};
use crate::models::CodeChunk;

pub struct Chunker {
    table: LanguageTable,
}

impl Chunker {
    pub fn new() -> Self {
        Self {
            table: LanguageTable::load(),
        }
    }

    pub fn languages(&self) -> &LanguageTable {
        &self.table
    }

    /// Splits `source` into semantic chunks. Returns an empty vector for
    /// unsupported extensions, unparsable input, or sources with no block
    /// captures.
    pub fn split(&self, file_path: &str, source: &str) -> Vec<CodeChunk> {
        let Some(ext) = extension_of(file_path) else {
            return Vec::new();
        };
        let Some(spec) = self.table.for_extension(&ext) else {
            return Vec::new();
        };

        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&spec.language) {
            tracing::warn!(file = file_path, language = spec.name, error = %e, "parser rejected grammar");
            return Vec::new();
        }
        let Some(tree) = parser.parse(source, None) else {
            tracing::warn!(file = file_path, language = spec.name, "parse failed");
            return Vec::new();
        };

        let blocks = collect_blocks(spec, tree.root_node(), source);

        let mut chunks = Vec::with_capacity(blocks.len());
        for (block, name_node) in blocks {
            let name = name_node
                .and_then(|n| node_text(n, source))
                .map(|t| t.trim_matches(&['"', '\''][..]).to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "anonymous".to_string());

            let start = expand_context(block);
            let start_byte = start.start_byte();
            let end_byte = block.end_byte();
            let content = source.get(start_byte..end_byte).unwrap_or("").to_string();

            let start_line = start.start_position().row + 1;
            let end_line = block.end_position().row + 1;
            let chunk_type = block.kind().to_string();
            let id = format!("{file_path}:{name}:{chunk_type}:L{start_line}");

            chunks.push(CodeChunk {
                id,
                chunk_type,
                name,
                content,
                start_line,
                end_line,
            });
        }

        report_duplicate_ids(file_path, &chunks);
        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercased extension without the dot, or `None` when the path has none.
fn extension_of(path: &str) -> Option<String> {
    let file_name = path.rsplit('/').next()?;
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Runs the capture query and returns `(block, name)` pairs in document
/// order. A block node matched by several patterns is emitted once, keeping
/// whichever match carried a name.
fn collect_blocks<'t>(
    spec: &LanguageSpec,
    root: Node<'t>,
    source: &str,
) -> Vec<(Node<'t>, Option<Node<'t>>)> {
    let Some(block_idx) = spec.query.capture_index_for_name("block") else {
        return Vec::new();
    };
    let name_idx = spec.query.capture_index_for_name("name");

    let mut by_node: HashMap<usize, (Node<'t>, Option<Node<'t>>)> = HashMap::new();
    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(&spec.query, root, source.as_bytes());

    while let Some(m) = matches.next() {
        let Some(block) = m
            .captures
            .iter()
            .find(|c| c.index == block_idx)
            .map(|c| c.node)
        else {
            continue;
        };

        let name_node = name_idx.and_then(|idx| {
            m.captures
                .iter()
                .filter(|c| c.index == idx)
                .map(|c| c.node)
                // Prefer an immediate child of the block; fall back to a
                // capture nested inside it (C-family declarators).
                .find(|n| n.parent().map(|p| p.id()) == Some(block.id()))
                .or_else(|| {
                    m.captures
                        .iter()
                        .filter(|c| c.index == idx)
                        .map(|c| c.node)
                        .find(|n| {
                            n.start_byte() >= block.start_byte() && n.end_byte() <= block.end_byte()
                        })
                })
        });

        by_node
            .entry(block.id())
            .and_modify(|(_, existing_name)| {
                if existing_name.is_none() {
                    *existing_name = name_node;
                }
            })
            .or_insert((block, name_node));
    }

    let mut ordered: Vec<_> = by_node.into_values().collect();
    ordered.sort_by_key(|(n, _)| (n.start_byte(), n.end_byte()));
    ordered
}

/// Walks the block's preceding sibling chain and returns the earliest node
/// to include in the chunk: the start of a contiguous run of comments and
/// decorators/attributes immediately above the block.
fn expand_context(block: Node<'_>) -> Node<'_> {
    let mut start = block;
    let mut prev = block.prev_sibling();
    while let Some(p) = prev {
        if !is_context_node(p.kind()) {
            break;
        }
        start = p;
        prev = p.prev_sibling();
    }
    start
}

fn is_context_node(kind: &str) -> bool {
    kind.ends_with("comment")
        || matches!(
            kind,
            "decorator" | "attribute_item" | "attribute_list" | "annotation" | "marker_annotation"
        )
}

fn node_text<'s>(node: Node<'_>, source: &'s str) -> Option<&'s str> {
    source.get(node.start_byte()..node.end_byte())
}

fn report_duplicate_ids(file_path: &str, chunks: &[CodeChunk]) {
    let mut seen = HashSet::new();
    let mut dups = Vec::new();
    for chunk in chunks {
        if !seen.insert(chunk.id.as_str()) {
            dups.push(chunk.id.as_str());
        }
    }
    if !dups.is_empty() {
        tracing::error!(file = file_path, ids = ?dups, "duplicate chunk ids emitted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new()
    }

    #[test]
    fn splits_rust_functions() {
        let source = "fn alpha() -> i32 {\n    1\n}\n\nfn beta() {\n    println!(\"hi\");\n}\n";
        let chunks = chunker().split("src/lib.rs", source);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].name, "alpha");
        assert_eq!(chunks[0].chunk_type, "function_item");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[0].id, "src/lib.rs:alpha:function_item:L1");
        assert_eq!(chunks[1].name, "beta");
        assert!(chunks[1].content.starts_with("fn beta"));
    }

    #[test]
    fn leading_comments_travel_with_the_block() {
        let source = "/// Adds one.\n/// Slowly.\nfn add_one(x: i32) -> i32 {\n    x + 1\n}\n";
        let chunks = chunker().split("math.rs", source);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.starts_with("/// Adds one."));
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].id, "math.rs:add_one:function_item:L1");
    }

    #[test]
    fn rust_attributes_travel_with_the_block() {
        let source = "#[derive(Debug)]\nstruct Point {\n    x: i32,\n}\n";
        let chunks = chunker().split("geo.rs", source);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.starts_with("#[derive(Debug)]"));
        assert_eq!(chunks[0].name, "Point");
    }

    #[test]
    fn python_decorators_travel_with_the_function() {
        let source = "@app.route(\"/\")\n@cached\ndef index():\n    return \"ok\"\n";
        let chunks = chunker().split("app.py", source);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "index");
        assert!(chunks[0].content.starts_with("@app.route"));
        assert_eq!(chunks[0].start_line, 1);
    }

    #[test]
    fn python_class_and_methods() {
        let source = "class Greeter:\n    def hello(self):\n        return \"hi\"\n\n    def bye(self):\n        return \"bye\"\n";
        let chunks = chunker().split("greet.py", source);
        let names: Vec<&str> = chunks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"Greeter"));
        assert!(names.contains(&"hello"));
        assert!(names.contains(&"bye"));
    }

    #[test]
    fn typescript_interface_and_arrow_function() {
        let source = "interface Config {\n  name: string;\n}\n\nconst load = (path: string): Config => {\n  return { name: path };\n};\n";
        let chunks = chunker().split("config.ts", source);
        let names: Vec<&str> = chunks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"Config"));
        assert!(names.contains(&"load"));
        let iface = chunks.iter().find(|c| c.name == "Config").unwrap();
        assert_eq!(iface.chunk_type, "interface_declaration");
    }

    #[test]
    fn impl_blocks_take_their_type_name() {
        let source = "struct S;\n\nimpl S {\n    fn new() -> Self {\n        S\n    }\n}\n";
        let chunks = chunker().split("s.rs", source);
        let impl_chunk = chunks
            .iter()
            .find(|c| c.chunk_type == "impl_item")
            .expect("impl block captured");
        assert_eq!(impl_chunk.name, "S");
        // The method inside it is still captured on its own.
        assert!(chunks.iter().any(|c| c.name == "new"));
    }

    #[test]
    fn generic_impl_blocks_fall_back_to_anonymous() {
        let source = "struct W<T>(T);\n\nimpl<T> W<T> {\n    fn get(self) -> T {\n        self.0\n    }\n}\n";
        let chunks = chunker().split("w.rs", source);
        // The impl type is a generic_type, so the name pattern cannot bind.
        let impl_chunk = chunks
            .iter()
            .find(|c| c.chunk_type == "impl_item")
            .expect("impl block captured");
        assert_eq!(impl_chunk.name, "anonymous");
    }

    #[test]
    fn unknown_extension_yields_empty() {
        assert!(chunker().split("data.zig", "fn main() void {}").is_empty());
        assert!(chunker().split("Makefile", "all:\n\ttrue").is_empty());
    }

    #[test]
    fn json_top_level_pairs_become_chunks() {
        let source = "{\n  \"name\": \"demo\",\n  \"scripts\": {\n    \"build\": \"tsc\"\n  }\n}\n";
        let chunks = chunker().split("package.json", source);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].name, "name");
        assert_eq!(chunks[1].name, "scripts");
    }

    #[test]
    fn duplicate_ids_are_emitted_not_dropped() {
        // Two same-named functions on one line collide on every id field.
        let source = "fn a() {} fn a() {}\n";
        let chunks = chunker().split("dup.rs", source);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, chunks[1].id);
    }

    #[test]
    fn go_methods_use_field_identifier_names() {
        let source = "package main\n\nfunc (s *Server) Start() error {\n\treturn nil\n}\n";
        let chunks = chunker().split("server.go", source);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "Start");
        assert_eq!(chunks[0].chunk_type, "method_declaration");
    }

    #[test]
    fn c_function_names_resolve_through_declarator() {
        let source = "static int add(int a, int b) {\n    return a + b;\n}\n";
        let chunks = chunker().split("add.c", source);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "add");
    }

    #[test]
    fn chunks_are_in_document_order() {
        let source = "fn z() {}\n\nfn a() {}\n\nfn m() {}\n";
        let chunks = chunker().split("order.rs", source);
        let names: Vec<&str> = chunks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn extension_is_case_insensitive() {
        let source = "fn x() {}\n";
        let chunks = chunker().split("weird.RS", source);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn extension_of_edge_cases() {
        assert_eq!(extension_of("a/b/c.ts"), Some("ts".into()));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of(".gitignore"), None);
        assert_eq!(extension_of("trailing."), None);
        assert_eq!(extension_of("X.TSX"), Some("tsx".into()));
    }
}
