//! depot.toml parser

use std::ops::Range;

use tracing::warn;

use crate::manifest::ManifestError;
use crate::manifest::types::{DependencyEntry, DependencyTable, Manifest};

/// Trait for parsing manifest files
pub trait ManifestReader {
    fn parse(&self, content: &str) -> Result<Manifest, ManifestError>;
}

/// Parser for depot.toml files
pub struct TomlManifestReader;

impl TomlManifestReader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TomlManifestReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestReader for TomlManifestReader {
    fn parse(&self, content: &str) -> Result<Manifest, ManifestError> {
        let mut parser = tree_sitter::Parser::new();
        let language = tree_sitter_toml_ng::LANGUAGE;
        parser.set_language(&language.into()).map_err(|e| {
            warn!("Failed to set TOML language for tree-sitter: {}", e);
            ManifestError::TreeSitter(e.to_string())
        })?;

        let tree = parser.parse(content, None).ok_or_else(|| {
            warn!("Failed to parse TOML content");
            ManifestError::ParseFailed("Failed to parse TOML".to_string())
        })?;

        let root = tree.root_node();
        if root.has_error() {
            let point = first_error(root).unwrap_or(root.start_position());
            return Err(ManifestError::InvalidSyntax {
                line: point.row + 1,
                column: point.column + 1,
            });
        }

        let mut manifest = Manifest::default();
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            if child.kind() == "table" {
                self.process_table(child, content, &mut manifest);
            }
        }

        Ok(manifest)
    }
}

/// Position of the first error or missing node
fn first_error(node: tree_sitter::Node) -> Option<tree_sitter::Point> {
    if node.is_error() || node.is_missing() {
        return Some(node.start_position());
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error()
            && let Some(point) = first_error(child)
        {
            return Some(point);
        }
    }
    None
}

/// Text of a key node with quotes removed
fn key_text(node: tree_sitter::Node, content: &str) -> String {
    let text = &content[node.byte_range()];
    match node.kind() {
        "quoted_key" => unquote(text).0.to_string(),
        _ => text.to_string(),
    }
}

/// Strip string delimiters, returning the inner text and its offset within `text`
fn unquote(text: &str) -> (&str, usize) {
    for delimiter in ["\"\"\"", "'''", "\"", "'"] {
        if text.len() >= 2 * delimiter.len()
            && let Some(inner) = text
                .strip_prefix(delimiter)
                .and_then(|t| t.strip_suffix(delimiter))
        {
            return (inner, delimiter.len());
        }
    }
    (text, 0)
}

/// Inner value and its byte range for a `string` node
fn string_value(node: tree_sitter::Node, content: &str) -> (String, Range<usize>) {
    let (inner, offset) = unquote(&content[node.byte_range()]);
    let start = node.start_byte() + offset;
    (inner.to_string(), start..start + inner.len())
}

impl TomlManifestReader {
    /// Keys that mark a dependency this manifest format does not resolve
    const SKIP_KEYS: [&'static str; 1] = ["path"];

    fn process_table(&self, table_node: tree_sitter::Node, content: &str, manifest: &mut Manifest) {
        let Some(header) = table_node.child(0) else {
            return;
        };
        if header.kind() != "[" {
            return;
        }

        let mut cursor = table_node.walk();
        let Some(name) = table_node
            .children(&mut cursor)
            .find(|c| matches!(c.kind(), "bare_key" | "dotted_key" | "quoted_key"))
            .map(|c| key_text(c, content))
        else {
            return;
        };

        if name == "package" {
            self.process_package(table_node, content, manifest);
            return;
        }

        let Some(table) = DependencyTable::from_header(&name) else {
            return;
        };
        manifest.table_ends.push((table, table_node.end_byte()));

        let mut cursor = table_node.walk();
        for child in table_node.children(&mut cursor) {
            if child.kind() == "pair"
                && let Some((dep, entry)) = self.extract_dependency(child, content)
            {
                manifest.table_mut(table).insert(dep, entry);
            }
        }
    }

    fn process_package(&self, table_node: tree_sitter::Node, content: &str, manifest: &mut Manifest) {
        let mut cursor = table_node.walk();
        for pair in table_node.children(&mut cursor) {
            if pair.kind() != "pair" {
                continue;
            }
            let mut pair_cursor = pair.walk();
            let mut key: Option<String> = None;
            for child in pair.children(&mut pair_cursor) {
                match child.kind() {
                    "bare_key" | "quoted_key" => key = Some(key_text(child, content)),
                    "string" => {
                        let (value, _) = string_value(child, content);
                        match key.as_deref() {
                            Some("name") => manifest.name = Some(value),
                            Some("version") => manifest.version = Some(value),
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Extract a dependency from a key-value pair
    fn extract_dependency(
        &self,
        pair_node: tree_sitter::Node,
        content: &str,
    ) -> Option<(String, DependencyEntry)> {
        let mut cursor = pair_node.walk();
        let mut name: Option<String> = None;
        let mut dotted_suffix: Option<String> = None;
        let mut value: Option<(String, Range<usize>)> = None;

        for child in pair_node.children(&mut cursor) {
            match child.kind() {
                "bare_key" | "quoted_key" => name = Some(key_text(child, content)),
                "dotted_key" => {
                    // a.version = "1.0"
                    let text = &content[child.byte_range()];
                    if let Some((pkg, suffix)) = text.rsplit_once('.') {
                        name = Some(unquote(pkg.trim()).0.to_string());
                        dotted_suffix = Some(suffix.trim().to_string());
                    }
                }
                "string" => {
                    if dotted_suffix.is_none() || dotted_suffix.as_deref() == Some("version") {
                        value = Some(string_value(child, content));
                    }
                }
                "inline_table" => value = self.extract_version_from_inline_table(child, content),
                _ => {}
            }
        }

        let name = name?;
        let Some((requirement, value_range)) = value else {
            warn!("Skipping dependency {} without a version requirement", name);
            return None;
        };
        Some((
            name,
            DependencyEntry {
                requirement,
                pair_range: pair_node.byte_range(),
                value_range,
            },
        ))
    }

    /// Extract version from an inline table: { version = "1.0" }
    fn extract_version_from_inline_table(
        &self,
        table_node: tree_sitter::Node,
        content: &str,
    ) -> Option<(String, Range<usize>)> {
        let mut version = None;
        let mut cursor = table_node.walk();
        for child in table_node.children(&mut cursor) {
            if child.kind() != "pair" {
                continue;
            }
            let mut pair_cursor = child.walk();
            let mut key: Option<String> = None;
            for pair_child in child.children(&mut pair_cursor) {
                match pair_child.kind() {
                    "bare_key" | "quoted_key" => {
                        let k = key_text(pair_child, content);
                        if Self::SKIP_KEYS.contains(&k.as_str()) {
                            return None;
                        }
                        key = Some(k);
                    }
                    "string" if key.as_deref() == Some("version") => {
                        version = Some(string_value(pair_child, content));
                    }
                    _ => {}
                }
            }
        }
        version
    }
}
