//! Text-preserving edits to depot.toml
//!
//! Edits splice byte ranges reported by the reader, so comments and
//! formatting elsewhere in the file are left untouched.

use std::sync::LazyLock;

use regex::Regex;

use crate::manifest::ManifestError;
use crate::manifest::reader::{ManifestReader, TomlManifestReader};
use crate::manifest::types::DependencyTable;

static BARE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("bare key pattern is valid"));

fn format_key(name: &str) -> String {
    if BARE_KEY.is_match(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Byte offset just past the newline ending the line that contains `offset`
fn line_end(content: &str, offset: usize) -> usize {
    content[offset..]
        .find('\n')
        .map_or(content.len(), |i| offset + i + 1)
}

/// Add `name = "requirement"` to `table`, or update the requirement in place
pub fn set_dependency(
    content: &str,
    table: DependencyTable,
    name: &str,
    requirement: &str,
) -> Result<String, ManifestError> {
    let manifest = TomlManifestReader::new().parse(content)?;

    if let Some(entry) = manifest.table(table).get(name) {
        let mut out = String::with_capacity(content.len() + requirement.len());
        out.push_str(&content[..entry.value_range.start]);
        out.push_str(requirement);
        out.push_str(&content[entry.value_range.end..]);
        return Ok(out);
    }

    let line = format!("{} = \"{}\"\n", format_key(name), requirement);
    let mut out = String::with_capacity(content.len() + line.len() + 32);

    // After the last declared entry, so trailing blank lines stay between tables
    let insert_at = manifest
        .table(table)
        .values()
        .map(|entry| line_end(content, entry.pair_range.end))
        .max()
        .or(manifest.table_end(table));

    match insert_at {
        Some(end) => {
            out.push_str(&content[..end]);
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&line);
            out.push_str(&content[end..]);
        }
        None => {
            out.push_str(content);
            if !out.is_empty() {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", table.header()));
            out.push_str(&line);
        }
    }
    Ok(out)
}

/// Remove `name` from every dependency table. Returns `None` if it was not declared.
pub fn remove_dependency(content: &str, name: &str) -> Result<Option<String>, ManifestError> {
    let manifest = TomlManifestReader::new().parse(content)?;

    let mut ranges: Vec<(usize, usize)> = [
        DependencyTable::Dependencies,
        DependencyTable::DevDependencies,
    ]
    .iter()
    .filter_map(|table| manifest.table(*table).get(name))
    .map(|entry| {
        let start = content[..entry.pair_range.start]
            .rfind('\n')
            .map_or(0, |i| i + 1);
        (start, line_end(content, entry.pair_range.end))
    })
    .collect();

    if ranges.is_empty() {
        return Ok(None);
    }

    ranges.sort();
    let mut out = content.to_string();
    for (start, end) in ranges.into_iter().rev() {
        out.replace_range(start..end, "");
    }
    Ok(Some(out))
}
