use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use semver::Version;

use crate::resolve::graph::{self, Edges};
use crate::source::PinnedPackage;

/// The outcome of a resolution: one pinned version per package name, plus
/// the names each package depends on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSet {
    packages: BTreeMap<String, PinnedPackage>,
    edges: Edges,
}

impl ResolvedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for the package's name, without dependencies
    pub fn insert(&mut self, package: PinnedPackage) -> Option<PinnedPackage> {
        self.insert_with_dependencies(package, BTreeSet::new())
    }

    pub fn insert_with_dependencies(
        &mut self,
        package: PinnedPackage,
        dependencies: BTreeSet<String>,
    ) -> Option<PinnedPackage> {
        if dependencies.is_empty() {
            self.edges.remove(&package.name);
        } else {
            self.edges.insert(package.name.clone(), dependencies);
        }
        self.packages.insert(package.name.clone(), package)
    }

    /// Names `name` depends on; empty for leaves and unknown names
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &String> {
        self.edges.get(name).into_iter().flatten()
    }

    /// Every package reachable from `roots` through recorded dependencies, roots included
    pub fn reachable_from<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        graph::reachable(roots, &self.edges)
    }

    /// Indented dependency tree below `roots`. A package already printed
    /// higher up on the same branch is marked instead of expanded again.
    pub fn render_tree(&self, roots: &[String]) -> String {
        let mut out = String::new();
        let mut path = Vec::new();
        for root in roots {
            self.render_node(root, 0, &mut path, &mut out);
        }
        out
    }

    fn render_node<'a>(&'a self, name: &'a str, depth: usize, path: &mut Vec<&'a str>, out: &mut String) {
        let indent = "  ".repeat(depth);
        let label = match self.version_of(name) {
            Some(version) => format!("{name}@{version}"),
            None => format!("{name} (not resolved)"),
        };
        if path.contains(&name) {
            let _ = writeln!(out, "{indent}{label} (cycle)");
            return;
        }
        let _ = writeln!(out, "{indent}{label}");
        path.push(name);
        for dep in self.dependencies_of(name) {
            self.render_node(dep, depth + 1, path, out);
        }
        path.pop();
    }

    pub fn get(&self, name: &str) -> Option<&PinnedPackage> {
        self.packages.get(name)
    }

    pub fn version_of(&self, name: &str) -> Option<&Version> {
        self.packages.get(name).map(|p| &p.version)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Packages in name order
    pub fn iter(&self) -> impl Iterator<Item = &PinnedPackage> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

impl FromIterator<PinnedPackage> for ResolvedSet {
    fn from_iter<I: IntoIterator<Item = PinnedPackage>>(iter: I) -> Self {
        let mut set = Self::new();
        for package in iter {
            set.insert(package);
        }
        set
    }
}

impl<'a> IntoIterator for &'a ResolvedSet {
    type Item = &'a PinnedPackage;
    type IntoIter = std::collections::btree_map::Values<'a, String, PinnedPackage>;

    fn into_iter(self) -> Self::IntoIter {
        self.packages.values()
    }
}
