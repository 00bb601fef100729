use std::ops::Range;

use indexmap::IndexMap;

/// Which dependency table an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyTable {
    Dependencies,
    DevDependencies,
}

impl DependencyTable {
    pub fn header(&self) -> &'static str {
        match self {
            DependencyTable::Dependencies => "dependencies",
            DependencyTable::DevDependencies => "dev-dependencies",
        }
    }

    pub fn from_header(header: &str) -> Option<Self> {
        match header {
            "dependencies" => Some(DependencyTable::Dependencies),
            "dev-dependencies" => Some(DependencyTable::DevDependencies),
            _ => None,
        }
    }
}

/// One declared dependency and where it sits in the source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEntry {
    pub requirement: String,
    /// Byte range of the whole `key = value` pair
    pub pair_range: Range<usize>,
    /// Byte range of the requirement text, excluding quotes
    pub value_range: Range<usize>,
}

/// Parsed `depot.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<String>,
    /// Declaration order is preserved
    pub dependencies: IndexMap<String, DependencyEntry>,
    pub dev_dependencies: IndexMap<String, DependencyEntry>,
    /// End byte of each dependency table present in the file
    pub table_ends: Vec<(DependencyTable, usize)>,
}

impl Manifest {
    pub fn table(&self, table: DependencyTable) -> &IndexMap<String, DependencyEntry> {
        match table {
            DependencyTable::Dependencies => &self.dependencies,
            DependencyTable::DevDependencies => &self.dev_dependencies,
        }
    }

    pub(crate) fn table_mut(
        &mut self,
        table: DependencyTable,
    ) -> &mut IndexMap<String, DependencyEntry> {
        match table {
            DependencyTable::Dependencies => &mut self.dependencies,
            DependencyTable::DevDependencies => &mut self.dev_dependencies,
        }
    }

    pub fn table_end(&self, table: DependencyTable) -> Option<usize> {
        self.table_ends
            .iter()
            .find(|(t, _)| *t == table)
            .map(|(_, end)| *end)
    }

    /// Root requirements as `name -> requirement text`
    pub fn requirements(&self, include_dev: bool) -> IndexMap<String, String> {
        let mut out: IndexMap<String, String> = self
            .dependencies
            .iter()
            .map(|(name, entry)| (name.clone(), entry.requirement.clone()))
            .collect();
        if include_dev {
            for (name, entry) in &self.dev_dependencies {
                out.entry(name.clone())
                    .or_insert_with(|| entry.requirement.clone());
            }
        }
        out
    }
}
