use std::fmt;

use thiserror::Error;

use crate::source::FetchError;

/// Label used for demands declared directly by the project
pub const ROOT_REQUESTER: &str = "(root)";

/// One edge's demand on a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Demand {
    /// `name@version` of the requiring package, or `(root)`
    pub requester: String,
    pub requirement: String,
}

/// A package for which no version satisfies every demand at once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub package: String,
    pub demands: Vec<Demand>,
}

impl Conflict {
    /// Whether `name` (with or without a version) is among the requesters
    pub fn is_required_by(&self, name: &str) -> bool {
        self.demands.iter().any(|d| {
            d.requester == name
                || d.requester
                    .rsplit_once('@')
                    .is_some_and(|(requester, _)| requester == name)
        })
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no version of {} satisfies ", self.package)?;
        for (i, demand) in self.demands.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} (required by {})", demand.requirement, demand.requester)?;
        }
        Ok(())
    }
}

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let mut path = cycle.clone();
            if let Some(first) = cycle.first() {
                path.push(first.clone());
            }
            path.join(" -> ")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Unsatisfiable dependencies: {}", join(.0, "; "))]
    Conflict(Vec<Conflict>),

    #[error("Dependency cycle: {}", format_cycles(.0))]
    Cycle(Vec<Vec<String>>),

    #[error("Failed to fetch {name}: {source}")]
    Fetch {
        name: String,
        #[source]
        source: FetchError,
    },

    #[error("Resolution cancelled")]
    Cancelled,
}

impl ResolveError {
    pub(crate) fn fetch(name: &str, source: FetchError) -> Self {
        match source {
            FetchError::Cancelled => ResolveError::Cancelled,
            source => ResolveError::Fetch {
                name: name.to_string(),
                source,
            },
        }
    }
}
