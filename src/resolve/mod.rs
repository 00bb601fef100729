//! Dependency resolution
//!
//! Breadth-first expansion in rounds. Each round fetches version listings for
//! the names whose demands changed, picks the newest version satisfying every
//! live demand (locked versions and the `latest` policy take precedence when
//! viable), then fetches metadata for the new selections and merges their
//! dependency edges. Fetches within a round run concurrently, bounded by the
//! fetcher's worker count; merging is sequential and in name order, so the
//! result only depends on the metadata, never on fetch timing.
//!
//! Whenever the demands on a name change, in either direction, its selection
//! is recomputed from the live demands alone. A selection that is replaced has
//! its own edges withdrawn, which may loosen other names and let them move
//! back up. Each version may be given up at most [`MAX_RETRACTIONS`] times per
//! run before it stops being a candidate, which bounds the work on graphs that
//! would otherwise oscillate. Names left without a viable version are reported
//! together as conflicts once expansion settles; cycles among the selected
//! packages are reported afterwards.

pub mod error;
pub mod graph;
pub mod resolved;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use semver::Version;
use tracing::{debug, info};

use crate::source::{FetchError, PackageMetadata, SourceFetcher, VersionListing};
use crate::version::{Requirement, SelectionPolicy};

pub use error::{Conflict, Demand, ROOT_REQUESTER, ResolveError};
pub use resolved::ResolvedSet;

/// Times one version may be selected and given up before it is excluded for the run
pub const MAX_RETRACTIONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Requester {
    Root,
    Package(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Edge {
    /// Version of the requiring package; `None` for the root
    from_version: Option<Version>,
    requirement: Requirement,
}

#[derive(Default)]
struct State {
    demands: BTreeMap<String, BTreeMap<Requester, Edge>>,
    listings: HashMap<String, Arc<VersionListing>>,
    selected: BTreeMap<String, Version>,
    expanded: BTreeMap<String, Arc<PackageMetadata>>,
    /// How often each version was selected and then given up during this run
    retractions: BTreeMap<String, BTreeMap<Version, usize>>,
    queue: BTreeSet<String>,
}

impl State {
    fn add_demand(&mut self, name: &str, requester: Requester, edge: Edge) {
        let demands = self.demands.entry(name.to_string()).or_default();
        if demands.get(&requester) != Some(&edge) {
            demands.insert(requester, edge);
            self.queue.insert(name.to_string());
        }
    }

    fn is_exhausted(&self, name: &str, version: &Version) -> bool {
        self.retractions
            .get(name)
            .and_then(|counts| counts.get(version))
            .is_some_and(|count| *count >= MAX_RETRACTIONS)
    }

    /// Give up the current selection of `name` and withdraw its edges
    fn deselect(&mut self, name: &str) -> Option<Version> {
        let version = self.selected.remove(name)?;
        *self
            .retractions
            .entry(name.to_string())
            .or_default()
            .entry(version.clone())
            .or_default() += 1;
        self.retract(name);
        Some(version)
    }

    /// Withdraw every edge contributed by `name`
    fn retract(&mut self, name: &str) {
        let requester = Requester::Package(name.to_string());
        for (target, demands) in self.demands.iter_mut() {
            if demands.remove(&requester).is_some() {
                self.queue.insert(target.clone());
            }
        }
        self.expanded.remove(name);
    }

    fn expand(&mut self, metadata: Arc<PackageMetadata>) {
        if self.selected.get(&metadata.name) != Some(&metadata.version) {
            return;
        }
        for (dep, requirement) in &metadata.dependencies {
            self.add_demand(
                dep,
                Requester::Package(metadata.name.clone()),
                Edge {
                    from_version: Some(metadata.version.clone()),
                    requirement: requirement.clone(),
                },
            );
        }
        self.expanded.insert(metadata.name.clone(), metadata);
    }
}

pub struct Resolver<'a> {
    fetcher: &'a SourceFetcher,
    preferences: BTreeMap<String, Version>,
}

impl<'a> Resolver<'a> {
    pub fn new(fetcher: &'a SourceFetcher) -> Self {
        Self {
            fetcher,
            preferences: BTreeMap::new(),
        }
    }

    /// Prefer these versions (typically from the lock file) while they stay viable
    pub fn with_preferences(mut self, locked: &ResolvedSet) -> Self {
        self.preferences = locked
            .iter()
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect();
        self
    }

    pub async fn resolve(
        &self,
        direct: &IndexMap<String, Requirement>,
    ) -> Result<ResolvedSet, ResolveError> {
        let mut state = State::default();
        for (name, requirement) in direct {
            state.add_demand(
                name,
                Requester::Root,
                Edge {
                    from_version: None,
                    requirement: requirement.clone(),
                },
            );
        }

        let mut round = 0usize;
        while !state.queue.is_empty() {
            if self.fetcher.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }
            round += 1;
            let names: Vec<String> = std::mem::take(&mut state.queue).into_iter().collect();
            debug!("Resolution round {} over {} names", round, names.len());

            self.fetch_listings(&names, &mut state).await?;

            let selections: Vec<(String, Version)> = names
                .iter()
                .filter_map(|name| self.select(name, &mut state).map(|v| (name.clone(), v)))
                .collect();

            for metadata in self.fetch_metadata(&selections).await? {
                state.expand(metadata);
            }
        }

        let resolved = self.finish(direct, &state)?;
        info!(
            "Resolved {} packages in {} rounds",
            resolved.len(),
            round
        );
        Ok(resolved)
    }

    async fn fetch_listings(&self, names: &[String], state: &mut State) -> Result<(), ResolveError> {
        let missing: Vec<&String> = names
            .iter()
            .filter(|name| !state.listings.contains_key(*name))
            .filter(|name| state.demands.get(*name).is_some_and(|d| !d.is_empty()))
            .collect();

        let mut results: Vec<(&String, Result<Arc<VersionListing>, FetchError>)> =
            stream::iter(missing)
                .map(|name| async move { (name, self.fetcher.fetch_versions(name).await) })
                .buffer_unordered(self.fetcher.workers())
                .collect()
                .await;
        results.sort_by(|a, b| a.0.cmp(b.0));

        for (name, result) in results {
            let listing = result.map_err(|e| ResolveError::fetch(name, e))?;
            state.listings.insert(name.clone(), listing);
        }
        Ok(())
    }

    async fn fetch_metadata(
        &self,
        selections: &[(String, Version)],
    ) -> Result<Vec<Arc<PackageMetadata>>, ResolveError> {
        let results: Vec<Result<Arc<PackageMetadata>, ResolveError>> = stream::iter(selections)
            .map(|(name, version)| async move {
                self.fetcher
                    .fetch_metadata(name, version)
                    .await
                    .map_err(|e| ResolveError::fetch(&format!("{name}@{version}"), e))
            })
            .buffered(self.fetcher.workers())
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Re-evaluate the selection for `name` against its live demands,
    /// returning a newly selected version
    fn select(&self, name: &str, state: &mut State) -> Option<Version> {
        let requirements: Vec<Requirement> = state
            .demands
            .get(name)
            .map(|d| d.values().map(|edge| edge.requirement.clone()).collect())
            .unwrap_or_default();

        if requirements.is_empty() {
            if state.deselect(name).is_some() {
                debug!("{} is no longer required", name);
            }
            return None;
        }

        let choice = state.listings.get(name).and_then(|listing| {
            let viable: Vec<&Version> = listing
                .versions
                .iter()
                .filter(|v| !state.is_exhausted(name, v))
                .filter(|v| requirements.iter().all(|r| r.satisfies(v)))
                .collect();
            self.choose(name, listing, &viable, &requirements)
        });

        let current = state.selected.get(name).cloned();
        if current == choice {
            return None;
        }
        if let Some(current) = current {
            if requirements.iter().all(|r| r.satisfies(&current)) {
                debug!("{}@{} is no longer the best candidate", name, current);
            } else {
                debug!("{}@{} no longer satisfies every demand", name, current);
            }
            state.deselect(name);
        }

        let choice = choice?;
        debug!("Selected {}@{}", name, choice);
        state.selected.insert(name.to_string(), choice.clone());
        Some(choice)
    }

    fn choose(
        &self,
        name: &str,
        listing: &VersionListing,
        viable: &[&Version],
        requirements: &[Requirement],
    ) -> Option<Version> {
        if let Some(preferred) = self.preferences.get(name)
            && viable.contains(&preferred)
        {
            return Some(preferred.clone());
        }

        if requirements
            .iter()
            .any(|r| r.policy == SelectionPolicy::Latest)
            && let Some(latest) = &listing.latest
            && viable.contains(&latest)
        {
            return Some(latest.clone());
        }

        // Listings are ascending
        viable.last().map(|v| (*v).clone())
    }

    fn finish(
        &self,
        direct: &IndexMap<String, Requirement>,
        state: &State,
    ) -> Result<ResolvedSet, ResolveError> {
        let edges: graph::Edges = state
            .expanded
            .iter()
            .map(|(name, metadata)| (name.clone(), metadata.dependencies.keys().cloned().collect()))
            .collect();
        let reachable = graph::reachable(direct.keys().map(String::as_str), &edges);

        let conflicts: Vec<Conflict> = state
            .demands
            .iter()
            .filter(|(name, _)| reachable.contains(*name) && !state.expanded.contains_key(*name))
            .filter_map(|(name, demands)| {
                let demands: Vec<Demand> = demands
                    .iter()
                    .filter_map(|(requester, edge)| {
                        let requester = match requester {
                            Requester::Root => ROOT_REQUESTER.to_string(),
                            Requester::Package(from) if reachable.contains(from) => {
                                match &edge.from_version {
                                    Some(version) => format!("{from}@{version}"),
                                    None => from.clone(),
                                }
                            }
                            Requester::Package(_) => return None,
                        };
                        Some(Demand {
                            requester,
                            requirement: edge.requirement.to_string(),
                        })
                    })
                    .collect();
                (!demands.is_empty()).then(|| Conflict {
                    package: name.clone(),
                    demands,
                })
            })
            .collect();
        if !conflicts.is_empty() {
            return Err(ResolveError::Conflict(conflicts));
        }

        let reachable_edges: graph::Edges = edges
            .into_iter()
            .filter(|(name, _)| reachable.contains(name))
            .collect();
        let cycles = graph::find_cycles(&reachable_edges);
        if !cycles.is_empty() {
            return Err(ResolveError::Cycle(cycles));
        }

        let mut resolved = ResolvedSet::new();
        for metadata in reachable.iter().filter_map(|name| state.expanded.get(name)) {
            resolved.insert_with_dependencies(
                metadata.pinned(),
                metadata.dependencies.keys().cloned().collect(),
            );
        }
        Ok(resolved)
    }
}
