//! Resolver behavior over an in-memory registry

mod helper;

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use depot::lockfile;
use depot::resolve::{ResolveError, Resolver};
use depot::source::FetchError;
use depot::version::Requirement;
use helper::MemorySource;

fn direct(pairs: &[(&str, &str)]) -> IndexMap<String, Requirement> {
    pairs
        .iter()
        .map(|(name, req)| (name.to_string(), Requirement::parse(req).unwrap()))
        .collect()
}

fn scenario_registry() -> MemorySource {
    MemorySource::new()
        .publish("a", "1.0.0", &[("b", "~2.0.0")])
        .publish("a", "1.1.0", &[("b", "~2.0.0")])
        .publish("a", "1.2.0", &[("b", "~2.0.0")])
        .publish("b", "2.0.0", &[])
        .publish("b", "2.0.1", &[])
        .publish("b", "2.1.0", &[])
}

#[tokio::test]
async fn picks_highest_satisfying_version_of_each_package() {
    let source = Arc::new(scenario_registry());
    let fetcher = helper::fetcher(source.clone());

    let resolved = Resolver::new(&fetcher)
        .resolve(&direct(&[("a", "^1.0.0")]))
        .await
        .unwrap();

    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved.version_of("a").unwrap().to_string(), "1.2.0");
    assert_eq!(resolved.version_of("b").unwrap().to_string(), "2.0.1");
    assert_eq!(
        resolved.get("b").unwrap().integrity,
        source.integrity_of("b", "2.0.1")
    );
}

#[tokio::test]
async fn same_inputs_produce_identical_lock_bytes() {
    let first = {
        let fetcher = helper::fetcher(Arc::new(scenario_registry()));
        Resolver::new(&fetcher)
            .resolve(&direct(&[("a", "^1.0.0"), ("b", "*")]))
            .await
            .unwrap()
    };
    let second = {
        let fetcher = helper::fetcher(Arc::new(scenario_registry()));
        Resolver::new(&fetcher)
            .resolve(&direct(&[("b", "*"), ("a", "^1.0.0")]))
            .await
            .unwrap()
    };

    assert_eq!(
        lockfile::render(&first).unwrap(),
        lockfile::render(&second).unwrap()
    );
}

#[tokio::test]
async fn shared_dependency_metadata_is_fetched_once() {
    let source = Arc::new(
        MemorySource::new()
            .publish("a", "1.0.0", &[("c", "^1.0.0")])
            .publish("b", "1.0.0", &[("c", "^1.0.0")])
            .publish("c", "1.0.0", &[]),
    );
    let fetcher = helper::fetcher(source.clone());

    let resolved = Resolver::new(&fetcher)
        .resolve(&direct(&[("a", "*"), ("b", "*")]))
        .await
        .unwrap();

    assert_eq!(resolved.len(), 3);
    assert_eq!(source.version_fetches(), 3);
    assert_eq!(source.metadata_fetches(), 3);
}

#[tokio::test]
async fn exclusive_requirements_on_shared_dependency_name_both_requesters() {
    let fetcher = helper::fetcher(Arc::new(
        MemorySource::new()
            .publish("a", "1.0.0", &[("c", "^1.0.0")])
            .publish("b", "1.0.0", &[("c", "^2.0.0")])
            .publish("c", "1.5.0", &[])
            .publish("c", "2.3.0", &[]),
    ));

    let err = Resolver::new(&fetcher)
        .resolve(&direct(&[("a", "^1.0.0"), ("b", "^1.0.0")]))
        .await
        .unwrap_err();

    let ResolveError::Conflict(conflicts) = err else {
        panic!("expected a conflict, got {err:?}");
    };
    let conflict = conflicts.iter().find(|c| c.package == "c").unwrap();
    assert!(conflict.is_required_by("a"));
    assert!(conflict.is_required_by("b"));
    let message = conflict.to_string();
    assert!(message.contains("^1.0.0") && message.contains("^2.0.0"));
}

/// `x@2` pins `a` below its only release until `y` forces `x` down to 1.0.0
fn withdrawn_pin_registry() -> MemorySource {
    MemorySource::new()
        .publish("a", "2.0.0", &[])
        .publish("x", "1.0.0", &[])
        .publish("x", "2.0.0", &[("a", "^1.0.0")])
        .publish("y", "1.0.0", &[("x", "^1.0.0")])
}

#[tokio::test]
async fn version_ruled_out_by_a_withdrawn_demand_is_selected_again() {
    let fetcher = helper::fetcher(Arc::new(withdrawn_pin_registry()));

    let resolved = Resolver::new(&fetcher)
        .resolve(&direct(&[("a", "*"), ("x", "*"), ("y", "*")]))
        .await
        .unwrap();

    assert_eq!(resolved.version_of("a").unwrap().to_string(), "2.0.0");
    assert_eq!(resolved.version_of("x").unwrap().to_string(), "1.0.0");
    assert_eq!(resolved.version_of("y").unwrap().to_string(), "1.0.0");
}

#[tokio::test]
async fn narrowing_is_undone_when_its_cause_goes_away() {
    let fetcher = helper::fetcher(Arc::new(
        withdrawn_pin_registry().publish("a", "1.0.0", &[]),
    ));

    let resolved = Resolver::new(&fetcher)
        .resolve(&direct(&[("a", "*"), ("x", "*"), ("y", "*")]))
        .await
        .unwrap();

    assert_eq!(resolved.version_of("a").unwrap().to_string(), "2.0.0");
    assert_eq!(resolved.version_of("x").unwrap().to_string(), "1.0.0");
}

#[tokio::test]
async fn diamond_with_a_transient_pin_settles_on_highest_versions() {
    let fetcher = helper::fetcher(Arc::new(
        MemorySource::new()
            .publish("left", "1.0.0", &[("base", "^1.0.0")])
            .publish("left", "2.0.0", &[("base", "~1.0.0")])
            .publish("right", "1.0.0", &[("base", "^1.0.0"), ("left", "^1.0.0")])
            .publish("base", "1.0.0", &[])
            .publish("base", "1.4.0", &[]),
    ));

    let resolved = Resolver::new(&fetcher)
        .resolve(&direct(&[("left", "*"), ("right", "*")]))
        .await
        .unwrap();

    assert_eq!(resolved.version_of("left").unwrap().to_string(), "1.0.0");
    assert_eq!(resolved.version_of("base").unwrap().to_string(), "1.4.0");
}

#[tokio::test]
async fn oscillating_requirements_end_in_a_conflict() {
    let fetcher = helper::fetcher(Arc::new(
        MemorySource::new()
            .publish("a", "1.0.0", &[("b", "^2.0.0")])
            .publish("a", "2.0.0", &[("b", "^1.0.0")])
            .publish("b", "1.0.0", &[("a", "^1.0.0")])
            .publish("b", "2.0.0", &[("a", "^2.0.0")]),
    ));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Resolver::new(&fetcher).resolve(&direct(&[("a", "*"), ("b", "*")])),
    )
    .await
    .expect("resolution must terminate");

    assert!(matches!(result, Err(ResolveError::Conflict(_))), "{result:?}");
}

#[tokio::test]
async fn mutual_dependency_is_reported_as_cycle() {
    let fetcher = helper::fetcher(Arc::new(
        MemorySource::new()
            .publish("a", "1.0.0", &[("b", "*")])
            .publish("b", "1.0.0", &[("a", "*")]),
    ));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Resolver::new(&fetcher).resolve(&direct(&[("a", "*")])),
    )
    .await
    .expect("resolution must terminate");

    match result {
        Err(ResolveError::Cycle(cycles)) => assert_eq!(cycles, vec![vec!["a", "b"]]),
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_package_aborts_resolution() {
    let fetcher = helper::fetcher(Arc::new(scenario_registry()));

    let err = Resolver::new(&fetcher)
        .resolve(&direct(&[("a", "^1.0.0"), ("ghost", "latest")]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ResolveError::Fetch {
            ref name,
            source: FetchError::NotFound(_)
        } if name == "ghost"
    ));
}

#[tokio::test]
async fn latest_prefers_advertised_version() {
    let fetcher = helper::fetcher(Arc::new(
        scenario_registry().with_latest("b", "2.0.0"),
    ));

    let resolved = Resolver::new(&fetcher)
        .resolve(&direct(&[("b", "latest")]))
        .await
        .unwrap();

    assert_eq!(resolved.version_of("b").unwrap().to_string(), "2.0.0");
}

#[tokio::test]
async fn locked_versions_are_kept_while_viable() {
    let fetcher = helper::fetcher(Arc::new(scenario_registry()));
    let locked = {
        let old = helper::fetcher(Arc::new(
            MemorySource::new()
                .publish("a", "1.1.0", &[("b", "~2.0.0")])
                .publish("b", "2.0.0", &[]),
        ));
        Resolver::new(&old)
            .resolve(&direct(&[("a", "^1.0.0")]))
            .await
            .unwrap()
    };

    let resolved = Resolver::new(&fetcher)
        .with_preferences(&locked)
        .resolve(&direct(&[("a", "^1.0.0")]))
        .await
        .unwrap();

    assert_eq!(resolved.version_of("a").unwrap().to_string(), "1.1.0");
    assert_eq!(resolved.version_of("b").unwrap().to_string(), "2.0.0");
}
