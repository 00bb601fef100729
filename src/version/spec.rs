//! Package specs (`name@constraint`) and alias expansion

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::version::constraint::{ConstraintError, Requirement};

/// Registry names (`left-pad`, `@scope/pkg`) and source-control paths (`github.com/owner/repo`)
static PACKAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(@[a-z0-9][a-z0-9._-]*/[a-z0-9][a-z0-9._-]*|[A-Za-z0-9][A-Za-z0-9._-]*(/[A-Za-z0-9._-]+)*|git\+[a-z]+://\S+)$")
        .expect("package name pattern is valid")
});

/// Check a package name against the accepted forms
pub fn validate_name(name: &str) -> Result<(), ConstraintError> {
    if name.len() > 214 || !PACKAGE_NAME.is_match(name) || name.split('/').any(|s| s == "..") {
        return Err(ConstraintError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Immutable table of package-name shortcuts, passed explicitly to spec parsing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AliasTable {
    aliases: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn new(aliases: BTreeMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Expand `name` if it is an alias, otherwise return it unchanged
    pub fn expand<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }
}

/// A dependency edge before resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    pub requirement: Requirement,
}

impl PackageSpec {
    pub fn new(name: &str, requirement: &str) -> Result<Self, ConstraintError> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            requirement: Requirement::parse(requirement)?,
        })
    }

    /// Parse `name[@constraint]`. The version separator is the last `@` that is not
    /// the first character, so scoped names like `@scope/pkg@^1.0.0` work.
    /// A missing constraint means `latest`.
    pub fn parse(spec: &str, aliases: &AliasTable) -> Result<Self, ConstraintError> {
        let spec = spec.trim();
        let (name, requirement) = match spec.rfind('@') {
            Some(idx) if idx > 0 => (&spec[..idx], &spec[idx + 1..]),
            _ => (spec, "latest"),
        };

        Self::new(aliases.expand(name), requirement)
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.requirement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::constraint::{SelectionPolicy, VersionConstraint};
    use rstest::rstest;

    #[rstest]
    #[case("left-pad", "left-pad", "latest")]
    #[case("left-pad@^1.0.0", "left-pad", "^1.0.0")]
    #[case("@types/node@20.1.0", "@types/node", "20.1.0")]
    #[case("@types/node", "@types/node", "latest")]
    #[case("github.com/owner/repo@v1.2.0", "github.com/owner/repo", "v1.2.0")]
    fn parse_splits_name_and_requirement(
        #[case] input: &str,
        #[case] name: &str,
        #[case] requirement: &str,
    ) {
        let spec = PackageSpec::parse(input, &AliasTable::default()).unwrap();

        assert_eq!(spec.name, name);
        assert_eq!(spec.requirement.as_str(), requirement);
    }

    #[test]
    fn parse_without_constraint_uses_latest_policy() {
        let spec = PackageSpec::parse("left-pad", &AliasTable::default()).unwrap();

        assert_eq!(spec.requirement.constraint, VersionConstraint::Any);
        assert_eq!(spec.requirement.policy, SelectionPolicy::Latest);
    }

    #[test]
    fn parse_expands_aliases_from_the_supplied_table() {
        let aliases = AliasTable::new(BTreeMap::from([(
            "http".to_string(),
            "depot-http".to_string(),
        )]));

        let spec = PackageSpec::parse("http@^2.0.0", &aliases).unwrap();
        assert_eq!(spec.name, "depot-http");

        let unaliased = PackageSpec::parse("http@^2.0.0", &AliasTable::default()).unwrap();
        assert_eq!(unaliased.name, "http");
    }

    #[rstest]
    #[case("")]
    #[case("has space")]
    #[case("../escape")]
    #[case("a/../../b")]
    #[case("@/missing-scope")]
    fn parse_rejects_invalid_names(#[case] input: &str) {
        assert!(matches!(
            PackageSpec::parse(input, &AliasTable::default()),
            Err(ConstraintError::InvalidName(_))
        ));
    }

    #[test]
    fn parse_rejects_malformed_constraint() {
        assert!(matches!(
            PackageSpec::parse("left-pad@^^1", &AliasTable::default()),
            Err(ConstraintError::Malformed(_))
        ));
    }
}
