//! Version constraints
//!
//! Supported forms:
//! - `1.2.3`, `=1.2.3` - exact match
//! - `^1.2.3` - compatible with version (>=1.2.3 <2.0.0, special cases for 0.x)
//! - `~1.2.3` - patch-level changes only (>=1.2.3 <1.3.0)
//! - `>=1.2.3`, `>1.2.3`, `<=1.2.3`, `<1.2.3` - comparison operators
//! - `1.2.x`, `1.x`, `1.2`, `1` - wildcards
//! - `*`, `latest` - any version
//!
//! A partial operand covers every version it leaves unspecified: `~1` is
//! `1.x`, `^0` is `0.x`, `^0.0` is `0.0.x`, `=1.2` is `1.2.x`, `>1.2` is
//! `>=1.3.0` and `<=1` is `<2.0.0`. Where zero-padding already gives that
//! meaning (`^1.2`, `~1.2`, `>=1`, `<1.2`) the operand is simply padded.
//!
//! A pre-release candidate only satisfies a constraint whose own version is a
//! pre-release of the same `major.minor.patch`, so `^1.0.0` never selects
//! `1.1.0-beta.1`. `Exact` and `Any` are not gated.

use std::fmt;

use semver::Version;

use crate::version::semver::parse_version;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintError {
    #[error("Malformed version constraint: {0:?}")]
    Malformed(String),

    #[error("Invalid package name: {0:?}")]
    InvalidName(String),
}

/// Comparison operator of a `Range` constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl RangeOp {
    fn as_str(&self) -> &'static str {
        match self {
            RangeOp::Gt => ">",
            RangeOp::Gte => ">=",
            RangeOp::Lt => "<",
            RangeOp::Lte => "<=",
        }
    }
}

/// A parsed version range expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionConstraint {
    Exact(Version),
    /// ^1.2.3 means >=1.2.3 <2.0.0; the leading nonzero component is pinned
    Caret(Version),
    /// ~1.2.3 means >=1.2.3 <1.3.0
    Tilde(Version),
    Range(RangeOp, Version),
    /// 1.x means major 1; 1.2.x means major 1 and minor 2
    Wildcard { major: u64, minor: Option<u64> },
    Any,
}

impl VersionConstraint {
    /// Parse a constraint string.
    pub fn parse(spec: &str) -> Result<Self, ConstraintError> {
        let spec = spec.trim();
        let malformed = || ConstraintError::Malformed(spec.to_string());

        if spec.is_empty() {
            return Err(malformed());
        }

        if matches!(spec, "*" | "x" | "X" | "latest") {
            return Ok(VersionConstraint::Any);
        }

        // Longest operators first so ">=" is not read as ">"
        let operators: [(&str, fn(Version) -> Self); 7] = [
            (">=", |v| VersionConstraint::Range(RangeOp::Gte, v)),
            ("<=", |v| VersionConstraint::Range(RangeOp::Lte, v)),
            (">", |v| VersionConstraint::Range(RangeOp::Gt, v)),
            ("<", |v| VersionConstraint::Range(RangeOp::Lt, v)),
            ("=", VersionConstraint::Exact),
            ("^", VersionConstraint::Caret),
            ("~", VersionConstraint::Tilde),
        ];

        for (prefix, build) in operators {
            if let Some(rest) = spec.strip_prefix(prefix) {
                let version = parse_version(rest).ok_or_else(malformed)?;
                if let Some(widened) = Self::widen_partial(prefix, &version, given_components(rest)) {
                    return Ok(widened);
                }
                return Ok(build(version));
            }
        }

        if let Some(wildcard) = Self::parse_wildcard(spec) {
            return Ok(wildcard);
        }

        parse_version(spec)
            .map(VersionConstraint::Exact)
            .ok_or_else(malformed)
    }

    /// Constraint for an operator whose operand named fewer than three components,
    /// when zero-padding would narrow it
    fn widen_partial(op: &str, version: &Version, given: usize) -> Option<Self> {
        if given >= 3 || !version.pre.is_empty() {
            return None;
        }
        let minor = (given == 2).then_some(version.minor);
        let next = if given == 1 {
            Version::new(version.major + 1, 0, 0)
        } else {
            Version::new(version.major, version.minor + 1, 0)
        };

        match op {
            "=" => Some(VersionConstraint::Wildcard {
                major: version.major,
                minor,
            }),
            "~" if given == 1 => Some(VersionConstraint::Wildcard {
                major: version.major,
                minor: None,
            }),
            "^" if version.major == 0 && version.minor == 0 => Some(VersionConstraint::Wildcard {
                major: 0,
                minor,
            }),
            ">" => Some(VersionConstraint::Range(RangeOp::Gte, next)),
            "<=" => Some(VersionConstraint::Range(RangeOp::Lt, next)),
            _ => None,
        }
    }

    /// Parse wildcard patterns like "1.x", "1.2.*" and partial versions like "1" or "1.2"
    fn parse_wildcard(spec: &str) -> Option<Self> {
        let spec = spec.strip_prefix('v').unwrap_or(spec);
        let is_wild = |s: &str| matches!(s, "x" | "X" | "*");
        let parts: Vec<&str> = spec.split('.').collect();

        match parts.as_slice() {
            [major] => major.parse().ok().map(|major| VersionConstraint::Wildcard {
                major,
                minor: None,
            }),
            [major, minor] if is_wild(minor) => {
                major.parse().ok().map(|major| VersionConstraint::Wildcard {
                    major,
                    minor: None,
                })
            }
            [major, minor] => Some(VersionConstraint::Wildcard {
                major: major.parse().ok()?,
                minor: Some(minor.parse().ok()?),
            }),
            [major, minor, patch] if is_wild(patch) => {
                let major = major.parse().ok()?;
                if is_wild(minor) {
                    return Some(VersionConstraint::Wildcard { major, minor: None });
                }
                Some(VersionConstraint::Wildcard {
                    major,
                    minor: Some(minor.parse().ok()?),
                })
            }
            _ => None,
        }
    }

    /// Check whether `candidate` satisfies this constraint.
    pub fn satisfies(&self, candidate: &Version) -> bool {
        match self {
            VersionConstraint::Exact(v) => candidate == v,
            VersionConstraint::Any => true,
            _ if !candidate.pre.is_empty() && !self.admits_pre_release_of(candidate) => false,
            VersionConstraint::Caret(v) => {
                if candidate < v {
                    return false;
                }
                // ^1.2.3 -> >=1.2.3 <2.0.0
                // ^0.2.3 -> >=0.2.3 <0.3.0
                // ^0.0.3 -> >=0.0.3 <0.0.4
                if v.major == 0 {
                    if v.minor == 0 {
                        candidate.major == 0 && candidate.minor == 0 && candidate.patch == v.patch
                    } else {
                        candidate.major == 0 && candidate.minor == v.minor
                    }
                } else {
                    candidate.major == v.major
                }
            }
            VersionConstraint::Tilde(v) => {
                candidate >= v && candidate.major == v.major && candidate.minor == v.minor
            }
            VersionConstraint::Range(op, v) => match op {
                RangeOp::Gt => candidate > v,
                RangeOp::Gte => candidate >= v,
                RangeOp::Lt => candidate < v,
                RangeOp::Lte => candidate <= v,
            },
            VersionConstraint::Wildcard { major, minor } => {
                candidate.major == *major && minor.is_none_or(|minor| candidate.minor == minor)
            }
        }
    }

    fn admits_pre_release_of(&self, candidate: &Version) -> bool {
        let base = match self {
            VersionConstraint::Caret(v)
            | VersionConstraint::Tilde(v)
            | VersionConstraint::Range(_, v) => v,
            _ => return false,
        };
        !base.pre.is_empty()
            && (base.major, base.minor, base.patch)
                == (candidate.major, candidate.minor, candidate.patch)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Exact(v) => write!(f, "{}", v),
            VersionConstraint::Caret(v) => write!(f, "^{}", v),
            VersionConstraint::Tilde(v) => write!(f, "~{}", v),
            VersionConstraint::Range(op, v) => write!(f, "{}{}", op.as_str(), v),
            VersionConstraint::Wildcard { major, minor: None } => write!(f, "{}.x", major),
            VersionConstraint::Wildcard {
                major,
                minor: Some(minor),
            } => write!(f, "{}.{}.x", major, minor),
            VersionConstraint::Any => write!(f, "*"),
        }
    }
}

/// Number of numeric components written in a version operand (`1.2` has two)
fn given_components(raw: &str) -> usize {
    let raw = raw.trim();
    let raw = raw.strip_prefix('v').unwrap_or(raw);
    let core = raw.split(['-', '+']).next().unwrap_or(raw);
    core.split('.').count()
}

/// How a version is picked among the candidates that satisfy every constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SelectionPolicy {
    /// Highest satisfying version
    #[default]
    Newest,
    /// The source's advertised latest version when viable, otherwise the highest
    Latest,
}

/// A dependency edge's demand: a constraint plus the selection policy it implies
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    pub constraint: VersionConstraint,
    pub policy: SelectionPolicy,
    raw: String,
}

impl Requirement {
    /// Parse a requirement. An empty string means `latest`.
    pub fn parse(spec: &str) -> Result<Self, ConstraintError> {
        let spec = spec.trim();
        let spec = if spec.is_empty() { "latest" } else { spec };
        let policy = if spec == "latest" {
            SelectionPolicy::Latest
        } else {
            SelectionPolicy::Newest
        };

        Ok(Self {
            constraint: VersionConstraint::parse(spec)?,
            policy,
            raw: spec.to_string(),
        })
    }

    pub fn any() -> Self {
        Self {
            constraint: VersionConstraint::Any,
            policy: SelectionPolicy::Newest,
            raw: "*".to_string(),
        }
    }

    pub fn satisfies(&self, candidate: &Version) -> bool {
        self.constraint.satisfies(candidate)
    }

    /// The requirement exactly as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
