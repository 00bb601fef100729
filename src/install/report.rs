use std::collections::BTreeMap;
use std::fmt;

use crate::install::InstallError;

/// What happened to one package during an install
#[derive(Debug)]
pub enum PackageOutcome {
    Installed,
    AlreadyPresent,
    Failed(InstallError),
}

impl PackageOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, PackageOutcome::Failed(_))
    }
}

/// Per-package results of an install, in name order
#[derive(Debug, Default)]
pub struct InstallReport {
    outcomes: BTreeMap<String, PackageOutcome>,
}

impl InstallReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: String, outcome: PackageOutcome) {
        self.outcomes.insert(name, outcome);
    }

    pub fn get(&self, name: &str) -> Option<&PackageOutcome> {
        self.outcomes.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PackageOutcome)> {
        self.outcomes.iter().map(|(name, outcome)| (name.as_str(), outcome))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &InstallError)> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            PackageOutcome::Failed(e) => Some((name.as_str(), e)),
            _ => None,
        })
    }

    /// Packages present on disk after the run, fresh or not
    pub fn installed_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn fetched_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, PackageOutcome::Installed))
            .count()
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(PackageOutcome::is_success)
    }
}

impl fmt::Display for InstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "installed {}/{} packages ({} fetched, {} already present)",
            self.installed_count(),
            self.total(),
            self.fetched_count(),
            self.installed_count() - self.fetched_count()
        )?;
        for (name, error) in self.failures() {
            write!(f, "\n  {name}: {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_summarizes_partial_success() {
        let mut report = InstallReport::new();
        report.record("a".to_string(), PackageOutcome::Installed);
        report.record("b".to_string(), PackageOutcome::AlreadyPresent);
        report.record("c".to_string(), PackageOutcome::Failed(InstallError::Cancelled));

        assert!(!report.is_success());
        assert_eq!(report.installed_count(), 2);
        assert_eq!(
            report.to_string(),
            "installed 2/3 packages (1 fetched, 1 already present)\n  c: Installation cancelled"
        );
    }

    #[test]
    fn empty_report_is_success() {
        let report = InstallReport::new();

        assert!(report.is_success());
        assert_eq!(report.total(), 0);
    }
}
