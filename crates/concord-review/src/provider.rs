use std::path::Path;

use concord_core::rules::{check_unique_ids, load_rules_file};
use concord_core::{ConcordConfig, ConcordError, Rule};

/// Supplies the rules that apply to a file. An empty list skips the file.
pub trait RuleProvider: Send + Sync {
    /// Rules to check `path` against.
    ///
    /// # Errors
    ///
    /// Any error fails the file it was asked about, nothing else.
    fn applicable_rules(&self, path: &Path) -> Result<Vec<Rule>, ConcordError>;
}

/// A fixed rule list filtered by each rule's `enabled` flag and
/// `applies_to` globs.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use concord_core::{Rule, Severity};
/// use concord_review::provider::{RuleProvider, RuleSet};
///
/// let mut py = Rule::new("bare-except", "No bare except", Severity::Error);
/// py.applies_to = vec!["*.py".into()];
/// let set = RuleSet::new(vec![py]).unwrap();
/// assert_eq!(set.applicable_rules(Path::new("app.py")).unwrap().len(), 1);
/// assert!(set.applicable_rules(Path::new("main.rs")).unwrap().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Wrap `rules`.
    ///
    /// # Errors
    ///
    /// Returns [`ConcordError::Parse`] if two rules share an id.
    pub fn new(rules: Vec<Rule>) -> Result<Self, ConcordError> {
        check_unique_ids(&rules)?;
        Ok(Self { rules })
    }

    /// Inline `[[rules]]` from the config plus the markdown `rules_file`,
    /// resolved against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rules file cannot be read or ids collide.
    pub fn from_config(config: &ConcordConfig, base_dir: &Path) -> Result<Self, ConcordError> {
        let mut rules = config.rules.clone();
        if let Some(file) = &config.rules_file {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                base_dir.join(file)
            };
            rules.extend(load_rules_file(&path)?);
        }
        Self::new(rules)
    }

    /// Every rule, including disabled ones.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl RuleProvider for RuleSet {
    fn applicable_rules(&self, path: &Path) -> Result<Vec<Rule>, ConcordError> {
        Ok(self
            .rules
            .iter()
            .filter(|r| r.applies_to_path(path))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use concord_core::Severity;

    use super::*;

    #[test]
    fn duplicate_ids_are_rejected() {
        let rules = vec![
            Rule::new("a", "x", Severity::Info),
            Rule::new("a", "y", Severity::Info),
        ];
        assert!(RuleSet::new(rules).is_err());
    }

    #[test]
    fn disabled_rules_are_not_applicable() {
        let mut off = Rule::new("off", "x", Severity::Info);
        off.enabled = false;
        let set = RuleSet::new(vec![off, Rule::new("on", "y", Severity::Info)]).unwrap();
        let rules = set.applicable_rules(Path::new("a.rs")).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "on");
        assert_eq!(set.rules().len(), 2);
    }

    #[test]
    fn from_config_merges_inline_and_file_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("RULES.md"),
            "## Style\n- no-todo: No TODO comments\n",
        )
        .unwrap();
        let config = ConcordConfig::from_toml(
            r#"
rules_file = "RULES.md"

[[rules]]
id = "fn-length"
description = "max 30 lines"
"#,
        )
        .unwrap();
        let set = RuleSet::from_config(&config, dir.path()).unwrap();
        let ids: Vec<_> = set.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["fn-length", "no-todo"]);
    }

    #[test]
    fn missing_rules_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConcordConfig {
            rules_file: Some("nope.md".into()),
            ..ConcordConfig::default()
        };
        assert!(RuleSet::from_config(&config, dir.path()).is_err());
    }
}
