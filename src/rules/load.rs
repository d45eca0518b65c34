//! Loads every YAML file under a rules directory, enforcing globally unique
//! rule ids and compiling every precondition up front (spec §4.3: "Prefer
//! fail-fast with aggregate diagnostics over partial loads").

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ValidationError;

use super::document::{Rule, RuleDocument};
use super::precondition::CompiledPrecondition;

/// A rule plus its precondition, pre-compiled at load time so evaluation
/// never has to recompile a regex.
pub struct LoadedRule {
    pub rule: Rule,
    pub compiled: CompiledPrecondition,
}

/// The full, validated rule set: sorted by id ascending, ready to be
/// evaluated in first-match-wins order.
pub struct RuleSet {
    rules: Vec<LoadedRule>,
}

impl RuleSet {
    pub fn iter_matching_order(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|r| &r.rule)
    }

    pub fn loaded_rules(&self) -> &[LoadedRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Loads and validates every `*.yml`/`*.yaml` file under `dir`.
///
/// Duplicate rule ids across files abort the whole load with a diagnostic
/// naming every defining file. A regex that fails to compile likewise
/// aborts the whole load.
pub fn load_rules_dir(dir: &Path) -> Result<RuleSet, ValidationError> {
    let mut by_id: BTreeMap<i64, Vec<PathBuf>> = BTreeMap::new();
    let mut parsed: Vec<(PathBuf, Rule)> = Vec::new();

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        let contents = std::fs::read_to_string(&path).unwrap_or_default();
        let document: RuleDocument = serde_yaml::from_str(&contents)
            .map_err(|e| ValidationError::RuleParse(format!("{}: {e}", path.display())))?;
        for rule in document.0 {
            by_id.entry(rule.id).or_default().push(path.clone());
            parsed.push((path.clone(), rule));
        }
    }

    let duplicates: Vec<(i64, Vec<PathBuf>)> = by_id
        .into_iter()
        .filter(|(_, files)| files.len() > 1)
        .collect();
    if let Some((id, files)) = duplicates.into_iter().next() {
        return Err(ValidationError::DuplicateRuleId {
            id,
            files: files.iter().map(|p| p.display().to_string()).collect(),
        });
    }

    let mut rules = Vec::with_capacity(parsed.len());
    for (_, rule) in parsed {
        let compiled = rule.if_.compile()?;
        rules.push(LoadedRule { rule, compiled });
    }
    rules.sort_by_key(|r| r.rule.id);

    Ok(RuleSet { rules })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_sorts_rules_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("a.yaml")).unwrap();
        writeln!(
            file,
            "- id: 2\n  if:\n    merchant: \"^b\"\n  then:\n    memo: \"b\"\n- id: 1\n  if:\n    merchant: \"^a\"\n  then:\n    memo: \"a\"\n"
        )
        .unwrap();

        let rule_set = load_rules_dir(dir.path()).unwrap();
        assert_eq!(rule_set.len(), 2);
        let ids: Vec<i64> = rule_set.iter_matching_order().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn duplicate_ids_across_files_abort_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "- id: 1\n  if:\n    merchant: \"^a\"\n  then:\n    memo: \"a\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "- id: 1\n  if:\n    merchant: \"^b\"\n  then:\n    memo: \"b\"\n",
        )
        .unwrap();

        let result = load_rules_dir(dir.path());
        assert!(matches!(
            result,
            Err(ValidationError::DuplicateRuleId { id: 1, .. })
        ));
    }

    #[test]
    fn invalid_regex_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "- id: 1\n  if:\n    merchant: \"(unclosed\"\n  then:\n    memo: \"a\"\n",
        )
        .unwrap();
        let result = load_rules_dir(dir.path());
        assert!(result.is_err());
    }
}
