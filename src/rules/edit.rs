//! Ad-hoc rule-file editing for the `rule add`/`rule rm` commands (§6 "Rule
//! surface"). Rules are edited as raw YAML sequences rather than through
//! the typed `Rule`/`Transform` model — adding or removing one entry
//! doesn't need the full precondition/transform domain, only
//! re-validation via `load_rules_dir` after the edit does (§4.3 "Prefer
//! fail-fast with aggregate diagnostics over partial loads").

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::ValidationError;

use super::load_rules_dir;

const MANUAL_RULES_FILE: &str = "manual.yaml";

/// One rule as specified on the command line for `rule add`, restricted to
/// the subset of the §6 grammar expressible as flags.
#[derive(Debug, Clone, Default)]
pub struct NewRule {
    pub id: i64,
    pub merchant: Option<String>,
    pub account: Option<String>,
    pub category_precondition: Option<String>,
    pub metadata_precondition: BTreeMap<String, String>,
    pub set_category: Option<String>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub memo: Option<String>,
    pub set_metadata: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct YamlRule {
    id: i64,
    #[serde(rename = "if")]
    if_: YamlPrecondition,
    then: YamlThen,
}

#[derive(Serialize, Default)]
struct YamlPrecondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    merchant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Serialize, Default)]
struct YamlThen {
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    metadata: BTreeMap<String, String>,
}

impl NewRule {
    fn to_yaml_rule(&self) -> YamlRule {
        let mut labels = Vec::new();
        labels.extend(self.add_labels.iter().map(|l| format!("+{l}")));
        labels.extend(self.remove_labels.iter().map(|l| format!("-{l}")));

        YamlRule {
            id: self.id,
            if_: YamlPrecondition {
                merchant: self.merchant.clone(),
                account: self.account.clone(),
                category: self.category_precondition.clone(),
                metadata: self.metadata_precondition.clone(),
            },
            then: YamlThen {
                category: self.set_category.clone(),
                labels,
                memo: self.memo.clone(),
                metadata: self.set_metadata.clone(),
            },
        }
    }
}

/// Appends `rule` to `<dir>/manual.yaml`, then re-validates the whole
/// directory; rolls the file back to its prior contents if validation
/// fails (e.g. a duplicate id or an unresolvable regex elsewhere — this
/// edit itself can't produce a bad regex since flags are plain strings,
/// but another rule's id might now collide).
pub fn add_rule(dir: &Path, rule: NewRule) -> Result<(), ValidationError> {
    std::fs::create_dir_all(dir).map_err(|e| ValidationError::RuleParse(e.to_string()))?;
    let path = manual_path(dir);
    let previous = std::fs::read_to_string(&path).unwrap_or_default();

    let mut sequence = parse_sequence(&previous);
    let new_value =
        serde_yaml::to_value(rule.to_yaml_rule()).map_err(|e| ValidationError::RuleParse(e.to_string()))?;
    sequence.push(new_value);
    write_sequence(&path, &sequence)?;

    if let Err(e) = load_rules_dir(dir) {
        let _ = std::fs::write(&path, previous);
        return Err(e);
    }
    Ok(())
}

/// Removes the rule with `id` from whichever file under `dir` defines it,
/// deleting the file outright if it was the sole rule there. Errors if no
/// rule with that id is found in any file.
pub fn remove_rule(dir: &Path, id: i64) -> Result<(), ValidationError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yml") | Some("yaml")))
        .collect();
    paths.sort();

    for path in paths {
        let contents = std::fs::read_to_string(&path).unwrap_or_default();
        let mut sequence = parse_sequence(&contents);
        let before = sequence.len();
        sequence.retain(|v| rule_id_of(v) != Some(id));
        if sequence.len() == before {
            continue;
        }
        if sequence.is_empty() {
            std::fs::remove_file(&path).map_err(|e| ValidationError::RuleParse(e.to_string()))?;
        } else {
            write_sequence(&path, &sequence)?;
        }
        return Ok(());
    }

    Err(ValidationError::InvalidRuleId(id))
}

fn manual_path(dir: &Path) -> PathBuf {
    dir.join(MANUAL_RULES_FILE)
}

fn parse_sequence(contents: &str) -> Vec<serde_yaml::Value> {
    if contents.trim().is_empty() {
        return Vec::new();
    }
    serde_yaml::from_str(contents).unwrap_or_default()
}

fn write_sequence(path: &Path, sequence: &[serde_yaml::Value]) -> Result<(), ValidationError> {
    let rendered = serde_yaml::to_string(sequence).map_err(|e| ValidationError::RuleParse(e.to_string()))?;
    std::fs::write(path, rendered).map_err(|e| ValidationError::RuleParse(e.to_string()))
}

fn rule_id_of(value: &serde_yaml::Value) -> Option<i64> {
    value.as_mapping()?.get("id")?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_load_sees_the_new_rule() {
        let dir = tempfile::tempdir().unwrap();
        add_rule(
            dir.path(),
            NewRule {
                id: 1,
                merchant: Some("^starbucks".to_string()),
                set_category: Some("Expenses:Food:Coffee".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let rules = load_rules_dir(dir.path()).unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn add_duplicate_id_is_rejected_and_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("existing.yaml"),
            "- id: 1\n  if:\n    merchant: \"^a\"\n  then:\n    memo: \"a\"\n",
        )
        .unwrap();

        let result = add_rule(
            dir.path(),
            NewRule {
                id: 1,
                merchant: Some("^b".to_string()),
                memo: Some("b".to_string()),
                ..Default::default()
            },
        );
        assert!(result.is_err());

        // manual.yaml should not have been left with the rejected entry.
        let rules = load_rules_dir(dir.path()).unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn remove_deletes_file_when_it_was_the_sole_rule() {
        let dir = tempfile::tempdir().unwrap();
        add_rule(
            dir.path(),
            NewRule {
                id: 5,
                merchant: Some("^x".to_string()),
                memo: Some("x".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        remove_rule(dir.path(), 5).unwrap();
        let rules = load_rules_dir(dir.path()).unwrap();
        assert!(rules.is_empty());
        assert!(!manual_path(dir.path()).exists());
    }

    #[test]
    fn remove_unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = remove_rule(dir.path(), 999);
        assert!(result.is_err());
    }
}
