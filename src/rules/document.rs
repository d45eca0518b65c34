//! The YAML-facing shape of a rule document (spec §6 "Rule file grammar").
//!
//! `then:` is written as a single mapping (`category: ..., labels: ...`)
//! whose keys are applied in the order they appear — so `Rule` gets a
//! hand-written `Deserialize` that walks a `serde_yaml::Mapping` (which
//! preserves insertion order) instead of deriving one, which would expect
//! `then` to be a YAML sequence.

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_yaml::Value;

use super::precondition::Precondition;
use super::transform::{LabelSpec, Transform};

/// A single rule file parses into a list of these.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDocument(pub Vec<Rule>);

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: i64,
    pub if_: Precondition,
    pub then: Vec<Transform>,
    pub disabled: bool,
}

impl<'de> Deserialize<'de> for Rule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RuleVisitor;

        impl<'de> Visitor<'de> for RuleVisitor {
            type Value = Rule;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a rule mapping with id, if, then")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Rule, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut id = None;
                let mut if_ = None;
                let mut then = None;
                let mut disabled = false;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "id" => id = Some(map.next_value::<i64>()?),
                        "if" => if_ = Some(map.next_value::<Precondition>()?),
                        "then" => {
                            let raw = map.next_value::<Value>()?;
                            then = Some(then_from_value(raw).map_err(de::Error::custom)?);
                        }
                        "disabled" => disabled = map.next_value::<bool>()?,
                        _ => {
                            let _ = map.next_value::<Value>()?;
                        }
                    }
                }

                Ok(Rule {
                    id: id.ok_or_else(|| de::Error::missing_field("id"))?,
                    if_: if_.unwrap_or_default(),
                    then: then.ok_or_else(|| de::Error::missing_field("then"))?,
                    disabled,
                })
            }
        }

        deserializer.deserialize_map(RuleVisitor)
    }
}

/// Converts a `then:` mapping into an ordered `Vec<Transform>`, preserving
/// the key order the author wrote (spec §4.3: "multiple transforms
/// compose in the order given").
fn then_from_value(value: Value) -> Result<Vec<Transform>, String> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| "`then` must be a mapping of transform-kind to value".to_string())?;

    let mut transforms = Vec::with_capacity(mapping.len());
    for (key, val) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| "`then` keys must be strings".to_string())?;
        let transform = match key {
            "category" => Transform::Category(
                val.as_str()
                    .ok_or("`category` must be a string")?
                    .to_string(),
            ),
            "labels" => {
                let spec: LabelSpec =
                    serde_yaml::from_value(val.clone()).map_err(|e| e.to_string())?;
                Transform::Labels(spec)
            }
            "memo" => Transform::Memo(
                val.as_str().ok_or("`memo` must be a string")?.to_string(),
            ),
            "metadata" => {
                let map: std::collections::BTreeMap<String, String> =
                    serde_yaml::from_value(val.clone()).map_err(|e| e.to_string())?;
                Transform::Metadata(map)
            }
            other => return Err(format!("unknown transform kind {other:?}")),
        };
        transforms.push(transform);
    }
    Ok(transforms)
}
