// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config_store::ConfigStore;
use crate::error::{UrnError, UrnResult};

pub const DEFAULT_POLICY: &str = "biased-toward-max";
const MAX_STUDY_NAME_BYTES: usize = 128;

/// Keys under which a study's parameters live in a [`ConfigStore`].
pub mod keys {
    pub const W: &str = "w";
    pub const ALPHA: &str = "alpha";
    pub const BETA: &str = "beta";
    pub const STARTING_SEED: &str = "starting_seed";
    pub const IMBALANCE_RULE: &str = "imbalance_rule";
    pub const URN_SELECTION_POLICY: &str = "urn_selection_policy";
    pub const TREATMENTS: &str = "treatments";
    pub const FACTORS: &str = "factors";

    pub const ALL: [&str; 8] = [
        W,
        ALPHA,
        BETA,
        STARTING_SEED,
        IMBALANCE_RULE,
        URN_SELECTION_POLICY,
        TREATMENTS,
        FACTORS,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImbalanceRule {
    Range,
    Variance,
}

impl ImbalanceRule {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Range => "range",
            Self::Variance => "variance",
        }
    }
}

impl fmt::Display for ImbalanceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImbalanceRule {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "range" => Ok(Self::Range),
            "variance" => Ok(Self::Variance),
            other => Err(UrnError::validation(format!(
                "imbalance_rule must be range or variance, got {other:?}"
            ))),
        }
    }
}

fn default_rule() -> ImbalanceRule {
    ImbalanceRule::Range
}

fn default_policy() -> String {
    DEFAULT_POLICY.to_string()
}

/// Immutable parameters of one study. Loaded once per coordinator and
/// cached; a study's configuration never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyConfig {
    #[serde(default)]
    pub name: String,
    pub w: u64,
    pub alpha: u64,
    pub beta: u64,
    #[serde(default)]
    pub starting_seed: Option<u64>,
    #[serde(default = "default_rule")]
    pub imbalance_rule: ImbalanceRule,
    #[serde(default = "default_policy")]
    pub urn_selection_policy: String,
    pub treatments: Vec<String>,
    pub factors: BTreeMap<String, Vec<String>>,
}

impl StudyConfig {
    /// Parses a study definition document. Type errors (a negative `w`, a
    /// level that is not a string) are reported as validation failures.
    pub fn from_json_slice(bytes: &[u8]) -> UrnResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| UrnError::validation(format!("malformed study configuration: {e}")))
    }

    pub fn validate(&self) -> UrnResult<()> {
        validate_study_name(&self.name)?;
        if self.w == 0 && (self.alpha == 0 || self.beta == 0) {
            return Err(UrnError::validation(
                "w = 0 requires alpha > 0 and beta > 0 so every urn keeps drawable balls",
            ));
        }
        if self.treatments.len() < 2 {
            return Err(UrnError::validation("at least two treatments are required"));
        }
        let mut seen = BTreeSet::new();
        for t in &self.treatments {
            if t.trim().is_empty() {
                return Err(UrnError::validation("treatment labels must be non-empty"));
            }
            if !seen.insert(t.as_str()) {
                return Err(UrnError::validation(format!("duplicate treatment {t:?}")));
            }
        }
        if self.factors.is_empty() {
            return Err(UrnError::validation("at least one factor is required"));
        }
        for (factor, levels) in &self.factors {
            if !is_identifier(factor) {
                return Err(UrnError::validation(format!(
                    "factor name {factor:?} must be non-empty and use [A-Za-z0-9_]"
                )));
            }
            if levels.is_empty() {
                return Err(UrnError::validation(format!(
                    "factor {factor:?} has no levels"
                )));
            }
            let mut seen = BTreeSet::new();
            for level in levels {
                if level.is_empty() {
                    return Err(UrnError::validation(format!(
                        "factor {factor:?} has an empty level"
                    )));
                }
                if !seen.insert(level.as_str()) {
                    return Err(UrnError::validation(format!(
                        "factor {factor:?} repeats level {level:?}"
                    )));
                }
            }
        }
        if self.urn_selection_policy.is_empty() {
            return Err(UrnError::validation("urn_selection_policy must be named"));
        }
        Ok(())
    }

    /// Checks a participant's factor-level vector against the factor map.
    pub fn check_levels(&self, levels: &BTreeMap<String, String>) -> UrnResult<()> {
        if let Some(extra) = levels.keys().find(|f| !self.factors.contains_key(*f)) {
            return Err(UrnError::UnknownFactor(extra.clone()));
        }
        for (factor, permitted) in &self.factors {
            let Some(value) = levels.get(factor) else {
                return Err(UrnError::validation(format!(
                    "missing value for factor {factor:?}"
                )));
            };
            if !permitted.iter().any(|l| l == value) {
                return Err(UrnError::validation(format!(
                    "{value:?} is not a permissible level of factor {factor:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn treatment_index(&self, treatment: &str) -> Option<usize> {
        self.treatments.iter().position(|t| t == treatment)
    }

    /// Factor names in ascending order, the order urns are scored in.
    pub fn factor_names(&self) -> impl Iterator<Item = &str> {
        self.factors.keys().map(String::as_str)
    }

    /// Serializes to the key/value layout of the configuration store.
    pub fn to_entries(&self) -> UrnResult<Vec<(&'static str, String)>> {
        let treatments = serde_json::to_string(&self.treatments)
            .map_err(|e| UrnError::Storage(format!("encode treatments: {e}")))?;
        let factors = serde_json::to_string(&self.factors)
            .map_err(|e| UrnError::Storage(format!("encode factors: {e}")))?;
        Ok(vec![
            (keys::W, self.w.to_string()),
            (keys::ALPHA, self.alpha.to_string()),
            (keys::BETA, self.beta.to_string()),
            (
                keys::STARTING_SEED,
                self.starting_seed.map(|s| s.to_string()).unwrap_or_default(),
            ),
            (keys::IMBALANCE_RULE, self.imbalance_rule.as_str().to_string()),
            (keys::URN_SELECTION_POLICY, self.urn_selection_policy.clone()),
            (keys::TREATMENTS, treatments),
            (keys::FACTORS, factors),
        ])
    }

    /// Loads and validates a study's configuration from the store.
    pub fn load(name: &str, store: &dyn ConfigStore) -> UrnResult<Self> {
        validate_study_name(name)?;
        let mut raw = BTreeMap::new();
        for key in keys::ALL {
            if let Some(value) = store.get(name, key)? {
                raw.insert(key, value);
            }
        }
        if raw.is_empty() {
            return Err(UrnError::NotFound(format!("study {name:?}")));
        }
        let starting_seed = match stored_field(&raw, name, keys::STARTING_SEED)? {
            "" => None,
            s => Some(parse_count(keys::STARTING_SEED, s)?),
        };
        let treatments_json = stored_field(&raw, name, keys::TREATMENTS)?;
        let treatments: Vec<String> = serde_json::from_str(treatments_json)
            .map_err(|e| UrnError::validation(format!("treatments is not a JSON array: {e}")))?;
        let factors_json = stored_field(&raw, name, keys::FACTORS)?;
        let factors: BTreeMap<String, Vec<String>> = serde_json::from_str(factors_json)
            .map_err(|e| UrnError::validation(format!("factors is not a JSON object: {e}")))?;
        let config = Self {
            name: name.to_string(),
            w: parse_count(keys::W, stored_field(&raw, name, keys::W)?)?,
            alpha: parse_count(keys::ALPHA, stored_field(&raw, name, keys::ALPHA)?)?,
            beta: parse_count(keys::BETA, stored_field(&raw, name, keys::BETA)?)?,
            starting_seed,
            imbalance_rule: stored_field(&raw, name, keys::IMBALANCE_RULE)?.parse()?,
            urn_selection_policy: stored_field(&raw, name, keys::URN_SELECTION_POLICY)?
                .to_string(),
            treatments,
            factors,
        };
        config.validate()?;
        Ok(config)
    }
}

fn stored_field<'a>(
    raw: &'a BTreeMap<&'static str, String>,
    name: &str,
    key: &str,
) -> UrnResult<&'a str> {
    raw.get(key)
        .map(String::as_str)
        .ok_or_else(|| UrnError::validation(format!("stored config for {name:?} lacks {key:?}")))
}

fn parse_count(key: &str, raw: &str) -> UrnResult<u64> {
    raw.trim().parse::<u64>().map_err(|_| {
        UrnError::validation(format!("{key} must be a non-negative integer, got {raw:?}"))
    })
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Study names become file names, so they are restricted to a portable
/// subset.
pub fn validate_study_name(name: &str) -> UrnResult<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_STUDY_NAME_BYTES
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if ok {
        Ok(())
    } else {
        Err(UrnError::validation(format!(
            "study name {name:?} must match [A-Za-z0-9_.-]+ and not start with '.'"
        )))
    }
}

#[cfg(test)]
pub(crate) fn two_arm_site_study(name: &str) -> StudyConfig {
    StudyConfig {
        name: name.to_string(),
        w: 1,
        alpha: 2,
        beta: 1,
        starting_seed: Some(42),
        imbalance_rule: ImbalanceRule::Range,
        urn_selection_policy: DEFAULT_POLICY.to_string(),
        treatments: vec!["A".to_string(), "B".to_string()],
        factors: BTreeMap::from([(
            "site".to_string(),
            vec!["north".to_string(), "south".to_string()],
        )]),
    }
}
