//! `--feature-gates` parsing.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A gated feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    /// Replicate shared caches from other shards. Adds the optional data
    /// sources and the units that depend on them.
    CacheReplication,
}

impl Feature {
    /// Every known feature.
    pub const ALL: &'static [Self] = &[Self::CacheReplication];

    /// Flag spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CacheReplication => "CacheReplication",
        }
    }

    /// Value used when the flag does not mention the feature.
    #[must_use]
    pub const fn default_enabled(self) -> bool {
        match self {
            Self::CacheReplication => false,
        }
    }
}

impl FromStr for Feature {
    type Err = FeatureGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|feature| feature.as_str() == s)
            .ok_or_else(|| FeatureGateError::Unknown(s.to_string()))
    }
}

/// Errors from parsing `--feature-gates`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeatureGateError {
    /// Entry is not `Name=value`.
    #[error("feature gate entry {0:?} is not of the form Name=true|false")]
    Malformed(String),

    /// No such feature.
    #[error("unknown feature gate {0:?}")]
    Unknown(String),

    /// Value is not a boolean.
    #[error("invalid value {value:?} for feature gate {feature}")]
    InvalidValue {
        /// Feature name.
        feature: String,
        /// Rejected value.
        value: String,
    },
}

/// Explicit feature settings; unmentioned features take their default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureGates {
    explicit: BTreeMap<Feature, bool>,
}

impl FeatureGates {
    /// Whether `feature` is on.
    #[must_use]
    pub fn enabled(&self, feature: Feature) -> bool {
        self.explicit
            .get(&feature)
            .copied()
            .unwrap_or_else(|| feature.default_enabled())
    }

    /// Sets `feature` explicitly.
    #[must_use]
    pub fn with(mut self, feature: Feature, enabled: bool) -> Self {
        self.explicit.insert(feature, enabled);
        self
    }
}

impl FromStr for FeatureGates {
    type Err = FeatureGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut gates = Self::default();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| FeatureGateError::Malformed(entry.to_string()))?;
            let feature: Feature = name.trim().parse()?;
            let enabled = value
                .trim()
                .parse::<bool>()
                .map_err(|_| FeatureGateError::InvalidValue {
                    feature: name.trim().to_string(),
                    value: value.trim().to_string(),
                })?;
            gates.explicit.insert(feature, enabled);
        }
        Ok(gates)
    }
}

impl fmt::Display for FeatureGates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (feature, enabled) in &self.explicit {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}={enabled}", feature.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_uses_defaults() {
        let gates: FeatureGates = "".parse().unwrap();
        assert!(!gates.enabled(Feature::CacheReplication));
        assert_eq!(gates.to_string(), "");
    }

    #[test]
    fn test_explicit_value() {
        let gates: FeatureGates = "CacheReplication=true".parse().unwrap();
        assert!(gates.enabled(Feature::CacheReplication));
        assert_eq!(gates.to_string(), "CacheReplication=true");
        assert_eq!(gates.to_string().parse::<FeatureGates>().unwrap(), gates);
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            "CacheReplication".parse::<FeatureGates>(),
            Err(FeatureGateError::Malformed("CacheReplication".into()))
        );
        assert_eq!(
            "Sharding=true".parse::<FeatureGates>(),
            Err(FeatureGateError::Unknown("Sharding".into()))
        );
        assert!(matches!(
            "CacheReplication=yes".parse::<FeatureGates>(),
            Err(FeatureGateError::InvalidValue { .. })
        ));
    }
}
