use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

/// On-disk shape of the policy file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyDocument {
    #[serde(default)]
    ignore_list: Option<Vec<String>>,
    #[serde(default)]
    domain_map: Option<BTreeMap<String, String>>,
}

/// Registry rewrite rules. Loaded once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePolicy {
    ignore_list: BTreeSet<String>,
    domain_map: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse policy YAML")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("no domain mapping entries set")]
    MissingDomainMap,
    #[error("domainMap must contain at least one entry")]
    EmptyDomainMap,
    #[error("domains present in both ignoreList and domainMap: {}", .0.join(", "))]
    OverlappingDomains(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Classification {
    Mapped,
    Ignored,
    Unknown,
    ShortIdentifier,
    PassthroughAlreadyMirrored,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Mapped => "mapped",
            Classification::Ignored => "ignored",
            Classification::Unknown => "unknown",
            Classification::ShortIdentifier => "short-identifier",
            Classification::PassthroughAlreadyMirrored => "passthrough-already-mirrored",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub target_domain: String,
    pub classification: Classification,
}

impl RewritePolicy {
    pub fn new(
        ignore_list: impl IntoIterator<Item = String>,
        domain_map: BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        if domain_map.is_empty() {
            return Err(ConfigError::EmptyDomainMap);
        }
        Ok(Self {
            ignore_list: ignore_list.into_iter().collect(),
            domain_map,
        })
    }

    /// Parses a policy document with `ignoreList` and `domainMap` keys.
    /// A missing `ignoreList` is treated as empty.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, ConfigError> {
        let document: PolicyDocument = serde_yaml_ng::from_slice(bytes)?;
        let domain_map = document.domain_map.ok_or(ConfigError::MissingDomainMap)?;
        Self::new(document.ignore_list.unwrap_or_default(), domain_map)
    }

    pub fn ignore_list(&self) -> &BTreeSet<String> {
        &self.ignore_list
    }

    pub fn domain_map(&self) -> &BTreeMap<String, String> {
        &self.domain_map
    }

    /// Domains listed both as a mapping source and in the ignore list.
    /// The ignore list wins for these, see [`RewritePolicy::evaluate`].
    pub fn overlapping_domains(&self) -> Vec<String> {
        self.domain_map
            .keys()
            .filter(|domain| self.ignore_list.contains(*domain))
            .cloned()
            .collect()
    }

    /// Fails with [`ConfigError::OverlappingDomains`] if any domain is both mapped and ignored.
    pub fn reject_overlaps(self) -> Result<Self, ConfigError> {
        let overlapping = self.overlapping_domains();
        if overlapping.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::OverlappingDomains(overlapping))
        }
    }

    pub fn log_summary(&self) {
        info!(
            "Domain mapping configuration loaded with {} entries",
            self.domain_map().len()
        );
        for (from, to) in self.domain_map() {
            info!(from = %from, to = %to, "Remapping entry");
        }
        if self.ignore_list().is_empty() {
            info!("Ignore list empty");
        } else {
            info!(
                "Ignore list configuration loaded with {} entries",
                self.ignore_list.len()
            );
            for ignored in &self.ignore_list {
                info!(value = %ignored, "Ignore list entry");
            }
        }
        for domain in self.overlapping_domains() {
            warn!(
                domain = %domain,
                "Domain is listed in both domainMap and ignoreList, it will not be rewritten"
            );
        }
    }

    /// Decides the output domain for an already lowercased registry domain.
    ///
    /// Order matters: mirror domains pass through untouched, then the
    /// mapping is applied, then the ignore list overrides any mapping.
    pub fn evaluate(&self, domain: &str) -> PolicyDecision {
        if self.domain_map.values().any(|mirror| mirror == domain) {
            return PolicyDecision {
                target_domain: domain.to_string(),
                classification: Classification::PassthroughAlreadyMirrored,
            };
        }

        let mut decision = self
            .domain_map
            .get(domain)
            .map(|mirror| PolicyDecision {
                target_domain: mirror.clone(),
                classification: Classification::Mapped,
            });

        if self.ignore_list.contains(domain) {
            decision = Some(PolicyDecision {
                target_domain: domain.to_string(),
                classification: Classification::Ignored,
            });
        }

        decision.unwrap_or_else(|| PolicyDecision {
            target_domain: domain.to_string(),
            classification: Classification::Unknown,
        })
    }
}
