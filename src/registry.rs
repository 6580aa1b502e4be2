//! Service registry: the snapshot-read mapping from service name to backend.
//!
//! The registry is loaded from a JSON document (`services.json`) whose
//! top-level keys are service names and whose values describe the backend
//! origin, visibility, and access policy. A parsed snapshot is immutable;
//! reloads build a new snapshot and swap it atomically so readers always
//! observe a consistent view.

use serde::Deserialize;
use serde::de::{MapAccess, Visitor};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Permission level carried by a validated gateway token.
///
/// Ordered: `Admin` ⊇ `Billing` ⊇ `User`. Comparisons use the derived
/// `Ord`, so "at least billing" is `level >= PermissionLevel::Billing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    User,
    Billing,
    Admin,
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionLevel::User => "user",
            PermissionLevel::Billing => "billing",
            PermissionLevel::Admin => "admin",
        };
        write!(f, "{}", s)
    }
}

/// Access policy attached to a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Any authenticated user.
    Open,
    /// Billing staff and admins.
    BillingOrAdmin,
    /// Admins only.
    AdminOnly,
}

impl AccessPolicy {
    /// Minimum permission level this policy admits.
    pub fn min_level(&self) -> PermissionLevel {
        match self {
            AccessPolicy::Open => PermissionLevel::User,
            AccessPolicy::BillingOrAdmin => PermissionLevel::Billing,
            AccessPolicy::AdminOnly => PermissionLevel::Admin,
        }
    }

    /// Whether a caller at `level` may reach a service with this policy.
    pub fn allows(&self, level: PermissionLevel) -> bool {
        level >= self.min_level()
    }
}

/// One registered backend service.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    /// Routing key: the first path segment of gateway URLs.
    pub name: String,
    /// Absolute backend origin requests are forwarded to.
    pub origin: Url,
    /// Whether the service appears in the navigation panel.
    pub visible: bool,
    /// Who may reach it.
    pub policy: AccessPolicy,
}

/// Raw JSON shape of a registry value, as operators write it.
#[derive(Debug, Deserialize)]
struct RawEntry {
    url: String,
    #[serde(default)]
    visible: bool,
    #[serde(default)]
    admin_only: bool,
    #[serde(default)]
    billing_or_admin_only: bool,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read {0}: {1}")]
    Io(String, std::io::Error),

    #[error("invalid registry document: {0}")]
    Parse(String),

    #[error("invalid service name {0:?}: names match [a-z0-9_-]+")]
    InvalidName(String),

    #[error("duplicate service name {0:?}")]
    DuplicateName(String),

    #[error("service {0:?} has a non-absolute origin {1:?}")]
    InvalidOrigin(String, String),
}

/// An immutable registry snapshot.
///
/// Entries are kept ordered by name so `visible_for` produces a stable
/// navigation order.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: BTreeMap<String, ServiceEntry>,
}

impl ServiceRegistry {
    /// Load and validate the registry document at `path`.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Io(path.display().to_string(), e))?;
        Self::parse(&text)
    }

    /// Parse and validate a registry document.
    ///
    /// Rejects malformed names, duplicate names, and origins that are not
    /// absolute http(s) URLs.
    pub fn parse(doc: &str) -> Result<Self, RegistryError> {
        let raw: RawDocument =
            serde_json::from_str(doc).map_err(|e| RegistryError::Parse(e.to_string()))?;

        let mut entries = BTreeMap::new();
        for (name, raw) in raw.0 {
            if !is_valid_name(&name) {
                return Err(RegistryError::InvalidName(name));
            }
            let origin = Url::parse(&raw.url)
                .map_err(|_| RegistryError::InvalidOrigin(name.clone(), raw.url.clone()))?;
            if !matches!(origin.scheme(), "http" | "https") || origin.host_str().is_none() {
                return Err(RegistryError::InvalidOrigin(name, raw.url));
            }
            let policy = if raw.admin_only {
                AccessPolicy::AdminOnly
            } else if raw.billing_or_admin_only {
                AccessPolicy::BillingOrAdmin
            } else {
                AccessPolicy::Open
            };
            let entry = ServiceEntry {
                name: name.clone(),
                origin,
                visible: raw.visible,
                policy,
            };
            if entries.insert(name.clone(), entry).is_some() {
                return Err(RegistryError::DuplicateName(name));
            }
        }

        Ok(Self { entries })
    }

    /// Find a service by its routing name.
    pub fn lookup(&self, name: &str) -> Option<&ServiceEntry> {
        self.entries.get(name)
    }

    /// Services a caller at `level` should see in the navigation panel,
    /// ordered by name.
    pub fn visible_for(&self, level: PermissionLevel) -> Vec<&ServiceEntry> {
        self.entries
            .values()
            .filter(|e| e.visible && e.policy.allows(level))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
}

/// Top-level registry document, deserialized pair-by-pair so duplicate keys
/// are observable (a plain map would silently keep the last value).
struct RawDocument(Vec<(String, RawEntry)>);

impl<'de> Deserialize<'de> for RawDocument {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct DocVisitor;

        impl<'de> Visitor<'de> for DocVisitor {
            type Value = RawDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of service name to service description")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut pairs = Vec::new();
                while let Some((name, entry)) = map.next_entry::<String, RawEntry>()? {
                    pairs.push((name, entry));
                }
                Ok(RawDocument(pairs))
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}
