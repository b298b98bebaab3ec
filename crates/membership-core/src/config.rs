//! Configuration structures for membership resolution.
//!
//! This module provides the cache configuration consumed by the resolver's cache
//! registry, the directory schema describing how groups store their members, and
//! the top-level resolver configuration that bundles both.

use crate::{CacheConfigId, Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use validator::Validate;

/// Default cache name.
pub const DEFAULT_CACHE_NAME: &str = "groups";

/// Default time-to-live for cached group memberships (six hours).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 21_600;

/// Upper bound accepted for the cache time-to-live (thirty days).
pub const MAX_CACHE_TTL_SECS: u64 = 2_592_000;

/// Tunable cache settings, as found in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CacheSettings {
    /// Human-readable cache name used in logs
    #[validate(length(min = 1))]
    #[serde(default = "default_cache_name")]
    pub name: String,

    /// Entry time-to-live in seconds
    #[validate(range(min = 1, max = 2_592_000))]
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum number of cached groups (unbounded when absent)
    #[validate(range(min = 1))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

fn default_cache_name() -> String {
    DEFAULT_CACHE_NAME.to_string()
}

const fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

impl CacheSettings {
    /// Create cache settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: default_cache_name(),
            ttl_secs: default_cache_ttl_secs(),
            capacity: None,
        }
    }

    /// Set the cache name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the time-to-live in seconds.
    #[must_use]
    pub const fn with_ttl_secs(mut self, seconds: u64) -> Self {
        self.ttl_secs = seconds;
        self
    }

    /// Bound the number of cached groups.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable cache configuration.
///
/// Memoization in the cache registry keys off [`CacheConfiguration::id`]: clones of a
/// configuration denote the same cache, while two configurations built separately
/// from identical settings denote two distinct caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfiguration {
    id: CacheConfigId,
    name: String,
    ttl: Duration,
    capacity: Option<usize>,
}

impl CacheConfiguration {
    /// Build a configuration from validated settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the settings fail validation.
    pub fn new(settings: CacheSettings) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| Error::ConfigError(format!("Invalid cache configuration: {e}")))?;

        Ok(Self {
            id: CacheConfigId::new_v4(),
            name: settings.name,
            ttl: Duration::from_secs(settings.ttl_secs),
            capacity: settings.capacity,
        })
    }

    /// Identity used for cache memoization.
    #[must_use]
    pub const fn id(&self) -> CacheConfigId {
        self.id
    }

    /// Cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Maximum number of entries, if bounded.
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

/// Describes how groups and their members are laid out in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct GroupSchema {
    /// Attributes whose values are member distinguished names
    #[serde(default = "default_member_attributes")]
    pub member_attributes: Vec<String>,

    /// Attributes whose values are member uids (posix groups)
    #[serde(default = "default_member_uid_attributes")]
    pub member_uid_attributes: Vec<String>,

    /// Object classes that mark an entry as a group
    #[validate(length(min = 1))]
    #[serde(default = "default_group_object_classes")]
    pub group_object_classes: Vec<String>,

    /// Search base used to resolve member uids into distinguished names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_base_dn: Option<String>,

    /// Attribute matched against member uids when resolving them
    #[validate(length(min = 1))]
    #[serde(default = "default_user_lookup_attribute")]
    pub user_lookup_attribute: String,

    /// Whether members that are themselves groups get expanded
    #[serde(default = "default_resolve_nested_groups")]
    pub resolve_nested_groups: bool,
}

fn default_member_attributes() -> Vec<String> {
    vec!["member".to_string(), "uniqueMember".to_string()]
}

fn default_member_uid_attributes() -> Vec<String> {
    vec!["memberUid".to_string()]
}

fn default_group_object_classes() -> Vec<String> {
    [
        "group",
        "groupOfNames",
        "groupOfUniqueNames",
        "dynamicGroup",
        "dynamicGroupAux",
        "groupWiseDistributionList",
        "posixGroup",
        "apple-group",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn default_user_lookup_attribute() -> String {
    "uid".to_string()
}

const fn default_resolve_nested_groups() -> bool {
    true
}

impl GroupSchema {
    /// Create a schema with the default attribute and object class names.
    #[must_use]
    pub fn new() -> Self {
        Self {
            member_attributes: default_member_attributes(),
            member_uid_attributes: default_member_uid_attributes(),
            group_object_classes: default_group_object_classes(),
            user_base_dn: None,
            user_lookup_attribute: default_user_lookup_attribute(),
            resolve_nested_groups: default_resolve_nested_groups(),
        }
    }

    /// Replace the member DN attributes.
    #[must_use]
    pub fn with_member_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.member_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the member uid attributes.
    #[must_use]
    pub fn with_member_uid_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.member_uid_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the search base for member uid resolution.
    #[must_use]
    pub fn with_user_base_dn(mut self, dn: impl Into<String>) -> Self {
        self.user_base_dn = Some(dn.into());
        self
    }

    /// Set the attribute matched against member uids.
    #[must_use]
    pub fn with_user_lookup_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.user_lookup_attribute = attribute.into();
        self
    }

    /// Enable or disable nested group expansion.
    #[must_use]
    pub const fn with_nested_groups(mut self, enabled: bool) -> Self {
        self.resolve_nested_groups = enabled;
        self
    }

    /// Returns true if one of `object_classes` is a configured group class.
    #[must_use]
    pub fn is_group_class<S: AsRef<str>>(&self, object_classes: &[S]) -> bool {
        object_classes.iter().any(|class| {
            self.group_object_classes
                .iter()
                .any(|group_class| group_class.eq_ignore_ascii_case(class.as_ref()))
        })
    }
}

impl Default for GroupSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ResolverConfig {
    /// Directory attribute used as the per-member display value
    #[validate(length(min = 1))]
    pub uid_attribute: String,

    /// Group layout in the directory
    #[validate(nested)]
    #[serde(default)]
    pub schema: GroupSchema,

    /// Group cache settings
    #[validate(nested)]
    #[serde(default)]
    pub cache: CacheSettings,
}

impl ResolverConfig {
    /// Create a resolver configuration with the required uid attribute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if validation fails.
    pub fn new(uid_attribute: impl Into<String>) -> Result<Self> {
        let config = Self {
            uid_attribute: uid_attribute.into(),
            schema: GroupSchema::default(),
            cache: CacheSettings::default(),
        };
        config.checked()
    }

    /// Load and validate a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the document cannot be parsed or is invalid.
    pub fn from_json(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input)
            .map_err(|e| Error::ConfigError(format!("Invalid resolver configuration: {e}")))?;
        debug!(uid_attribute = %config.uid_attribute, cache = %config.cache.name, "loaded resolver configuration");
        config.checked()
    }

    /// Set the group schema.
    #[must_use]
    pub fn with_schema(mut self, schema: GroupSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Set the cache settings.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    fn checked(self) -> Result<Self> {
        self.validate()
            .map_err(|e| Error::ConfigError(format!("Invalid resolver configuration: {e}")))?;
        Ok(self)
    }
}
