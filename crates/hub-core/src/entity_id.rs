//! Entity identifiers of the form `<domain>.<object_id>`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::util::slugify;

/// Reasons an entity id string can be rejected
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("entity_id must be '<domain>.<object_id>' with a single '.'")]
    InvalidFormat,

    #[error("domain cannot be empty")]
    EmptyDomain,

    #[error("object_id cannot be empty")]
    EmptyObjectId,

    #[error("invalid domain '{0}' (lowercase alphanumerics and single underscores only)")]
    InvalidDomain(String),

    #[error("invalid object_id '{0}' (lowercase alphanumerics and underscores only)")]
    InvalidObjectId(String),
}

/// Identifier of one tracked entity, e.g. `device_tracker.paulus_phone`
///
/// The domain is the category (`light`, `device_tracker`, `group`) and the
/// object id is a slug unique within that domain. Once built an id never
/// changes; it keys exactly one record in the state store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    domain: String,
    object_id: String,
}

impl EntityId {
    /// Build an id from its two parts, validating both
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Result<Self, EntityIdError> {
        let domain = domain.into();
        let object_id = object_id.into();

        if domain.is_empty() {
            return Err(EntityIdError::EmptyDomain);
        }
        if object_id.is_empty() {
            return Err(EntityIdError::EmptyObjectId);
        }
        if !valid_domain(&domain) {
            return Err(EntityIdError::InvalidDomain(domain));
        }
        if !valid_object_id(&object_id) {
            return Err(EntityIdError::InvalidObjectId(object_id));
        }

        Ok(Self { domain, object_id })
    }

    /// Build an id whose object id is the slug of a free-form name
    ///
    /// `("device_tracker", "Paulus Phone")` becomes
    /// `device_tracker.paulus_phone`.
    pub fn from_name(domain: impl Into<String>, name: &str) -> Result<Self, EntityIdError> {
        Self::new(domain, slugify(name))
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Whether this id belongs to `domain`
    pub fn in_domain(&self, domain: &str) -> bool {
        self.domain == domain
    }
}

fn valid_object_id(s: &str) -> bool {
    !s.starts_with('_')
        && !s.ends_with('_')
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn valid_domain(s: &str) -> bool {
    !s.contains("__") && valid_object_id(s)
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((domain, object_id)) if !object_id.contains('.') => Self::new(domain, object_id),
            _ => Err(EntityIdError::InvalidFormat),
        }
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: EntityId = "device_tracker.paulus_phone".parse().unwrap();
        assert_eq!(id.domain(), "device_tracker");
        assert_eq!(id.object_id(), "paulus_phone");
        assert_eq!(id.to_string(), "device_tracker.paulus_phone");
        assert!(id.in_domain("device_tracker"));
        assert!(!id.in_domain("light"));
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert_eq!(
            "nodot".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
        assert_eq!(
            "a.b.c".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
        assert_eq!(
            ".kitchen".parse::<EntityId>().unwrap_err(),
            EntityIdError::EmptyDomain
        );
        assert_eq!(
            "light.".parse::<EntityId>().unwrap_err(),
            EntityIdError::EmptyObjectId
        );
    }

    #[test]
    fn test_character_rules() {
        assert!(matches!(
            "Light.kitchen".parse::<EntityId>(),
            Err(EntityIdError::InvalidDomain(_))
        ));
        assert!(matches!(
            "light.Kitchen".parse::<EntityId>(),
            Err(EntityIdError::InvalidObjectId(_))
        ));
        assert!(matches!(
            "my__light.kitchen".parse::<EntityId>(),
            Err(EntityIdError::InvalidDomain(_))
        ));
        assert!(matches!(
            "light._kitchen".parse::<EntityId>(),
            Err(EntityIdError::InvalidObjectId(_))
        ));
        // Double underscores are fine in the object id
        assert!("light.my__kitchen".parse::<EntityId>().is_ok());
    }

    #[test]
    fn test_from_name_slugifies() {
        let id = EntityId::from_name("device_tracker", "Paulus Phone").unwrap();
        assert_eq!(id.to_string(), "device_tracker.paulus_phone");
    }

    #[test]
    fn test_serializes_as_string() {
        let id = EntityId::new("group", "all_devices").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"group.all_devices\"");
        assert!(serde_json::from_str::<EntityId>("\"bad id\"").is_err());
    }
}
