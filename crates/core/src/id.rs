//! Strongly-typed identifiers used across the ledger.
//!
//! Tenants, devices and actors are named by the surrounding product (e.g.
//! `"brunch-co"`, `"pos-7"`), so they are validated string newtypes. Event ids
//! are generated locally and must never collide across devices, so they are
//! random 128-bit UUIDs.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Upper bound for externally supplied identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Identifier of a tenant (multi-tenant boundary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

/// Identifier of the physical or logical device that originates events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

/// Identifier of the user or system principal that caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(String);

/// Domain action tag of an event (e.g. `"ORDER_CREATED"`).
///
/// This is an open set: the ledger never restricts which tags exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

fn validate(name: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::invalid_id(format!("{name}: must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(DomainError::invalid_id(format!(
            "{name}: longer than {MAX_ID_LEN} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(DomainError::invalid_id(format!(
            "{name}: contains control characters"
        )));
    }
    Ok(())
}

macro_rules! impl_string_newtype {
    ($t:ident, $name:literal) => {
        impl $t {
            /// Validate and wrap an identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                validate($name, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $t {
            type Error = DomainError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_string_newtype!(TenantId, "TenantId");
impl_string_newtype!(DeviceId, "DeviceId");
impl_string_newtype!(ActorId, "ActorId");
impl_string_newtype!(EventType, "EventType");

impl EventType {
    /// Build a tag from a compile-time constant known to be valid.
    pub fn from_static(tag: &'static str) -> Self {
        debug_assert!(validate("EventType", tag).is_ok(), "invalid static event type {tag:?}");
        Self(tag.to_string())
    }
}

/// Globally unique event identifier.
///
/// Uses UUIDv4 (122 random bits) so devices never need to coordinate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<EventId> for Uuid {
    fn from(value: EventId) -> Self {
        value.0
    }
}

impl FromStr for EventId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("EventId: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_reject_blank_and_control_chars() {
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("   ").is_err());
        assert!(DeviceId::new("pos\n7").is_err());
        assert!(ActorId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
        assert_eq!(DeviceId::new("pos-7").unwrap().as_str(), "pos-7");
        assert_eq!(EventType::from_static("ORDER_CREATED").as_str(), "ORDER_CREATED");
    }

    #[test]
    fn string_ids_validate_on_deserialize() {
        let ok: TenantId = serde_json::from_str("\"brunch-co\"").unwrap();
        assert_eq!(ok.to_string(), "brunch-co");

        let bad: Result<TenantId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn event_ids_are_unique_and_parse_back() {
        let a = EventId::new();
        let b = EventId::new();
        assert_ne!(a, b);

        let parsed: EventId = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }
}
