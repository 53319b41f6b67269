use crate::capability::CustomCapabilityRegistry;
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Identifier of a component instance inside the host, written as `type` or `type/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    kind: String,
    name: Option<String>,
}

impl ComponentId {
    pub fn new(kind: &str) -> ComponentId {
        ComponentId {
            kind: kind.to_string(),
            name: None,
        }
    }

    pub fn with_name(kind: &str, name: &str) -> ComponentId {
        ComponentId {
            kind: kind.to_string(),
            name: Some(name.to_string()),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.kind, name),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for ComponentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (kind, name) = match s.split_once('/') {
            Some((kind, name)) => (kind.trim(), Some(name.trim())),
            None => (s, None),
        };

        if kind.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "component id {:?} has an empty type",
                s
            )));
        }

        match name {
            Some("") => Err(Error::InvalidConfig(format!(
                "component id {:?} has an empty name after the separator",
                s
            ))),
            Some(name) => Ok(ComponentId::with_name(kind, name)),
            None => Ok(ComponentId::new(kind)),
        }
    }
}

impl Serialize for ComponentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ComponentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An extension made available to components by the host.
pub trait Extension: Send + Sync {
    /// Returns the custom capability registry this extension provides, if it is one
    fn as_capability_registry(&self) -> Option<Arc<dyn CustomCapabilityRegistry>> {
        None
    }
}

/// The host runtime that owns the component lifecycle and its extensions.
pub trait Host: Send + Sync {
    fn extension(&self, id: &ComponentId) -> Option<Arc<dyn Extension>>;
}

/// Looks up the OpAMP extension `id` on the host and returns its capability registry.
///
/// Fails when the extension is absent, or when it exists but does not act as a registry.
pub fn capability_registry(
    host: &dyn Host,
    id: &ComponentId,
) -> Result<Arc<dyn CustomCapabilityRegistry>> {
    let ext = host
        .extension(id)
        .ok_or_else(|| Error::ExtensionNotFound(id.clone()))?;
    ext.as_capability_registry()
        .ok_or_else(|| Error::NotACapabilityRegistry(id.clone()))
}

/// A `Host` backed by a fixed map of extensions
#[derive(Default, Clone)]
pub struct StaticHost {
    extensions: std::collections::HashMap<ComponentId, Arc<dyn Extension>>,
}

impl StaticHost {
    pub fn new() -> StaticHost {
        StaticHost::default()
    }

    pub fn with_extension(mut self, id: ComponentId, ext: Arc<dyn Extension>) -> StaticHost {
        self.extensions.insert(id, ext);
        self
    }
}

impl Host for StaticHost {
    fn extension(&self, id: &ComponentId) -> Option<Arc<dyn Extension>> {
        self.extensions.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PlainExtension;
    impl Extension for PlainExtension {}

    #[test]
    fn parse_and_display() {
        let id: ComponentId = "snapshotprocessor/edge".parse().unwrap();
        assert_eq!(id.kind(), "snapshotprocessor");
        assert_eq!(id.name(), Some("edge"));
        assert_eq!(id.to_string(), "snapshotprocessor/edge");

        let id: ComponentId = "opamp".parse().unwrap();
        assert_eq!(id.name(), None);
        assert_eq!(id.to_string(), "opamp");
    }

    #[test]
    fn rejects_empty_parts() {
        assert!("".parse::<ComponentId>().is_err());
        assert!("/name".parse::<ComponentId>().is_err());
        assert!("kind/".parse::<ComponentId>().is_err());
    }

    #[test]
    fn serde_as_string() {
        let id = ComponentId::with_name("loganomaly", "prod");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"loganomaly/prod\"");
        let back: ComponentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn registry_lookup_errors() {
        let opamp = ComponentId::new("opamp");
        let host = StaticHost::new();
        let err = capability_registry(&host, &opamp).err().unwrap();
        assert_eq!(err.to_string(), "opamp extension \"opamp\" does not exist");

        let host = StaticHost::new().with_extension(opamp.clone(), Arc::new(PlainExtension));
        let err = capability_registry(&host, &opamp).err().unwrap();
        assert!(matches!(err, Error::NotACapabilityRegistry(_)));
    }
}
