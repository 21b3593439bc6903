use crate::{
    Error, Result,
    registry::{GLOBAL_RESOURCE, ResourceRegistry},
};
use std::fmt;

/// Coarse kind of a traffic target.
///
/// Discriminants are the gateway's rate-limit config type codes and are what
/// goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceType {
    Global = 1,
    Service = 3,
    Api = 4,
}

impl ResourceType {
    pub fn of(resource: &str) -> Result<Self> {
        if resource == GLOBAL_RESOURCE {
            Ok(Self::Global)
        } else if resource.starts_with('/') {
            Ok(Self::Api)
        } else if resource.is_empty() {
            Err(Error::EmptyResource)
        } else {
            Ok(Self::Service)
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "GLOBAL"),
            Self::Service => write!(f, "SERVICE"),
            Self::Api => write!(f, "API"),
        }
    }
}

/// Metadata attached to every record of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub config_id: i32,
    pub resource_type: ResourceType,
}

/// Unregistered resources report config id 0.
pub fn config_id(registry: &dyn ResourceRegistry, resource: &str) -> i32 {
    registry.lookup(resource).map_or(0, |config| config.id)
}

pub fn classify(registry: &dyn ResourceRegistry, resource: &str) -> Result<Classification> {
    let resource_type = ResourceType::of(resource)?;
    Ok(Classification {
        config_id: config_id(registry, resource),
        resource_type,
    })
}
