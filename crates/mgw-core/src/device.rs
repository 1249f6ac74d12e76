//! Device identity

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identity of one hardware device attached to the gateway
///
/// Two identities denote the same device when module number, device type and
/// role match. Name and priority are descriptive only and are ignored by
/// equality and hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device module number (selects the business-logic module)
    pub module: u32,
    /// Device type within the module
    pub device_type: u32,
    /// Role of the device in the vehicle (e.g. "left_button")
    pub role: String,
    /// Human-readable device name
    pub name: String,
    /// Priority announced by the device (lower is more important)
    #[serde(default)]
    pub priority: u32,
}

impl DeviceIdentity {
    pub fn new(
        module: u32,
        device_type: u32,
        role: impl Into<String>,
        name: impl Into<String>,
        priority: u32,
    ) -> Self {
        Self {
            module,
            device_type,
            role: role.into(),
            name: name.into(),
            priority,
        }
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.module == other.module
            && self.device_type == other.device_type
            && self.role == other.role
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.module.hash(state);
        self.device_type.hash(state);
        self.role.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.module, self.device_type, self.role)
    }
}
