//! Storage-location identifiers for tensor values.
//!
//! Every tensor records the device it lives on so that specializations built
//! for one placement are never reused for another. Scalars always live on
//! [`DeviceId::DEFAULT`].

use serde::{Deserialize, Serialize};

/// Unique identifier for a device within a backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// The host device every value starts on.
    pub const DEFAULT: Self = Self(0);
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device:{}", self.0)
    }
}
