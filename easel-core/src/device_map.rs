use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Which device the session should try to load models onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Where a loaded model actually lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    Accelerator,
    HostCpu,
}

impl Placement {
    pub fn of(device: &Device) -> Self {
        if device.is_cpu() {
            Self::HostCpu
        } else {
            Self::Accelerator
        }
    }
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accelerator => f.write_str("accelerator"),
            Self::HostCpu => f.write_str("cpu"),
        }
    }
}
