use candle_core::utils::cuda_is_available;
use candle_core::Device;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Coarse device classification reported over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Cuda,
    Cpu,
}

serde_plain::derive_display_from_serialize!(DeviceClass);

impl DeviceClass {
    pub fn of(device: &Device) -> Self {
        if device.is_cuda() {
            Self::Cuda
        } else {
            Self::Cpu
        }
    }

    /// Class the loader would pick on this host, used when no model is loaded.
    pub fn probe() -> Self {
        if cuda_is_available() {
            Self::Cuda
        } else {
            Self::Cpu
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_targets_first_accelerator() {
        assert_eq!(DeviceMap::default(), DeviceMap::Ordinal(0));
    }

    #[test]
    fn cpu_device_classifies_as_cpu() {
        assert_eq!(DeviceClass::of(&Device::Cpu), DeviceClass::Cpu);
    }

    #[test]
    fn device_class_serializes_lowercase() {
        assert_eq!(serde_plain::to_string(&DeviceClass::Cuda).unwrap(), "cuda");
        assert_eq!(serde_plain::to_string(&DeviceClass::Cpu).unwrap(), "cpu");
        assert_eq!(DeviceClass::Cpu.to_string(), "cpu");
    }
}
