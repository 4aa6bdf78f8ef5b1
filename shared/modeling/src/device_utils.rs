use std::{fmt, str::FromStr};

use tch::{utils::has_mps, Device};
use thiserror::Error;

/// The device set a run trains on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Devices {
    Cpu,
    Mps,
    Cuda(Vec<usize>),
}

/// Best devices this host offers: MPS on Apple hardware, every CUDA device
/// where present, CPU otherwise.
pub fn get_optimal_devices() -> Devices {
    if cfg!(target_os = "macos") && has_mps() {
        return Devices::Mps;
    }
    let cuda_count = tch::Cuda::device_count() as usize;
    if cuda_count > 0 {
        return Devices::Cuda((0..cuda_count).collect());
    }
    Devices::Cpu
}

impl Default for Devices {
    fn default() -> Self {
        get_optimal_devices()
    }
}

impl fmt::Display for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Devices::Cpu => write!(f, "CPU"),
            Devices::Mps => write!(f, "MPS"),
            Devices::Cuda(ids) => {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                write!(f, "CUDA({})", ids.join(", "))
            }
        }
    }
}

impl Devices {
    /// Number of distinct physical devices in the set.
    pub fn size(&self) -> usize {
        match self {
            Devices::Cpu | Devices::Mps => 1,
            Devices::Cuda(ids) => ids.len(),
        }
    }

    /// The device rank `n` trains on.
    ///
    /// An explicit CPU world serves every rank (replicas share the host;
    /// used on machines without accelerators and in tests). MPS is one
    /// physical device, so only rank 0.
    pub fn device_for_rank(&self, n: usize) -> Option<Device> {
        match self {
            Devices::Cpu => Some(Device::Cpu),
            Devices::Mps if n == 0 => Some(Device::Mps),
            Devices::Mps => None,
            Devices::Cuda(ids) => ids.get(n).map(|id| Device::Cuda(*id)),
        }
    }
}

#[derive(Error, Debug)]
pub enum DevicesParseError {
    #[error("device '{0}' is not available on this system")]
    DeviceNotAvailable(String),

    #[error("invalid device string '{0}' (expected auto, cpu, mps, cuda, or cuda:X,Y)")]
    Invalid(String),
}

impl FromStr for Devices {
    type Err = DevicesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let cuda_count = tch::Cuda::device_count() as usize;
        match lower.as_str() {
            "auto" => Ok(get_optimal_devices()),
            "cpu" => Ok(Devices::Cpu),
            "mps" => {
                if !has_mps() {
                    return Err(DevicesParseError::DeviceNotAvailable(lower));
                }
                Ok(Devices::Mps)
            }
            "cuda" => {
                if cuda_count == 0 {
                    return Err(DevicesParseError::DeviceNotAvailable(lower));
                }
                Ok(Devices::Cuda((0..cuda_count).collect()))
            }
            _ => {
                let Some(list) = lower.strip_prefix("cuda:") else {
                    return Err(DevicesParseError::Invalid(s.to_string()));
                };
                let ids = list
                    .split(',')
                    .map(|id| id.trim().parse::<usize>())
                    .collect::<Result<Vec<usize>, _>>()
                    .map_err(|_| DevicesParseError::Invalid(s.to_string()))?;
                if ids.is_empty() {
                    return Err(DevicesParseError::Invalid(s.to_string()));
                }
                if let Some(bad) = ids.iter().find(|&&id| id >= cuda_count) {
                    return Err(DevicesParseError::DeviceNotAvailable(format!("cuda:{bad}")));
                }
                Ok(Devices::Cuda(ids))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_strings() {
        assert!("auto".parse::<Devices>().is_ok());
        assert_eq!("cpu".parse::<Devices>().unwrap(), Devices::Cpu);
        assert!("".parse::<Devices>().is_err());
        assert!("banana".parse::<Devices>().is_err());
        assert!("cuda:abc".parse::<Devices>().is_err());
        assert!("cuda:-1".parse::<Devices>().is_err());

        if tch::Cuda::device_count() == 0 {
            assert!(matches!(
                "cuda".parse::<Devices>(),
                Err(DevicesParseError::DeviceNotAvailable(_))
            ));
        }
    }

    #[test]
    fn test_cpu_world_serves_every_rank() {
        for rank in 0..4 {
            assert_eq!(Devices::Cpu.device_for_rank(rank), Some(Device::Cpu));
        }
        assert_eq!(Devices::Cpu.size(), 1);
    }

    #[test]
    fn test_cuda_ranks_map_to_indices() {
        let devices = Devices::Cuda(vec![0, 1]);
        assert_eq!(devices.size(), 2);
        assert_eq!(devices.device_for_rank(0), Some(Device::Cuda(0)));
        assert_eq!(devices.device_for_rank(1), Some(Device::Cuda(1)));
        assert_eq!(devices.device_for_rank(2), None);
    }
}
