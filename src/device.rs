use candle_core::{DType, Device};
use tracing::info;

use crate::error::Result;

/// Resolve the compute device once at startup. Accelerators are only probed
/// when the matching cargo feature is compiled in.
pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        info!("CPU forced by configuration");
        return Ok(Device::Cpu);
    }

    if let Some(device) = probe_accelerator() {
        return Ok(device);
    }

    info!("No accelerator found, using CPU");
    Ok(Device::Cpu)
}

fn probe_accelerator() -> Option<Device> {
    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => return Some(device),
            Err(e) => tracing::warn!(error = %e, "CUDA support compiled in but no device usable"),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => return Some(device),
            Err(e) => tracing::warn!(error = %e, "Metal support compiled in but no device usable"),
        }
    }

    None
}

/// Weights precision for a device: BF16 on CUDA, F32 everywhere else.
pub fn model_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    }
}

pub fn device_info(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_cpu_skips_accelerators() {
        let device = select_device(true).unwrap();
        assert!(device.is_cpu());
        assert_eq!(device_info(&device), "CPU");
        assert_eq!(model_dtype(&device), DType::F32);
    }
}
