pub mod hub;
pub mod tokenizer;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::{info, warn};

use crate::error::{InferError, InferResult};

/// Open one device per requested ordinal: CUDA when present, then Metal,
/// otherwise a single CPU device. With `require_accelerator` the CPU fallback
/// is a configuration error.
pub fn select_devices(gpus: &[usize], force_cpu: bool, require_accelerator: bool) -> InferResult<Vec<Device>> {
    if force_cpu {
        return Ok(vec![Device::Cpu]);
    }
    if cuda_is_available() {
        let devices = gpus
            .iter()
            .map(|&ordinal| Device::new_cuda(ordinal))
            .collect::<candle_core::Result<Vec<_>>>()?;
        info!(?gpus, "using CUDA devices");
        return Ok(devices);
    }
    if metal_is_available() {
        let devices = gpus
            .iter()
            .map(|&ordinal| Device::new_metal(ordinal))
            .collect::<candle_core::Result<Vec<_>>>()?;
        info!(?gpus, "using Metal devices");
        return Ok(devices);
    }
    if require_accelerator {
        return Err(InferError::config(
            "the serving backend requires a CUDA or Metal device but none is available",
        ));
    }
    warn!(?gpus, "no accelerator available, running on CPU");
    Ok(vec![Device::Cpu])
}

/// Parse a comma separated device list such as `"0,1"`.
pub fn parse_gpu_list(gpus: &str) -> Option<Vec<usize>> {
    let ordinals: Option<Vec<usize>> = gpus
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect();
    ordinals.filter(|o| !o.is_empty())
}
