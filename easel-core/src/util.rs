use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};

use crate::{DeviceMap, Precision};

/// Picks the accelerator named by `device_map`, falling back to the host CPU
/// when none was compiled in or none is present.
pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    let DeviceMap::Ordinal(ordinal) = device_map else {
        return Ok(Device::Cpu);
    };
    if cuda_is_available() {
        return Ok(Device::new_cuda(ordinal)?);
    }
    if metal_is_available() {
        return Ok(Device::new_metal(ordinal)?);
    }
    let feature = if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "metal"
    } else {
        "cuda"
    };
    tracing::warn!(
        ordinal,
        "no accelerator available, generating on the host CPU (enable the `{feature}` feature for GPU support)"
    );
    Ok(Device::Cpu)
}

/// Resolves the weight precision for a device. Half precision is only used
/// off the host CPU, where the candle kernels for it are fast.
pub fn select_dtype(precision: Precision, device: &Device) -> DType {
    match precision {
        Precision::F32 => DType::F32,
        Precision::F16 => DType::F16,
        Precision::Auto if device.is_cpu() => DType::F32,
        Precision::Auto => DType::F16,
    }
}

/// Turns a decoded `(3, height, width)` u8 tensor into an RGB image.
pub fn tensor_to_image(pixels: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = pixels.dims3()?;
    anyhow::ensure!(channels == 3, "decoded image has {channels} channels, expected RGB");
    let interleaved = pixels.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let rgb = RgbImage::from_raw(width as u32, height as u32, interleaved)
        .with_context(|| format!("pixel buffer does not fill a {width}x{height} image"))?;
    Ok(DynamicImage::ImageRgb8(rgb))
}
