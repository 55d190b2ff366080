use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use tracing::info;

use crate::DeviceMap;

pub(crate) fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            info!("no accelerator available, running on cpu");
            Ok(Device::Cpu)
        }
    }
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub(crate) fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_roundtrips_to_rgb_image() {
        let device = Device::Cpu;
        let pixels: Vec<u8> = (0..3 * 2 * 4).map(|v| v as u8).collect();
        let tensor = Tensor::from_vec(pixels, (3, 2, 4), &device).unwrap();
        let image = tensor_to_image(&tensor).unwrap();
        assert_eq!(image.width(), 4);
        assert_eq!(image.height(), 2);
    }

    #[test]
    fn tensor_with_wrong_channel_count_is_rejected() {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((4, 2, 2), candle_core::DType::U8, &device).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }
}
