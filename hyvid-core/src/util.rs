use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use sha2::{Digest, Sha256};

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                log::warn!("running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                log::warn!("running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts frames shaped `(frames, 3, height, width)` into packed rgb24
/// bytes, frame after frame. Float tensors are read as `[0, 1]` intensities.
pub fn frames_to_rgb24(frames: &Tensor) -> Result<(usize, usize, Vec<u8>)> {
    let (_, channels, height, width) = frames.dims4()?;
    if channels != 3 {
        anyhow::bail!("frames_to_rgb24 expects frames with 3 channels, got {channels}");
    }
    let frames = if frames.dtype() == DType::U8 {
        frames.clone()
    } else {
        (frames.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.0)?.to_dtype(DType::U8)?
    };
    let pixels = frames.permute((0, 2, 3, 1))?.flatten_all()?.to_vec1::<u8>()?;
    Ok((width, height, pixels))
}

/// Hex SHA-256 of a file, read in 8 KiB chunks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 8192];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
