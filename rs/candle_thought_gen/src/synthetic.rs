//! Deterministic stand-in for a backbone pyramid.
//!
//! Lets the generator be exercised without a backbone: every value depends
//! only on (batch, channel, position), so runs are reproducible on any device.

use candle_core::{Device, Tensor};

use crate::config::ThoughtGeneratorConfig;
use crate::error::{shape_bail, Result};

/// Deterministic [B, C, H, W] tensor with a structured pattern
pub fn pattern_tensor(dims: (usize, usize, usize, usize), device: &Device) -> Result<Tensor> {
    let (batch_size, channels, height, width) = dims;
    let mut data = vec![0.0f32; batch_size * channels * height * width];

    for b in 0..batch_size {
        for c in 0..channels {
            for h in 0..height {
                for w in 0..width {
                    let value = (b + 1) as f32 * 0.1
                        + (c + 1) as f32 * 0.01
                        + (h * width + w) as f32 * 0.001;
                    let idx = b * channels * height * width + c * height * width + h * width + w;
                    data[idx] = value;
                }
            }
        }
    }

    Ok(Tensor::from_vec(data, dims, device)?)
}

/// Pyramid for a `resolution` x `resolution` image: stage i is downsampled by
/// `patch_size * 2^i` and carries `embed_dims[i]` channels
pub fn synthetic_pyramid(
    config: &ThoughtGeneratorConfig,
    batch_size: usize,
    resolution: usize,
    patch_size: usize,
    device: &Device,
) -> Result<Vec<Tensor>> {
    let mut features = Vec::with_capacity(config.num_stages);
    for (i, &channels) in config.embed_dims.iter().enumerate() {
        let stride = patch_size << i;
        let size = resolution / stride;
        if size == 0 {
            shape_bail!("resolution {resolution} is too small for stage {i} (stride {stride})");
        }
        features.push(pattern_tensor((batch_size, channels, size, size), device)?);
    }
    Ok(features)
}
