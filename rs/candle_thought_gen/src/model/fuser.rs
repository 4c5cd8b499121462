//! Feature Pyramid Fuser
//!
//! Runs one back-to-front pass over the backbone pyramid:
//!
//! - fused[S-1] = F[S-1], untouched
//! - for i = S-2 down to 0: resample fused[i+1] to the size of F[i] (bilinear,
//!   no corner alignment), then fused[i] = attention_i(query = F[i],
//!   key = value = resampled fused[i+1])
//!
//! Each stage pair owns its own [`CrossScaleAttention`], as the channel widths
//! differ between pairs.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::ThoughtGeneratorConfig;
use crate::error::{shape_bail, Result};
use crate::model::attention::{CrossScaleAttention, CrossScaleAttentionConfig};

/// Resize `x` of shape [B, C, H, W] to [B, C, height, width] with bilinear
/// interpolation, no corner alignment; same-size input is returned as is
pub fn resize_bilinear(x: &Tensor, (height, width): (usize, usize)) -> Result<Tensor> {
    let (_b, _c, in_h, in_w) = x.dims4()?;
    if height == 0 || width == 0 || in_h == 0 || in_w == 0 {
        shape_bail!("cannot resize {in_h}x{in_w} to {height}x{width}");
    }
    if (in_h, in_w) == (height, width) {
        return Ok(x.clone());
    }
    Ok(x.upsample_bilinear2d(height, width, false)?)
}

/// [B, C, H, W] -> [B, H*W, C]
pub(crate) fn to_tokens(x: &Tensor) -> Result<Tensor> {
    Ok(x.flatten_from(2)?.transpose(1, 2)?.contiguous()?)
}

#[derive(Debug)]
pub struct FeaturePyramidFuser {
    /// fusions[i] merges stage i with the fused stage i + 1
    fusions: Vec<CrossScaleAttention>,
    embed_dims: Vec<usize>,
}

impl FeaturePyramidFuser {
    /// Validates `config` before building, for use outside [`crate::ThoughtGenerator`]
    pub fn load(vb: VarBuilder, config: &ThoughtGeneratorConfig) -> Result<Self> {
        config.validate()?;
        Self::load_validated(vb, config)
    }

    pub(crate) fn load_validated(vb: VarBuilder, config: &ThoughtGeneratorConfig) -> Result<Self> {
        let mut fusions = Vec::with_capacity(config.num_fusions());
        for i in 0..config.num_fusions() {
            let (dim_q, dim_kv, num_heads) = config.fusion_dims(i);
            let fusion = CrossScaleAttention::load(
                vb.pp(format!("fusions.{}", i)),
                CrossScaleAttentionConfig {
                    dim_q,
                    dim_kv,
                    num_heads,
                    max_relative_position: config.max_relative_position,
                    layer_norm_eps: config.layer_norm_eps,
                },
            )?;
            fusions.push(fusion);
        }

        Ok(Self {
            fusions,
            embed_dims: config.embed_dims.clone(),
        })
    }

    pub fn num_stages(&self) -> usize {
        self.embed_dims.len()
    }

    pub fn fusion(&self, stage: usize) -> Option<&CrossScaleAttention> {
        self.fusions.get(stage)
    }

    /// Check the stage count, rank, batch and channel width of the pyramid
    fn check_pyramid(&self, features: &[Tensor]) -> Result<()> {
        if features.len() != self.num_stages() {
            shape_bail!(
                "expected {} pyramid stages, got {}",
                self.num_stages(),
                features.len()
            );
        }
        let batch = features[0].dims4()?.0;
        for (i, (feature, &channels)) in features.iter().zip(&self.embed_dims).enumerate() {
            let (b, c, _h, _w) = feature.dims4()?;
            if b != batch {
                shape_bail!("stage {i} has batch {b}, stage 0 has batch {batch}");
            }
            if c != channels {
                shape_bail!("stage {i} has {c} channels, expected {channels}");
            }
        }
        Ok(())
    }

    /// Fuse one stage: returns [B, C_i, H_i, W_i]
    fn fuse_stage(&self, stage: usize, current: &Tensor, next: &Tensor) -> Result<Tensor> {
        let (b, c_current, h, w) = current.dims4()?;
        let (_, c_next, h_next, w_next) = next.dims4()?;

        let next = if (h_next, w_next) != (h, w) {
            tracing::debug!(stage, from = ?(h_next, w_next), to = ?(h, w), "resampling fused feature");
            resize_bilinear(next, (h, w))?
        } else {
            next.clone()
        };

        let current_flat = to_tokens(current)?;
        let next_flat = to_tokens(&next)?;

        let fused = self.fusions[stage].forward(&current_flat, &next_flat, &next_flat, h, w)?;
        tracing::debug!(stage, c_current, c_next, h, w, "fused stage");

        // [B, H*W, C] -> [B, C, H, W]
        Ok(fused
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, c_current, h, w))?)
    }

    /// # Arguments
    /// * `features` - Backbone pyramid, finest first, each [B, C_i, H_i, W_i]
    ///
    /// # Returns
    /// One fused feature map per stage, same shapes as the input
    pub fn forward(&self, features: &[Tensor]) -> Result<Vec<Tensor>> {
        self.check_pyramid(features)?;

        let last = features.len() - 1;
        let mut next = features[last].clone();
        let mut fused: Vec<Tensor> = Vec::with_capacity(features.len());
        fused.push(next.clone());

        // Built coarse to fine and reversed at the end
        for i in (0..last).rev() {
            next = self.fuse_stage(i, &features[i], &next)?;
            fused.push(next.clone());
        }

        fused.reverse();
        Ok(fused)
    }
}
