//! Per-stage classification heads: global average pooling followed by a
//! linear map to raw logits. Softmax and loss are left to the caller.

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::ThoughtGeneratorConfig;
use crate::error::{shape_bail, Result};

#[derive(Debug)]
pub struct StageClassifierBank {
    classifiers: Vec<Linear>,
    in_dims: Vec<usize>,
}

impl StageClassifierBank {
    /// Validates `config` before building, for use outside [`crate::ThoughtGenerator`]
    pub fn load(vb: VarBuilder, config: &ThoughtGeneratorConfig) -> Result<Self> {
        config.validate()?;
        Self::load_validated(vb, config)
    }

    pub(crate) fn load_validated(vb: VarBuilder, config: &ThoughtGeneratorConfig) -> Result<Self> {
        let mut classifiers = Vec::with_capacity(config.num_stages);
        for (i, &channels) in config.embed_dims.iter().enumerate() {
            let num_classes = config.num_classes.for_stage(i);
            classifiers.push(linear(
                channels,
                num_classes,
                vb.pp(format!("classifiers.{}", i)),
            )?);
        }

        Ok(Self {
            classifiers,
            in_dims: config.embed_dims.clone(),
        })
    }

    /// # Arguments
    /// * `features` - Fused features, finest first, each [B, C_i, H_i, W_i]
    ///
    /// # Returns
    /// One logit tensor [B, num_classes_i] per stage
    pub fn forward(&self, features: &[Tensor]) -> Result<Vec<Tensor>> {
        if features.len() != self.classifiers.len() {
            shape_bail!(
                "expected {} fused features, got {}",
                self.classifiers.len(),
                features.len()
            );
        }

        let mut logits = Vec::with_capacity(features.len());
        for (i, (feature, classifier)) in features.iter().zip(&self.classifiers).enumerate() {
            let (_b, c, _h, _w) = feature.dims4()?;
            if c != self.in_dims[i] {
                shape_bail!("stage {i} has {c} channels, classifier expects {}", self.in_dims[i]);
            }
            // [B, C, H, W] -> [B, C]
            let pooled = feature.flatten_from(2)?.mean(D::Minus1)?;
            logits.push(classifier.forward(&pooled)?);
        }
        Ok(logits)
    }
}
