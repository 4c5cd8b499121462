pub mod attention;
pub mod classifier;
pub mod fuser;
pub mod pos_bias;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::ThoughtGeneratorConfig;
use crate::error::Result;
use crate::model::classifier::StageClassifierBank;
use crate::model::fuser::FeaturePyramidFuser;

/// Thought Generator
///
/// Consumes the multi-scale pyramid of an external backbone, fuses it top-down
/// with cross-scale attention and classifies every fused stage. Parameters are
/// only read during a forward pass, so one instance can serve concurrent calls.
#[derive(Debug)]
pub struct ThoughtGenerator {
    /// Model configuration
    pub config: ThoughtGeneratorConfig,
    /// Top-down cross-scale fusion
    fuser: FeaturePyramidFuser,
    /// Per-stage classification heads
    classifiers: StageClassifierBank,
}

impl ThoughtGenerator {
    pub fn load(vb: VarBuilder, config: &ThoughtGeneratorConfig) -> Result<Self> {
        config.validate()?;
        let fuser = FeaturePyramidFuser::load_validated(vb.clone(), config)?;
        let classifiers = StageClassifierBank::load_validated(vb, config)?;
        tracing::info!(
            num_stages = config.num_stages,
            embed_dims = ?config.embed_dims,
            num_heads = ?&config.num_heads[..config.num_fusions()],
            max_relative_position = config.max_relative_position,
            "thought generator built"
        );
        Ok(Self {
            config: config.clone(),
            fuser,
            classifiers,
        })
    }

    pub fn fuser(&self) -> &FeaturePyramidFuser {
        &self.fuser
    }

    /// Full forward pass
    ///
    /// # Arguments
    /// * `features` - Backbone pyramid, finest first, each [B, C_i, H_i, W_i]
    ///
    /// # Returns
    /// (fused_features, logits) where fused_features[i] has the shape of
    /// features[i] and logits[i] is [B, num_classes_i]
    pub fn forward(&self, features: &[Tensor]) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let fused = self.fuser.forward(features)?;
        let logits = self.classifiers.forward(&fused)?;
        Ok((fused, logits))
    }
}
