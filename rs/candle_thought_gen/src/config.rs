//! Thought Generator Configuration
//!
//! This module defines the configuration consumed by the fusion model: stage
//! count, per-stage channel widths, per-stage-pair head counts, the maximum
//! relative offset of the position bias table and the classifier widths.

use std::path::Path;

use serde::Deserialize;

use crate::error::{config_bail, Result};

/// Default maximum relative offset M of the position bias table
pub const DEFAULT_MAX_RELATIVE_POSITION: usize = 20;

/// Default epsilon of the fusion LayerNorm
pub const DEFAULT_LAYER_NORM_EPS: f64 = 1e-5;

/// Number of output classes, shared by all stages or given per stage
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NumClasses {
    Uniform(usize),
    PerStage(Vec<usize>),
}

impl NumClasses {
    /// Number of classes predicted at `stage`
    pub fn for_stage(&self, stage: usize) -> usize {
        match self {
            NumClasses::Uniform(n) => *n,
            NumClasses::PerStage(v) => v[stage],
        }
    }
}

/// Configuration for the thought generator (fuser + classifier bank)
#[derive(Debug, Clone, Deserialize)]
pub struct ThoughtGeneratorConfig {
    /// Number of pyramid stages S produced by the backbone
    pub num_stages: usize,
    /// Channel width of each stage, finest first (length S)
    pub embed_dims: Vec<usize>,
    /// Attention heads of each stage-pair fusion (length >= S - 1)
    pub num_heads: Vec<usize>,
    /// Maximum supported relative offset M; the bias table holds (2M-1)^2 buckets
    #[serde(default = "default_max_relative_position")]
    pub max_relative_position: usize,
    /// Classes predicted by each stage classifier
    pub num_classes: NumClasses,
    /// Epsilon of the LayerNorm applied after each fusion
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_max_relative_position() -> usize {
    DEFAULT_MAX_RELATIVE_POSITION
}

fn default_layer_norm_eps() -> f64 {
    DEFAULT_LAYER_NORM_EPS
}

impl Default for ThoughtGeneratorConfig {
    fn default() -> Self {
        Self::smt_base()
    }
}

impl ThoughtGeneratorConfig {
    /// Configuration matching the SMT-style backbone widths
    pub fn smt_base() -> Self {
        Self {
            num_stages: 4,
            embed_dims: vec![64, 128, 256, 512],
            num_heads: vec![4, 8, 16, 32],
            max_relative_position: DEFAULT_MAX_RELATIVE_POSITION,
            num_classes: NumClasses::Uniform(1000),
            layer_norm_eps: DEFAULT_LAYER_NORM_EPS,
        }
    }

    /// Configuration matching the Swin-T backbone widths
    pub fn swin_tiny() -> Self {
        Self {
            num_stages: 4,
            embed_dims: vec![96, 192, 384, 768],
            num_heads: vec![3, 6, 12, 24],
            max_relative_position: DEFAULT_MAX_RELATIVE_POSITION,
            num_classes: NumClasses::Uniform(1000),
            layer_norm_eps: DEFAULT_LAYER_NORM_EPS,
        }
    }

    /// Read a configuration from a JSON file and validate it
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of stage pairs that need a fusion block
    pub fn num_fusions(&self) -> usize {
        self.num_stages.saturating_sub(1)
    }

    /// Query width, key/value width and head count of the fusion at `stage`
    pub fn fusion_dims(&self, stage: usize) -> (usize, usize, usize) {
        (
            self.embed_dims[stage],
            self.embed_dims[stage + 1],
            self.num_heads[stage],
        )
    }

    /// Check that the configuration describes a buildable model
    pub fn validate(&self) -> Result<()> {
        if self.num_stages == 0 {
            config_bail!("num_stages must be at least 1");
        }
        if self.embed_dims.len() != self.num_stages {
            config_bail!(
                "embed_dims has {} entries, expected one per stage ({})",
                self.embed_dims.len(),
                self.num_stages
            );
        }
        if let Some(stage) = self.embed_dims.iter().position(|&d| d == 0) {
            config_bail!("embed_dims[{stage}] must be non-zero");
        }
        if self.num_heads.len() < self.num_fusions() {
            config_bail!(
                "num_heads has {} entries, need at least {} (one per stage pair)",
                self.num_heads.len(),
                self.num_fusions()
            );
        }
        for stage in 0..self.num_fusions() {
            let (dim_q, _, heads) = self.fusion_dims(stage);
            if heads == 0 {
                config_bail!("num_heads[{stage}] must be non-zero");
            }
            if dim_q % heads != 0 {
                config_bail!(
                    "embed_dims[{stage}] = {dim_q} is not divisible by num_heads[{stage}] = {heads}"
                );
            }
        }
        if self.max_relative_position == 0 {
            config_bail!("max_relative_position must be at least 1");
        }
        match &self.num_classes {
            NumClasses::Uniform(0) => config_bail!("num_classes must be non-zero"),
            NumClasses::Uniform(_) => {}
            NumClasses::PerStage(v) => {
                if v.len() != self.num_stages {
                    config_bail!(
                        "num_classes has {} entries, expected one per stage ({})",
                        v.len(),
                        self.num_stages
                    );
                }
                if let Some(stage) = v.iter().position(|&n| n == 0) {
                    config_bail!("num_classes[{stage}] must be non-zero");
                }
            }
        }
        if !(self.layer_norm_eps > 0.0) {
            config_bail!("layer_norm_eps must be positive");
        }
        Ok(())
    }
}
