//! Thought generator demo with Candle
//!
//! Builds the generator (fresh weights, or bound from safetensors), feeds it a
//! deterministic synthetic pyramid and reports fused shapes and logits.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use candle_core::{DType, Device, Result, D};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, ValueEnum};

use candle_thought_gen::debug::TensorStats;
use candle_thought_gen::synthetic::synthetic_pyramid;
use candle_thought_gen::{ThoughtGenerator, ThoughtGeneratorConfig};

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("running on CPU, build with `--features metal` to run on GPU");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("running on CPU, build with `--features cuda` to run on GPU");
        }
        Ok(Device::Cpu)
    }
}

/// Backbone widths to configure the generator for
#[derive(Clone, Copy, ValueEnum, Debug)]
enum Which {
    SmtBase,
    SwinTiny,
}

impl Which {
    fn config(&self) -> ThoughtGeneratorConfig {
        match self {
            Which::SmtBase => ThoughtGeneratorConfig::smt_base(),
            Which::SwinTiny => ThoughtGeneratorConfig::swin_tiny(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Preset configuration, ignored when --config is given.
    #[arg(long, value_enum, default_value_t = Which::SmtBase)]
    which: Which,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pre-trained weights in safetensors format; fresh weights when omitted.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Override the maximum relative offset of the position bias table.
    #[arg(long)]
    max_relative_position: Option<usize>,

    /// Batch size of the synthetic pyramid.
    #[arg(long, default_value_t = 2)]
    batch: usize,

    /// Input resolution the synthetic pyramid is derived from.
    #[arg(long, default_value_t = 64)]
    resolution: usize,

    /// Downsampling of the finest stage relative to the input.
    #[arg(long, default_value_t = 4)]
    patch_size: usize,
}

impl Args {
    fn config(&self) -> anyhow::Result<ThoughtGeneratorConfig> {
        let mut config = match &self.config {
            Some(path) => ThoughtGeneratorConfig::from_json_file(path)?,
            None => self.which.config(),
        };
        if let Some(m) = self.max_relative_position {
            config.max_relative_position = m;
        }
        Ok(config)
    }
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let device = device(args.cpu)?;
    println!("Using device: {:?}", device);

    let config = args.config()?;
    println!("Model config:");
    println!("  Stages: {}", config.num_stages);
    println!("  Embed dims: {:?}", config.embed_dims);
    println!("  Heads: {:?}", config.num_heads);
    println!("  Max relative position: {}", config.max_relative_position);

    // Keep the VarMap alive for the lifetime of the model when no weights are given
    let varmap = VarMap::new();
    let vb = match &args.model {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Model weights not found at {:?}", path);
            }
            println!("Loading model from: {:?}", path);
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? }
        }
        None => {
            println!("No weights given, using fresh initialization");
            VarBuilder::from_varmap(&varmap, DType::F32, &device)
        }
    };
    let model = ThoughtGenerator::load(vb, &config)?;

    let features = synthetic_pyramid(
        &config,
        args.batch,
        args.resolution,
        args.patch_size,
        &device,
    )?;
    for (i, f) in features.iter().enumerate() {
        println!("  Backbone stage {}: {:?}", i, f.dims());
    }

    println!("Running thought generator...");
    let (fused, logits) = model.forward(&features)?;

    for (i, (f, l)) in fused.iter().zip(&logits).enumerate() {
        println!("Stage {}", i);
        println!("  fused:  {}", TensorStats::from_tensor(f)?);
        println!("  logits: {}", TensorStats::from_tensor(l)?);
        let top: Vec<u32> = l.argmax(D::Minus1)?.to_vec1()?;
        println!("  top class per sample: {:?}", top);
    }

    Ok(())
}
