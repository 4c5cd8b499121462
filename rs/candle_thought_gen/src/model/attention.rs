//! Cross-scale attention
//!
//! Fuses a query stream taken from a finer pyramid stage with a key/value
//! stream taken from the coarser, already fused stage. The key/value stream
//! has been resampled to the query resolution beforehand, so both streams
//! carry the same N = H * W tokens, but their channel widths may differ.
//!
//! ```text
//! Q = W_Q q          [B, N, dim_q]  -> [B, heads, N, head_dim]
//! K = W_K k, V = W_V v  [B, N, dim_kv] -> [B, heads, N, head_dim]
//! A = softmax(Q K^T * head_dim^-0.5 + bias[index(H, W)])
//! out = LayerNorm(W_O (A V) + q)
//! ```

use candle_core::{Tensor, D};
use candle_nn::{layer_norm, linear_no_bias, Init, LayerNorm, Linear, Module, VarBuilder};

use crate::error::{config_bail, shape_bail, Result};
use crate::model::pos_bias::{bias_table_size, RelativePositionIndexer};

/// Hyper-parameters of one fusion block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossScaleAttentionConfig {
    /// Channel width of the query stream (and of the output)
    pub dim_q: usize,
    /// Channel width of the key/value stream
    pub dim_kv: usize,
    pub num_heads: usize,
    /// Maximum supported relative offset M
    pub max_relative_position: usize,
    pub layer_norm_eps: f64,
}

/// Multi-head cross attention with a learned relative position bias
#[derive(Debug)]
pub struct CrossScaleAttention {
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_o: Linear,
    /// Learned bias table [(2M-1)^2, num_heads]
    relative_position_bias_table: Tensor,
    indexer: RelativePositionIndexer,
    norm: LayerNorm,
    config: CrossScaleAttentionConfig,
    head_dim: usize,
    scale: f64,
}

impl CrossScaleAttention {
    pub fn load(vb: VarBuilder, config: CrossScaleAttentionConfig) -> Result<Self> {
        let CrossScaleAttentionConfig {
            dim_q,
            dim_kv,
            num_heads,
            max_relative_position,
            layer_norm_eps,
        } = config;
        if num_heads == 0 || dim_q % num_heads != 0 {
            config_bail!("dim_q ({dim_q}) must be divisible by num_heads ({num_heads})");
        }
        if max_relative_position == 0 {
            config_bail!("max_relative_position must be at least 1");
        }

        let w_q = linear_no_bias(dim_q, dim_q, vb.pp("W_Q"))?;
        let w_k = linear_no_bias(dim_kv, dim_q, vb.pp("W_K"))?;
        let w_v = linear_no_bias(dim_kv, dim_q, vb.pp("W_V"))?;
        let w_o = linear_no_bias(dim_q, dim_q, vb.pp("W_O"))?;

        let relative_position_bias_table = vb.get_with_hints(
            (bias_table_size(max_relative_position), num_heads),
            "relative_position_bias_table",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let indexer =
            RelativePositionIndexer::new(max_relative_position, relative_position_bias_table.device());

        // Owned once here and applied on every call, so its affine parameters are trained
        let norm = layer_norm(dim_q, layer_norm_eps, vb.pp("norm"))?;

        let head_dim = dim_q / num_heads;
        Ok(Self {
            w_q,
            w_k,
            w_v,
            w_o,
            relative_position_bias_table,
            indexer,
            norm,
            config,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    pub fn config(&self) -> &CrossScaleAttentionConfig {
        &self.config
    }

    /// Relative position bias laid out as [1, num_heads, N, N]
    fn relative_position_bias(&self, height: usize, width: usize) -> Result<Tensor> {
        let n = height * width;
        let index = self.indexer.index(height, width)?;
        let bias = self
            .relative_position_bias_table
            .index_select(&index, 0)?
            .reshape((n, n, self.config.num_heads))?;
        Ok(bias.permute((2, 0, 1))?.unsqueeze(0)?)
    }

    /// Split [B, N, dim_q] into [B, heads, N, head_dim]
    fn split_heads(&self, x: &Tensor, batch: usize, n: usize) -> Result<Tensor> {
        Ok(x.reshape((batch, n, self.config.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// # Arguments
    /// * `query` - Query tokens [B, N, dim_q], row-major over an H x W grid
    /// * `key` - Key tokens [B, N, dim_kv]
    /// * `value` - Value tokens [B, N, dim_kv]
    /// * `height`, `width` - Spatial layout of the N tokens
    ///
    /// # Returns
    /// Fused tokens [B, N, dim_q]
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        height: usize,
        width: usize,
    ) -> Result<Tensor> {
        let (batch, n_q, dim_q) = query.dims3()?;
        let (batch_k, n_kv, dim_k) = key.dims3()?;
        if n_q != n_kv {
            shape_bail!("query has {n_q} tokens but key/value has {n_kv}");
        }
        if key.dims() != value.dims() {
            shape_bail!("key {:?} and value {:?} differ", key.dims(), value.dims());
        }
        if batch != batch_k {
            shape_bail!("query batch {batch} but key/value batch {batch_k}");
        }
        if dim_q != self.config.dim_q || dim_k != self.config.dim_kv {
            shape_bail!(
                "expected query/key widths {}/{}, got {dim_q}/{dim_k}",
                self.config.dim_q,
                self.config.dim_kv
            );
        }
        if height * width != n_q {
            shape_bail!("spatial size {height}x{width} does not cover {n_q} tokens");
        }

        let q = self.split_heads(&self.w_q.forward(query)?, batch, n_q)?;
        let k = self.split_heads(&self.w_k.forward(key)?, batch, n_kv)?;
        let v = self.split_heads(&self.w_v.forward(value)?, batch, n_kv)?;

        // [B, heads, N, N]
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let attn = (q.matmul(&k_t)? * self.scale)?;
        let bias = self.relative_position_bias(height, width)?;
        let attn = attn.broadcast_add(&bias.to_dtype(attn.dtype())?)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        // [B, heads, N, head_dim] -> [B, N, dim_q]
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, n_q, dim_q))?;
        let out = self.w_o.forward(&out)?;

        let out = (out + query)?;
        Ok(self.norm.forward(&out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FusionError;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::collections::HashMap;

    fn config(dim_q: usize, dim_kv: usize, num_heads: usize) -> CrossScaleAttentionConfig {
        CrossScaleAttentionConfig {
            dim_q,
            dim_kv,
            num_heads,
            max_relative_position: 20,
            layer_norm_eps: 1e-5,
        }
    }

    fn build(varmap: &VarMap, cfg: CrossScaleAttentionConfig) -> CrossScaleAttention {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        CrossScaleAttention::load(vb, cfg).unwrap()
    }

    #[test]
    fn test_output_matches_query_shape() {
        let device = Device::Cpu;
        for &(dim_q, dim_kv, heads, h, w) in &[
            (16, 32, 4, 3, 5),
            (8, 8, 1, 1, 1),
            (24, 12, 3, 4, 4),
            (64, 128, 8, 7, 2),
        ] {
            let varmap = VarMap::new();
            let attn = build(&varmap, config(dim_q, dim_kv, heads));
            let n = h * w;
            let q = Tensor::randn(0f32, 1.0, (2, n, dim_q), &device).unwrap();
            let kv = Tensor::randn(0f32, 1.0, (2, n, dim_kv), &device).unwrap();
            let out = attn.forward(&q, &kv, &kv, h, w).unwrap();
            assert_eq!(out.dims(), &[2, n, dim_q]);
        }
    }

    #[test]
    fn test_token_count_mismatch_is_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let attn = build(&varmap, config(16, 32, 4));
        let q = Tensor::zeros((1, 4, 16), DType::F32, &device).unwrap();
        let kv = Tensor::zeros((1, 5, 32), DType::F32, &device).unwrap();
        let err = attn.forward(&q, &kv, &kv, 2, 2).unwrap_err();
        assert!(matches!(err, FusionError::ShapeMismatch(_)), "got {err:?}");
    }

    #[test]
    fn test_spatial_size_must_cover_tokens() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let attn = build(&varmap, config(16, 16, 2));
        let q = Tensor::zeros((1, 6, 16), DType::F32, &device).unwrap();
        let err = attn.forward(&q, &q, &q, 2, 2).unwrap_err();
        assert!(matches!(err, FusionError::ShapeMismatch(_)), "got {err:?}");
    }

    #[test]
    fn test_oversized_grid_is_bounds_error() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut cfg = config(8, 8, 2);
        cfg.max_relative_position = 4;
        let attn = build(&varmap, cfg);
        let q = Tensor::zeros((1, 5, 8), DType::F32, &device).unwrap();
        let err = attn.forward(&q, &q, &q, 1, 5).unwrap_err();
        assert!(matches!(err, FusionError::Bounds { .. }), "got {err:?}");
    }

    #[test]
    fn test_indivisible_heads_rejected_at_load() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = CrossScaleAttention::load(vb, config(10, 20, 4)).unwrap_err();
        assert!(matches!(err, FusionError::Config(_)), "got {err:?}");
    }

    #[test]
    fn test_output_is_channel_normalized() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let attn = build(&varmap, config(32, 16, 4));
        let q = Tensor::randn(0f32, 3.0, (1, 9, 32), &device).unwrap();
        let kv = Tensor::randn(0f32, 3.0, (1, 9, 16), &device).unwrap();
        let out = attn.forward(&q, &kv, &kv, 3, 3).unwrap();

        // Fresh LayerNorm has unit weight and zero bias
        let mean: Vec<f32> = out.mean(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(mean.iter().all(|m| m.abs() < 1e-4), "{mean:?}");
    }

    #[test]
    fn test_bias_table_parameter_names() {
        let varmap = VarMap::new();
        let _attn = build(&varmap, config(16, 32, 4));
        let data = varmap.data().lock().unwrap();
        let table = data.get("relative_position_bias_table").unwrap();
        assert_eq!(table.as_tensor().dims(), &[39 * 39, 4]);
        for name in ["W_Q.weight", "W_K.weight", "W_V.weight", "W_O.weight", "norm.weight", "norm.bias"] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert_eq!(data.get("W_K.weight").unwrap().as_tensor().dims(), &[16, 32]);
    }

    /// Plain-loop attention over [N][C] tokens with identity projections
    fn reference_attention(
        q: &[Vec<f32>],
        kv: &[Vec<f32>],
        bias: impl Fn(usize, usize, usize) -> f32,
        num_heads: usize,
    ) -> Vec<Vec<f32>> {
        let n = q.len();
        let dim = q[0].len();
        let head_dim = dim / num_heads;
        let scale = (head_dim as f32).powf(-0.5);
        let mut out = vec![vec![0f32; dim]; n];
        for h in 0..num_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            for i in 0..n {
                let scores: Vec<f32> = (0..n)
                    .map(|j| {
                        let dot: f32 = cols.clone().map(|c| q[i][c] * kv[j][c]).sum();
                        dot * scale + bias(h, i, j)
                    })
                    .collect();
                let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                let total: f32 = exp.iter().sum();
                for c in cols.clone() {
                    out[i][c] = (0..n).map(|j| exp[j] / total * kv[j][c]).sum();
                }
            }
        }
        // Residual, then LayerNorm with unit weight and zero bias
        for (row, q_row) in out.iter_mut().zip(q) {
            for (o, x) in row.iter_mut().zip(q_row) {
                *o += x;
            }
            let mean = row.iter().sum::<f32>() / dim as f32;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / dim as f32;
            for o in row.iter_mut() {
                *o = (*o - mean) / (var + 1e-5).sqrt();
            }
        }
        out
    }

    #[test]
    fn test_matches_reference_with_directional_bias() {
        let device = Device::Cpu;
        let (dim, heads, m) = (4, 2, 2);
        let (h, w) = (2, 2);
        let n = h * w;
        let table_rows = bias_table_size(m);

        // Every (bucket, head) gets its own value, increasing with the bucket
        let table: Vec<f32> = (0..table_rows * heads)
            .map(|k| (k / heads) as f32 * 0.4 * ((k % heads) as f32 + 1.0))
            .collect();
        let tensors = HashMap::from([
            ("W_Q.weight".to_string(), Tensor::eye(dim, DType::F32, &device).unwrap()),
            ("W_K.weight".to_string(), Tensor::eye(dim, DType::F32, &device).unwrap()),
            ("W_V.weight".to_string(), Tensor::eye(dim, DType::F32, &device).unwrap()),
            ("W_O.weight".to_string(), Tensor::eye(dim, DType::F32, &device).unwrap()),
            (
                "relative_position_bias_table".to_string(),
                Tensor::from_vec(table.clone(), (table_rows, heads), &device).unwrap(),
            ),
            ("norm.weight".to_string(), Tensor::ones(dim, DType::F32, &device).unwrap()),
            ("norm.bias".to_string(), Tensor::zeros(dim, DType::F32, &device).unwrap()),
        ]);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let mut cfg = config(dim, dim, heads);
        cfg.max_relative_position = m;
        let attn = CrossScaleAttention::load(vb, cfg).unwrap();
        assert_eq!(attn.config().num_heads, heads);

        let q: Vec<Vec<f32>> = (0..n)
            .map(|i| (0..dim).map(|c| ((i * dim + c) as f32 * 0.37).sin()).collect())
            .collect();
        let kv: Vec<Vec<f32>> = (0..n)
            .map(|i| (0..dim).map(|c| ((i * dim + c) as f32 * 0.91).cos()).collect())
            .collect();
        let q_t = Tensor::from_vec(q.concat(), (1, n, dim), &device).unwrap();
        let kv_t = Tensor::from_vec(kv.concat(), (1, n, dim), &device).unwrap();
        let out: Vec<f32> = attn
            .forward(&q_t, &kv_t, &kv_t, h, w)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        // Bucket of query i against key j, from the signed offset of i relative to j
        let side = 2 * m - 1;
        let bucket = |i: usize, j: usize| {
            let d_row = (i / w) as i64 - (j / w) as i64 + (m as i64 - 1);
            let d_col = (i % w) as i64 - (j % w) as i64 + (m as i64 - 1);
            (d_row * side as i64 + d_col) as usize
        };
        let expected = reference_attention(&q, &kv, |hd, i, j| table[bucket(i, j) * heads + hd], heads);
        for (a, e) in out.iter().zip(expected.concat()) {
            assert!((a - e).abs() < 1e-4, "expected {expected:?}, got {out:?}");
        }

        // The same check against a transposed bias layout must fail
        let transposed =
            reference_attention(&q, &kv, |hd, i, j| table[bucket(j, i) * heads + hd], heads);
        let max_diff = out
            .iter()
            .zip(transposed.concat())
            .map(|(a, e)| (a - e).abs())
            .fold(0f32, f32::max);
        assert!(max_diff > 1e-3, "bias direction is not observable");
    }
}
