//! Tensor summaries for the demo report and debug logging.

use candle_core::{DType, Tensor};

use crate::error::{shape_bail, Result};

/// Summary statistics of a tensor, for logging fused features and logits
#[derive(Debug, Clone, PartialEq)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub sum: f32,
}

impl TensorStats {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        if tensor.elem_count() == 0 {
            shape_bail!("cannot summarise an empty tensor {:?}", tensor.dims());
        }
        let flat = tensor.flatten_all()?.to_dtype(DType::F32)?;
        Ok(Self {
            shape: tensor.dims().to_vec(),
            min: flat.min(0)?.to_scalar()?,
            max: flat.max(0)?.to_scalar()?,
            mean: flat.mean_all()?.to_scalar()?,
            sum: flat.sum_all()?.to_scalar()?,
        })
    }
}

impl std::fmt::Display for TensorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} min={:.4} max={:.4} mean={:.4} sum={:.4}",
            self.shape, self.min, self.max, self.mean, self.sum
        )
    }
}
