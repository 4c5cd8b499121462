//! Relative position bias indexing for arbitrary spatial sizes
//!
//! Every ordered pair of tokens (i, j) on an H x W grid is mapped to a bucket of
//! a learned (2M-1)^2 x heads table, keyed on the signed offset
//! `(row_i - row_j, col_i - col_j)`. The mapping is directional: (i, j) and
//! (j, i) land in different buckets whenever the tokens differ.
//!
//! Unlike windowed attention, where the window is fixed and the index can be
//! baked at load time, fusion runs at the resolution of each pyramid stage, so
//! indices are computed on demand and cached per (H, W).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use candle_core::{Device, Tensor};

use crate::error::{shape_bail, FusionError, Result};

/// Number of buckets in a bias table supporting offsets up to `max_relative_position - 1`
pub fn bias_table_size(max_relative_position: usize) -> usize {
    let side = 2 * max_relative_position - 1;
    side * side
}

/// Compute the flattened (H*W) x (H*W) bucket index for an H x W grid.
///
/// Fails with [`FusionError::Bounds`] when `max(H, W) > M`, since the offsets
/// would fall outside the table. Clamping is not an option: it would alias
/// distinct offsets onto the same learned bias.
pub fn relative_position_index(
    height: usize,
    width: usize,
    max_relative_position: usize,
) -> Result<Vec<u32>> {
    if height == 0 || width == 0 {
        shape_bail!("relative position index needs a non-empty grid, got {height}x{width}");
    }
    let needed = height.max(width) - 1;
    let supported = max_relative_position.saturating_sub(1);
    if max_relative_position == 0 || needed > supported {
        return Err(FusionError::Bounds {
            height,
            width,
            needed,
            supported,
            max_relative_position,
        });
    }

    let n = height * width;
    let shift = (max_relative_position - 1) as i64;
    let side = (2 * max_relative_position - 1) as i64;

    let mut index = Vec::with_capacity(n * n);
    for i in 0..n {
        let (row_i, col_i) = ((i / width) as i64, (i % width) as i64);
        for j in 0..n {
            let (row_j, col_j) = ((j / width) as i64, (j % width) as i64);
            let d_row = row_i - row_j + shift;
            let d_col = col_i - col_j + shift;
            index.push((d_row * side + d_col) as u32);
        }
    }
    Ok(index)
}

/// Per-(H, W) cache of bucket indices living on the bias table's device.
///
/// Lookups take a read lock, so concurrent forward passes sharing one model
/// only contend the first time a new spatial size shows up.
#[derive(Debug)]
pub struct RelativePositionIndexer {
    max_relative_position: usize,
    device: Device,
    cache: RwLock<HashMap<(usize, usize), Tensor>>,
}

impl RelativePositionIndexer {
    pub fn new(max_relative_position: usize, device: &Device) -> Self {
        Self {
            max_relative_position,
            device: device.clone(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_relative_position(&self) -> usize {
        self.max_relative_position
    }

    pub fn table_size(&self) -> usize {
        bias_table_size(self.max_relative_position)
    }

    /// Flat u32 index tensor of length (H*W)^2 for an H x W grid
    pub fn index(&self, height: usize, width: usize) -> Result<Tensor> {
        let key = (height, width);
        if let Some(index) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(index.clone());
        }

        tracing::trace!(height, width, "relative position index cache miss");
        let data = relative_position_index(height, width, self.max_relative_position)?;
        let len = data.len();
        let index = Tensor::from_vec(data, len, &self.device)?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(key).or_insert(index).clone())
    }

    /// Number of distinct spatial sizes indexed so far
    pub fn cached_sizes(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
