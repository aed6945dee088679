use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::error::ModelError;
use crate::tensor::to_dtype_if_needed;

/// Fixed additive 2D positional table over a `(max_height, max_width)` grid.
///
/// The first half of the channels encodes the row position (broadcast across
/// columns), the second half the column position (broadcast across rows); each
/// half interleaves sine and cosine channels sharing a frequency per pair:
/// channel `2k` is `sin(pos / 10000^(2k/dim))` and channel `2k + 1` the cosine
/// of the same angle.
///
/// Built once at construction and never mutated afterwards; `apply` and `crop`
/// only read top-left slices of it.
#[derive(Debug, Clone)]
pub struct PositionalEncoding2D {
    table: Tensor,
    dim: usize,
    max_height: usize,
    max_width: usize,
}

impl PositionalEncoding2D {
    pub fn new(dim: usize, max_height: usize, max_width: usize, device: &Device) -> Result<Self> {
        if dim == 0 || dim % 2 != 0 {
            return Err(ModelError::configuration(format!(
                "positional encoding dim must be even and > 0, got {dim}"
            ))
            .into());
        }
        if max_height == 0 || max_width == 0 {
            return Err(ModelError::configuration(format!(
                "positional grid extent must be non-zero, got {max_height}x{max_width}"
            ))
            .into());
        }

        let half = dim / 2;
        let mut data = vec![0f32; dim * max_height * max_width];
        for channel in 0..dim {
            let (column_axis, local) = if channel < half {
                (false, channel)
            } else {
                (true, channel - half)
            };
            // Paired sin/cos channels share one frequency.
            let exponent = (local - local % 2) as f32;
            let freq = (-exponent / dim as f32 * 10000f32.ln()).exp();
            for row in 0..max_height {
                for col in 0..max_width {
                    let pos = if column_axis { col } else { row } as f32;
                    let angle = pos * freq;
                    let v = if local % 2 == 0 { angle.sin() } else { angle.cos() };
                    data[(channel * max_height + row) * max_width + col] = v;
                }
            }
        }
        let table = Tensor::from_vec(data, (1, dim, max_height, max_width), device)?;
        Ok(Self {
            table,
            dim,
            max_height,
            max_width,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn max_height(&self) -> usize {
        self.max_height
    }

    pub fn max_width(&self) -> usize {
        self.max_width
    }

    fn check_extent(&self, height: usize, width: usize) -> Result<()> {
        if height > self.max_height || width > self.max_width {
            return Err(ModelError::OutOfRangeCrop {
                height,
                width,
                max_height: self.max_height,
                max_width: self.max_width,
            }
            .into());
        }
        Ok(())
    }

    /// Add the matching top-left slice of the table to a `[batch, dim, h, w]`
    /// feature map. Side-effect free.
    pub fn apply(&self, features: &Tensor) -> Result<Tensor> {
        let (_batch, channels, height, width) = features.shape().dims4()?;
        if channels != self.dim {
            return Err(ModelError::configuration(format!(
                "feature map has {channels} channels but the positional table was built for {}",
                self.dim
            ))
            .into());
        }
        self.check_extent(height, width)?;
        let slice = self.table.narrow(2, 0, height)?.narrow(3, 0, width)?;
        let slice = to_dtype_if_needed(&slice, features.dtype())?;
        Ok(features.broadcast_add(&slice)?)
    }

    /// Top-left `(1, dim, height, width)` slice of the precomputed table.
    pub fn crop(&self, height: usize, width: usize) -> Result<Tensor> {
        self.check_extent(height, width)?;
        Ok(self
            .table
            .narrow(2, 0, height)?
            .narrow(3, 0, width)?
            .contiguous()?)
    }

    pub fn dtype(&self) -> DType {
        self.table.dtype()
    }
}
