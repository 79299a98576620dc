use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, Linear, ModuleT, VarBuilder};

pub const DROPOUT: f32 = 0.5;

/// conv1d -> [batch norm] -> relu
#[derive(Debug)]
pub struct ConvBlock {
    conv: Conv1d,
    bn: Option<BatchNorm>,
}

impl ConvBlock {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        batchnorm: bool,
    ) -> Result<Self> {
        let conv = candle_nn::conv1d(
            in_channels,
            out_channels,
            kernel_size,
            Conv1dConfig {
                padding: kernel_size / 2,
                stride,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        let bn = if batchnorm {
            Some(candle_nn::batch_norm(out_channels, 1e-5, vb.pp("bn"))?)
        } else {
            None
        };
        Ok(Self { conv, bn })
    }

    /// Output length of a "same"-padded conv with this stride.
    pub fn out_len(len: usize, stride: usize) -> usize {
        len.div_ceil(stride)
    }

    /// conv -> [bn], without the activation. Batch norm uses batch statistics
    /// when `train` is set and its running statistics otherwise.
    pub fn forward_linear(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.apply(&self.conv)?;
        match &self.bn {
            Some(bn) => xs.apply_t(bn, train),
            None => Ok(xs),
        }
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_linear(xs, train)?.relu()
    }
}

/// linear -> [batch norm] -> relu -> [dropout]
#[derive(Debug)]
pub struct DenseBlock {
    fc: Linear,
    bn: Option<BatchNorm>,
    dropout: bool,
}

impl DenseBlock {
    pub fn new(
        vb: VarBuilder,
        in_dim: usize,
        out_dim: usize,
        batchnorm: bool,
        dropout: bool,
    ) -> Result<Self> {
        let fc = candle_nn::linear(in_dim, out_dim, vb.pp("fc"))?;
        let bn = if batchnorm {
            Some(candle_nn::batch_norm(out_dim, 1e-5, vb.pp("bn"))?)
        } else {
            None
        };
        Ok(Self { fc, bn, dropout })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.apply(&self.fc)?;
        let xs = match &self.bn {
            Some(bn) => xs.apply_t(bn, train)?,
            None => xs,
        };
        let xs = xs.relu()?;
        if self.dropout && train {
            candle_nn::ops::dropout(&xs, DROPOUT)
        } else {
            Ok(xs)
        }
    }
}

/// Max pooling by 2 along the last axis of a `(B, C, L)` tensor.
pub fn max_pool1d(xs: &Tensor) -> Result<Tensor> {
    xs.unsqueeze(2)?
        .max_pool2d_with_stride((1, 2), (1, 2))?
        .squeeze(2)
}

/// Length after `max_pool1d`; errors instead of collapsing to nothing.
pub fn pooled_len(len: usize) -> Result<usize> {
    if len < 2 {
        candle_core::bail!("input too short to pool: length {len}")
    }
    Ok(len / 2)
}
