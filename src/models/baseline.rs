use super::layers::{max_pool1d, pooled_len, ConvBlock, DenseBlock};
use super::{ModelSpec, ModelTrait};
use candle_core::{Result, Tensor};
use candle_nn::{Linear, ModuleT, VarBuilder};

const KERNEL_SIZE: usize = 7;

/// Stacked conv/pool layers followed by a dense stack.
#[derive(Debug)]
pub struct Baseline {
    convs: Vec<ConvBlock>,
    fcs: Vec<DenseBlock>,
    head: Linear,
}

impl Baseline {
    pub fn new(vb: VarBuilder, spec: &ModelSpec) -> Result<Self> {
        let mut len = spec.input_len();
        let mut in_channels = spec.in_channels();
        let vb_convs = vb.pp("convs");
        let mut convs = Vec::with_capacity(spec.cnn_stacks);
        for i in 0..spec.cnn_stacks {
            convs.push(ConvBlock::new(
                vb_convs.pp(i.to_string()),
                in_channels,
                spec.channels,
                KERNEL_SIZE,
                1,
                spec.batchnorm,
            )?);
            in_channels = spec.channels;
            len = pooled_len(len)?;
        }

        let mut in_dim = in_channels * len;
        let vb_fcs = vb.pp("fcs");
        let mut fcs = Vec::with_capacity(spec.fc_stacks);
        for i in 0..spec.fc_stacks {
            let out_dim = if i == 0 { spec.fc1 } else { spec.fc2 };
            fcs.push(DenseBlock::new(
                vb_fcs.pp(i.to_string()),
                in_dim,
                out_dim,
                spec.batchnorm,
                spec.dropout_flag,
            )?);
            in_dim = out_dim;
        }
        let head = candle_nn::linear(in_dim, spec.classes, vb.pp("head"))?;
        Ok(Self { convs, fcs, head })
    }
}

impl ModelTrait for Baseline {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for conv in self.convs.iter() {
            xs = max_pool1d(&conv.forward_t(&xs, train)?)?;
        }
        let mut xs = xs.flatten_from(1)?;
        for fc in self.fcs.iter() {
            xs = fc.forward_t(&xs, train)?;
        }
        xs.apply(&self.head)
    }
}
