use super::layers::{max_pool1d, pooled_len, ConvBlock, DenseBlock};
use super::{ModelSpec, ModelTrait};
use candle_core::{Result, Tensor};
use candle_nn::{Linear, ModuleT, VarBuilder};

// (channels, convs) per pooled block
const VGG16_BLOCKS: [(usize, usize); 5] = [(64, 2), (128, 2), (256, 3), (512, 3), (512, 3)];

/// VGG16 with 1-D convolutions. The dense part uses `fc1` and `fc2`.
#[derive(Debug)]
pub struct Vgg16 {
    blocks: Vec<Vec<ConvBlock>>,
    fc1: DenseBlock,
    fc2: DenseBlock,
    head: Linear,
}

impl Vgg16 {
    pub fn new(vb: VarBuilder, spec: &ModelSpec) -> Result<Self> {
        let mut len = spec.input_len();
        let mut in_channels = spec.in_channels();
        let mut blocks = Vec::with_capacity(VGG16_BLOCKS.len());
        for (b, &(channels, depth)) in VGG16_BLOCKS.iter().enumerate() {
            let vb_block = vb.pp(format!("block{}", b + 1));
            let block = (0..depth)
                .map(|i| {
                    let c_in = if i == 0 { in_channels } else { channels };
                    ConvBlock::new(vb_block.pp(i.to_string()), c_in, channels, 3, 1, spec.batchnorm)
                })
                .collect::<Result<Vec<_>>>()?;
            blocks.push(block);
            in_channels = channels;
            len = pooled_len(len)?;
        }
        let fc1 = DenseBlock::new(
            vb.pp("fc1"),
            in_channels * len,
            spec.fc1,
            spec.batchnorm,
            spec.dropout_flag,
        )?;
        let fc2 = DenseBlock::new(
            vb.pp("fc2"),
            spec.fc1,
            spec.fc2,
            spec.batchnorm,
            spec.dropout_flag,
        )?;
        let head = candle_nn::linear(spec.fc2, spec.classes, vb.pp("head"))?;
        Ok(Self {
            blocks,
            fc1,
            fc2,
            head,
        })
    }
}

impl ModelTrait for Vgg16 {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for block in self.blocks.iter() {
            for conv in block.iter() {
                xs = conv.forward_t(&xs, train)?;
            }
            xs = max_pool1d(&xs)?;
        }
        let xs = xs.flatten_from(1)?;
        let xs = self.fc1.forward_t(&xs, train)?;
        let xs = self.fc2.forward_t(&xs, train)?;
        xs.apply(&self.head)
    }
}
