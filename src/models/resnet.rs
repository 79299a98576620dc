use super::layers::{max_pool1d, pooled_len, ConvBlock};
use super::{ModelSpec, ModelTrait};
use candle_core::{Result, Tensor, D};
use candle_nn::{Linear, ModuleT, VarBuilder};

const STEM_CHANNELS: usize = 64;
const STAGE_CHANNELS: [usize; 4] = [64, 128, 256, 512];
const BOTTLENECK_EXPANSION: usize = 4;

/// 1x1 projection on the skip path when shape changes.
fn shortcut(
    vb: VarBuilder,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
) -> Result<Option<ConvBlock>> {
    if stride == 1 && in_channels == out_channels {
        return Ok(None);
    }
    ConvBlock::new(vb, in_channels, out_channels, 1, stride, true).map(Some)
}

#[derive(Debug)]
enum Residual {
    Basic {
        conv1: ConvBlock,
        conv2: ConvBlock,
    },
    Bottleneck {
        conv1: ConvBlock,
        conv2: ConvBlock,
        conv3: ConvBlock,
    },
}

#[derive(Debug)]
struct ResidualBlock {
    body: Residual,
    shortcut: Option<ConvBlock>,
}

impl ResidualBlock {
    fn basic(vb: VarBuilder, in_c: usize, out_c: usize, stride: usize) -> Result<Self> {
        Ok(Self {
            body: Residual::Basic {
                conv1: ConvBlock::new(vb.pp("conv1"), in_c, out_c, 3, stride, true)?,
                conv2: ConvBlock::new(vb.pp("conv2"), out_c, out_c, 3, 1, true)?,
            },
            shortcut: shortcut(vb.pp("shortcut"), in_c, out_c, stride)?,
        })
    }

    fn bottleneck(vb: VarBuilder, in_c: usize, width: usize, stride: usize) -> Result<Self> {
        let out_c = width * BOTTLENECK_EXPANSION;
        Ok(Self {
            body: Residual::Bottleneck {
                conv1: ConvBlock::new(vb.pp("conv1"), in_c, width, 1, 1, true)?,
                conv2: ConvBlock::new(vb.pp("conv2"), width, width, 3, stride, true)?,
                conv3: ConvBlock::new(vb.pp("conv3"), width, out_c, 1, 1, true)?,
            },
            shortcut: shortcut(vb.pp("shortcut"), in_c, out_c, stride)?,
        })
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = match &self.body {
            Residual::Basic { conv1, conv2 } => {
                conv2.forward_linear(&conv1.forward_t(xs, train)?, train)?
            }
            Residual::Bottleneck {
                conv1,
                conv2,
                conv3,
            } => {
                let ys = conv2.forward_t(&conv1.forward_t(xs, train)?, train)?;
                conv3.forward_linear(&ys, train)?
            }
        };
        let residual = match &self.shortcut {
            Some(proj) => proj.forward_linear(xs, train)?,
            None => xs.clone(),
        };
        (out + residual)?.relu()
    }
}

/// Stem conv + pooled, four residual stages, global average pool, linear head.
/// `resnet1d` uses two basic blocks per stage, `resnet50` the [3, 4, 6, 3]
/// bottleneck layout.
#[derive(Debug)]
pub struct ResNet {
    stem: ConvBlock,
    blocks: Vec<ResidualBlock>,
    head: Linear,
}

impl ResNet {
    fn build(vb: VarBuilder, spec: &ModelSpec, depths: [usize; 4], bottleneck: bool) -> Result<Self> {
        let stem = ConvBlock::new(vb.pp("stem"), spec.in_channels(), STEM_CHANNELS, 7, 2, true)?;
        let mut len = ConvBlock::out_len(spec.input_len(), 2);
        len = pooled_len(len)?;

        let vb_blocks = vb.pp("blocks");
        let mut blocks = Vec::new();
        let mut in_c = STEM_CHANNELS;
        for (stage, (&width, &depth)) in STAGE_CHANNELS.iter().zip(depths.iter()).enumerate() {
            for i in 0..depth {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                let vb_block = vb_blocks.pp(format!("{stage}_{i}"));
                let block = if bottleneck {
                    ResidualBlock::bottleneck(vb_block, in_c, width, stride)?
                } else {
                    ResidualBlock::basic(vb_block, in_c, width, stride)?
                };
                in_c = if bottleneck {
                    width * BOTTLENECK_EXPANSION
                } else {
                    width
                };
                len = ConvBlock::out_len(len, stride);
                blocks.push(block);
            }
        }
        log::debug!("resnet feature length {len}, channels {in_c}");
        let head = candle_nn::linear(in_c, spec.classes, vb.pp("head"))?;
        Ok(Self { stem, blocks, head })
    }

    pub fn resnet1d(vb: VarBuilder, spec: &ModelSpec) -> Result<Self> {
        Self::build(vb, spec, [2, 2, 2, 2], false)
    }

    pub fn resnet50(vb: VarBuilder, spec: &ModelSpec) -> Result<Self> {
        Self::build(vb, spec, [3, 4, 6, 3], true)
    }
}

impl ModelTrait for ResNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = max_pool1d(&self.stem.forward_t(xs, train)?)?;
        for block in self.blocks.iter() {
            xs = block.forward_t(&xs, train)?;
        }
        xs.mean(D::Minus1)?.apply(&self.head)
    }
}
