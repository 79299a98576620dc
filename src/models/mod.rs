mod baseline;
mod layers;
mod resnet;
mod vgg;
pub use baseline::Baseline;
pub use resnet::ResNet;
pub use vgg::Vgg16;

use crate::datasets::Preprocessor;
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhichModel {
    Baseline,
    Vgg16,
    Resnet50,
    Resnet1d,
}

/// A classifier over `(B, C, L)` inputs returning `(B, classes)` logits.
pub trait ModelTrait {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }
}

/// Model structure. Saved next to the weights as `model.json` so a later run
/// can rebuild the same architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_flag: WhichModel,
    pub slice_size: usize,
    pub classes: usize,
    pub cnn_stacks: usize,
    pub fc_stacks: usize,
    pub channels: usize,
    pub dropout_flag: bool,
    pub fc1: usize,
    pub fc2: usize,
    pub batchnorm: bool,
    pub preprocessor: Preprocessor,
}

impl ModelSpec {
    pub fn in_channels(&self) -> usize {
        self.preprocessor.channels()
    }

    pub fn input_len(&self) -> usize {
        self.preprocessor.input_len(self.slice_size)
    }

    pub fn summary(&self) -> String {
        let arch = match self.model_flag {
            WhichModel::Baseline => format!(
                "baseline: {} x conv1d({}, k7) + {} dense ({} / {}), batchnorm: {}, dropout: {}",
                self.cnn_stacks,
                self.channels,
                self.fc_stacks,
                self.fc1,
                self.fc2,
                self.batchnorm,
                self.dropout_flag
            ),
            WhichModel::Vgg16 => format!(
                "vgg16: 13 x conv1d + dense ({} / {}), batchnorm: {}, dropout: {}",
                self.fc1, self.fc2, self.batchnorm, self.dropout_flag
            ),
            WhichModel::Resnet1d => "resnet1d: 4 stages x 2 basic blocks".to_string(),
            WhichModel::Resnet50 => "resnet50: bottleneck stages [3, 4, 6, 3]".to_string(),
        };
        format!(
            "{arch}; input ({}, {}) -> {} classes",
            self.in_channels(),
            self.input_len(),
            self.classes
        )
    }
}

pub fn get_model(vb: VarBuilder, spec: &ModelSpec) -> Result<Box<dyn ModelTrait>> {
    let model: Box<dyn ModelTrait> = match spec.model_flag {
        WhichModel::Baseline => Box::new(Baseline::new(vb, spec)?),
        WhichModel::Vgg16 => Box::new(Vgg16::new(vb, spec)?),
        WhichModel::Resnet1d => Box::new(ResNet::resnet1d(vb, spec)?),
        WhichModel::Resnet50 => Box::new(ResNet::resnet50(vb, spec)?),
    };
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn spec(model_flag: WhichModel) -> ModelSpec {
        ModelSpec {
            model_flag,
            slice_size: 64,
            classes: 5,
            cnn_stacks: 3,
            fc_stacks: 2,
            channels: 8,
            dropout_flag: true,
            fc1: 16,
            fc2: 8,
            batchnorm: true,
            preprocessor: Preprocessor::No,
        }
    }

    fn logits_shape(spec: &ModelSpec) -> Vec<usize> {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = get_model(vb, spec).unwrap();
        let xs = Tensor::randn(
            0f32,
            1.,
            (3, spec.in_channels(), spec.input_len()),
            &Device::Cpu,
        )
        .unwrap();
        model.forward_t(&xs, true).unwrap().dims().to_vec()
    }

    #[test]
    fn every_architecture_produces_logits() {
        for flag in [
            WhichModel::Baseline,
            WhichModel::Vgg16,
            WhichModel::Resnet1d,
            WhichModel::Resnet50,
        ] {
            assert_eq!(logits_shape(&spec(flag)), vec![3, 5], "{flag:?}");
        }
    }

    #[test]
    fn preprocessor_sets_input_layout() {
        let mut s = spec(WhichModel::Baseline);
        s.preprocessor = Preprocessor::AddAxis;
        assert_eq!((s.in_channels(), s.input_len()), (1, 128));
        assert_eq!(logits_shape(&s), vec![3, 5]);
        s.preprocessor = Preprocessor::Tensor;
        assert_eq!(logits_shape(&s), vec![3, 5]);
    }

    #[test]
    fn too_many_pools_is_an_error() {
        let mut s = spec(WhichModel::Baseline);
        s.slice_size = 4;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(get_model(vb, &s).is_err());
    }

    #[test]
    fn spec_round_trips_through_json() {
        let s = spec(WhichModel::Resnet1d);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"model_flag\":\"resnet1d\""));
        assert_eq!(serde_json::from_str::<ModelSpec>(&json).unwrap(), s);
    }
}
