use crate::datasets::{DataType, FileType, Preprocessor, Sampling, TrainingStrategy};
use crate::framework::voting::PerExampleStrategy;
use crate::models::WhichModel;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Every run parameter of an experiment. Long flag names keep the snake_case
/// spelling of the `params.json` keys so both stay interchangeable.
#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(name = "rf-fingerprint")]
#[command(version = "0.1")]
#[command(about = "Train and Validation pipeline for RF device fingerprinting", long_about = None)]
#[command(rename_all = "snake_case")]
#[serde(default)]
pub struct Learner {
    /// Experiment name.
    #[arg(long, default_value_t = String::from("experiment_1"))]
    pub exp_name: String,

    /// Path containing partition, labels and stats files with data information.
    #[arg(long)]
    pub pickle_files: Option<PathBuf>,

    /// Path to save experiment weights and logs.
    #[arg(long, default_value = "experiments")]
    pub save_path: PathBuf,

    /// Disable saving model predictions.
    #[arg(long, action = ArgAction::SetFalse)]
    pub save_predictions: bool,

    /// Set experiment task.
    #[arg(long, default_value_t = String::from("1Cv2"))]
    pub task: String,

    /// Enable to use equalized WiFi data.
    #[arg(long)]
    pub equalize: bool,

    /// Set the data type.
    #[arg(long, value_enum, default_value_t = DataType::Wifi)]
    pub data_type: DataType,

    /// Set data file format.
    #[arg(long, value_enum, default_value_t = FileType::Npy)]
    pub file_type: FileType,

    /// Enable if the data in the files is decimated (single real channel).
    #[arg(long)]
    pub decimated: bool,

    /// If validation is not present in the partition file, generate one from the
    /// training set. (If called, use test set as validation).
    #[arg(long, action = ArgAction::SetFalse)]
    pub val_from_train: bool,

    /// Define model architecture.
    #[arg(short, long, value_enum, default_value_t = WhichModel::Baseline)]
    pub model_flag: WhichModel,

    /// Set slice size.
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 198)]
    pub slice_size: u64,

    /// Set number of total devices.
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 50)]
    pub devices: u64,

    /// [Baseline Model] Set number of cnn layers.
    #[arg(long, default_value_t = 5)]
    pub cnn_stack: usize,

    /// [Baseline Model] Set number of fc layers.
    #[arg(long, default_value_t = 2)]
    pub fc_stack: usize,

    /// [Baseline Model] Set number of channels of cnn.
    #[arg(long, default_value_t = 128)]
    pub channels: usize,

    /// [Baseline Model] Set number of neurons in the first fc layer.
    #[arg(long, default_value_t = 256)]
    pub fc1: usize,

    /// [Baseline Model] Set number of neurons in the penultimate fc layer.
    #[arg(long, default_value_t = 128)]
    pub fc2: usize,

    /// Enable to use dropout layers.
    #[arg(long)]
    pub dropout_flag: bool,

    /// Enable to use batch normalization.
    #[arg(long)]
    pub batchnorm: bool,

    /// Path from where to load model structure.
    #[arg(long)]
    pub restore_model_from: Option<PathBuf>,

    /// Path from where to load model weights.
    #[arg(long)]
    pub restore_weight_from: Option<PathBuf>,

    /// Path from where to load model parameters.
    #[arg(long)]
    pub restore_params_from: Option<PathBuf>,

    /// Enable to only load weights by name.
    #[arg(long)]
    pub load_by_name: bool,

    /// Disable adding zero-padding if examples are smaller than slice size.
    #[arg(long, action = ArgAction::SetFalse)]
    pub padding: bool,

    /// Enable if examples are smaller than slice size and using demodulated data,
    /// try and concat them.
    #[arg(long)]
    pub try_concat: bool,

    /// Set preprocessor type to use.
    #[arg(long, value_enum, default_value_t = Preprocessor::No)]
    pub preprocessor: Preprocessor,

    /// Set batch down sampling factor K.
    #[arg(long = "K", value_parser = clap::value_parser!(u64).range(1..), default_value_t = 16)]
    #[serde(rename = "K")]
    pub k: u64,

    /// Set files loaded to memory per IO.
    #[arg(long = "files_per_IO", value_parser = clap::value_parser!(u64).range(1..), default_value_t = 500000)]
    #[serde(rename = "files_per_IO")]
    pub files_per_io: u64,

    /// Specify if you do not want to normalize the data using mean and std in
    /// stats files (if stats does not have this info, it is ignored).
    #[arg(long, action = ArgAction::SetFalse)]
    pub normalize: bool,

    /// Set to keep first "crop" samples.
    #[arg(long, default_value_t = 0)]
    pub crop: usize,

    /// Set training strategy to use.
    #[arg(long, value_enum, default_value_t = TrainingStrategy::Big)]
    pub training_strategy: TrainingStrategy,

    /// Set sampling strategy to use.
    #[arg(long, value_enum, default_value_t = Sampling::Model)]
    pub sampling: Sampling,

    /// Set epochs to train.
    #[arg(long, default_value_t = 25)]
    pub epochs: usize,

    /// Set batch size.
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 512)]
    pub batch_size: u64,

    /// Set optimizer learning rate.
    #[arg(long, default_value_t = 0.0001)]
    pub lr: f64,

    /// Set optimizer learning rate decay (per update).
    #[arg(long, default_value_t = 0.0)]
    pub decay: f64,

    /// Enable multiple distributed GPUs.
    #[arg(short = 'g', long)]
    pub multigpu: bool,

    /// Set number of distributed GPUs if --multigpu enabled.
    #[arg(short, long, default_value_t = 8)]
    pub num_gpu: usize,

    /// Set GPU ID to use.
    #[arg(long, default_value = "0")]
    pub id_gpu: Option<usize>,

    /// Set down sampling factor.
    #[arg(long, default_value_t = 1.0)]
    pub shrink: f64,

    /// Disable early stopping.
    #[arg(long, action = ArgAction::SetFalse)]
    pub early_stopping: bool,

    /// Set number of epochs for early stopping patience.
    #[arg(long, default_value_t = 1)]
    pub patience: usize,

    /// Enable to train model.
    #[arg(long)]
    pub train: bool,

    /// Enable to test model.
    #[arg(short, long)]
    pub test: bool,

    /// Set stride to use for testing.
    #[arg(long, default_value_t = 16)]
    pub test_stride: usize,

    /// Set the strategy used to compute the per example accuracy.
    #[arg(long, value_enum, ignore_case = true, default_value_t = PerExampleStrategy::ProbSum)]
    pub per_example_strategy: PerExampleStrategy,

    /// Report and save number of top class candidates for each example.
    #[arg(long, default_value_t = 5)]
    pub get_device_acc: usize,

    /// Seed used for shuffling and slice sampling.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl Default for Learner {
    fn default() -> Self {
        Self::parse_from([env!("CARGO_PKG_NAME")])
    }
}

impl Learner {
    /// `save_path/exp_name`, where every artifact of the run lands.
    pub fn experiment_dir(&self) -> PathBuf {
        self.save_path.join(&self.exp_name)
    }

    /// The preprocessor applied to every slice, in training and at test time.
    pub fn effective_preprocessor(&self) -> Preprocessor {
        self.preprocessor.resolve(self.training_strategy)
    }

    pub fn restores_model(&self) -> bool {
        self.restore_weight_from.is_some() || self.restore_model_from.is_some()
    }
}
