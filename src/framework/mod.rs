mod checkpoint;
mod launcher;
mod params;
mod parser;
mod pipeline;
mod recoder;
mod report;
mod runloops;
pub mod voting;
pub use checkpoint::{
    count_size, load_weights, save_weights, EarlyStopping, EpochRecord, TrainHistory, Verdict,
    BEST_WEIGHTS, HISTORY_FILE, LAST_WEIGHTS, MODEL_FILE,
};
pub use launcher::{configure_gpus, execute, prepare, restore_params, run};
pub use params::{config_lines, load_params, makedirs, save_params, set_params, PARAMS_FILE};
pub use parser::Learner;
pub use pipeline::TrainValTest;
pub use recoder::{build_log_config, log_file_path};
pub use report::{score, DeviceAccuracy, PredictionRecord, Scored, TestReport};
pub use runloops::{EpochStats, ExamplePrediction, LrSchedule};

use crate::datasets::{ReadOptions, Sampling};
use crate::models::ModelSpec;
use std::path::{Path, PathBuf};
use voting::VoteType;

/// Arguments of `Pipeline::train_model`.
#[derive(Clone, Debug)]
pub struct TrainOptions {
    pub batch_size: usize,
    pub k: usize,
    pub files_per_io: usize,
    /// Continue from restored weights or structure; extends the saved history.
    pub cont: bool,
    pub lr: f64,
    pub decay: f64,
    pub shrink: f64,
    pub epochs: usize,
    pub read: ReadOptions,
    pub early_stopping: bool,
    pub patience: usize,
}

/// Arguments of `Pipeline::test_model`.
#[derive(Clone, Debug)]
pub struct TestOptions {
    pub batch_size: usize,
    pub shrink: f64,
    pub vote_type: VoteType,
    pub test_stride: usize,
    pub files_per_io: usize,
    pub read: ReadOptions,
    /// Directory receiving the confusion matrices.
    pub figure_path: PathBuf,
    pub save_predictions: bool,
    pub get_device_acc: usize,
}

/// The phases the launcher sequences. `TrainValTest` is the real
/// implementation.
pub trait Pipeline {
    fn add_model(&mut self, spec: ModelSpec) -> anyhow::Result<()>;

    fn load_model_structure(
        &mut self,
        slice_size: usize,
        classes: usize,
        path: &Path,
    ) -> anyhow::Result<()>;

    fn load_weights(&mut self, path: &Path, by_name: bool) -> anyhow::Result<()>;

    fn load_data(&mut self, sampling: Sampling) -> anyhow::Result<()>;

    fn train_model(&mut self, opts: &TrainOptions) -> anyhow::Result<()>;

    /// Checkpoint with the best validation loss of the last training run.
    fn best_model_path(&self) -> Option<PathBuf>;

    fn test_model(&mut self, opts: &TestOptions) -> anyhow::Result<TestReport>;
}
