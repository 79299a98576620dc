use super::checkpoint::{
    self, EarlyStopping, TrainHistory, Verdict, BEST_WEIGHTS, HISTORY_FILE, LAST_WEIGHTS,
    MODEL_FILE,
};
use super::report;
use super::runloops::{self, EpochStats, ExamplePrediction, LoopContext, LrSchedule};
use super::{EpochRecord, Pipeline, TestOptions, TestReport, TrainOptions};
use crate::datasets::{
    load_index, shrink_len, DatasetIndex, IndexOptions, ReadOptions, Sampling, SliceTransform,
};
use crate::models::{get_model, ModelSpec, ModelTrait};
use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// What the cached test predictions were computed with.
#[derive(Clone, Debug, PartialEq)]
struct PredictionKey {
    test_stride: usize,
    shrink: f64,
    read: ReadOptions,
}

/// Model, data and checkpoints of one experiment.
pub struct TrainValTest {
    base_path: Option<PathBuf>,
    stats_path: Option<PathBuf>,
    save_path: PathBuf,
    val_from_train: bool,
    seed: u64,
    device: Device,
    varmap: VarMap,
    model: Option<Box<dyn ModelTrait>>,
    spec: Option<ModelSpec>,
    index: Option<DatasetIndex>,
    best_model_path: Option<PathBuf>,
    predictions: Option<(PredictionKey, Vec<ExamplePrediction>)>,
}

impl TrainValTest {
    pub fn new(
        base_path: Option<PathBuf>,
        stats_path: Option<PathBuf>,
        save_path: PathBuf,
        multigpu: bool,
        num_gpu: usize,
        val_from_train: bool,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let device = Device::cuda_if_available(0)?;
        Self::with_device(
            base_path,
            stats_path,
            save_path,
            multigpu,
            num_gpu,
            val_from_train,
            seed,
            device,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_device(
        base_path: Option<PathBuf>,
        stats_path: Option<PathBuf>,
        save_path: PathBuf,
        multigpu: bool,
        num_gpu: usize,
        val_from_train: bool,
        seed: u64,
        device: Device,
    ) -> anyhow::Result<Self> {
        if multigpu {
            log::warn!(
                "{num_gpu} GPUs requested: replicas are not supported, running on {device:?}"
            );
        }
        Ok(Self {
            base_path,
            stats_path,
            save_path,
            val_from_train,
            seed,
            device,
            varmap: VarMap::new(),
            model: None,
            spec: None,
            index: None,
            best_model_path: None,
            predictions: None,
        })
    }

    pub fn spec(&self) -> Option<&ModelSpec> {
        self.spec.as_ref()
    }

    pub fn index(&self) -> Option<&DatasetIndex> {
        self.index.as_ref()
    }

    fn build(&mut self, spec: ModelSpec) -> anyhow::Result<()> {
        self.varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device);
        let model = get_model(vb, &spec)
            .with_context(|| format!("building {:?} model", spec.model_flag))?;
        log::info!("{}", spec.summary());
        log::info!(
            "parameters: {} ({:.2} MB)",
            checkpoint::count_size(&self.varmap),
            checkpoint::count_size(&self.varmap) as f32 * 4. / 2f32.powf(20.0)
        );
        self.model = Some(model);
        self.spec = Some(spec);
        self.predictions = None;
        self.best_model_path = None;
        Ok(())
    }

    fn ready(&self) -> anyhow::Result<(&dyn ModelTrait, &ModelSpec, &DatasetIndex)> {
        match (&self.model, &self.spec, &self.index) {
            (Some(model), Some(spec), Some(index)) => Ok((&**model, spec, index)),
            (None, _, _) | (_, None, _) => anyhow::bail!("no model: add or restore one first"),
            (_, _, None) => anyhow::bail!("no data: call load_data first"),
        }
    }

    fn transform(spec: &ModelSpec, read: &ReadOptions) -> anyhow::Result<SliceTransform> {
        if read.slice_size != spec.slice_size {
            anyhow::bail!(
                "slice size {} does not match the model input {}",
                read.slice_size,
                spec.slice_size
            );
        }
        Ok(SliceTransform::new(spec.preprocessor, spec.slice_size))
    }
}

impl Pipeline for TrainValTest {
    fn add_model(&mut self, spec: ModelSpec) -> anyhow::Result<()> {
        let path = self.save_path.join(MODEL_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&spec)?)
            .with_context(|| format!("writing {}", path.display()))?;
        self.build(spec)
    }

    fn load_model_structure(
        &mut self,
        slice_size: usize,
        classes: usize,
        path: &Path,
    ) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading model structure {}", path.display()))?;
        let mut spec: ModelSpec = serde_json::from_str(&text)
            .with_context(|| format!("parsing model structure {}", path.display()))?;
        if spec.slice_size != slice_size || spec.classes != classes {
            log::warn!(
                "model structure was saved for slice size {} / {} classes, using {slice_size} / {classes}",
                spec.slice_size,
                spec.classes
            );
            spec.slice_size = slice_size;
            spec.classes = classes;
        }
        self.build(spec)
    }

    fn load_weights(&mut self, path: &Path, by_name: bool) -> anyhow::Result<()> {
        if self.model.is_none() {
            anyhow::bail!("no model to load weights into");
        }
        checkpoint::load_weights(&mut self.varmap, path, by_name, &self.device)?;
        log::info!("loaded weights from {:?}", path.display());
        self.predictions = None;
        Ok(())
    }

    fn load_data(&mut self, sampling: Sampling) -> anyhow::Result<()> {
        let base_path = self
            .base_path
            .as_deref()
            .context("no dataset directory given (--pickle_files)")?;
        let stats_path = self.stats_path.as_deref().unwrap_or(base_path);
        let classes = self.spec.as_ref().map_or(usize::MAX, |s| s.classes);
        let index = load_index(
            base_path,
            stats_path,
            &IndexOptions {
                classes,
                sampling,
                val_from_train: self.val_from_train,
                seed: self.seed,
            },
        )?;
        self.index = Some(index);
        self.predictions = None;
        Ok(())
    }

    fn train_model(&mut self, opts: &TrainOptions) -> anyhow::Result<()> {
        let (model, spec, index) = self.ready()?;
        let transform = Self::transform(spec, &opts.read)?;
        if index.train.is_empty() {
            anyhow::bail!("training split is empty");
        }

        let history_path = self.save_path.join(HISTORY_FILE);
        let mut history = if opts.cont {
            TrainHistory::load_or_default(&history_path)?
        } else {
            TrainHistory::default()
        };
        let first_epoch = history.next_epoch();

        let mut opt = AdamW::new(
            self.varmap.all_vars(),
            ParamsAdamW {
                lr: opts.lr,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        let mut schedule = LrSchedule {
            base: opts.lr,
            decay: opts.decay,
            iterations: 0,
        };
        let ctx = LoopContext {
            model,
            device: &self.device,
            transform: &transform,
            read: &opts.read,
            stats: &index.stats,
            batch_size: opts.batch_size,
            files_per_io: opts.files_per_io,
        };

        let best_path = self.save_path.join(BEST_WEIGHTS);
        let mut stopping = EarlyStopping::new(opts.early_stopping, opts.patience);
        let mut best_saved = false;
        for epoch in first_epoch..first_epoch + opts.epochs {
            let mut loop_time = Instant::now();
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            let mut examples = index.train.clone();
            examples.shuffle(&mut rng);
            examples.truncate(shrink_len(examples.len(), opts.shrink));

            let train_stats =
                runloops::train_epoch(&ctx, &mut opt, &mut schedule, &examples, opts.k, &mut rng, epoch)?;
            let train_secs = loop_time.elapsed();
            log::info!(
                "Epoch {epoch:3} -> train average loss: {:.5}, accuracy: {:5.2}%, slices: {}, train time: {:5.2?}",
                train_stats.loss,
                train_stats.accuracy * 100.0,
                train_stats.slices,
                train_secs
            );

            loop_time = Instant::now();
            let val_stats = if index.val.is_empty() {
                EpochStats {
                    loss: train_stats.loss,
                    ..Default::default()
                }
            } else {
                runloops::valid(&ctx, &index.val)?
            };
            log::info!(
                "Epoch {epoch:3} -> validation loss: {:.5}, accuracy: {:5.2}%, valid time: {:5.2?}",
                val_stats.loss,
                val_stats.accuracy * 100.0,
                loop_time.elapsed()
            );

            history.epochs.push(EpochRecord {
                epoch,
                loss: train_stats.loss,
                accuracy: train_stats.accuracy,
                val_loss: val_stats.loss,
                val_accuracy: val_stats.accuracy,
                lr: schedule.current(),
                seconds: (train_secs + loop_time.elapsed()).as_secs_f64(),
            });

            match stopping.update(val_stats.loss) {
                Verdict::Improved => {
                    checkpoint::save_weights(&self.varmap, &best_path)?;
                    best_saved = true;
                    log::info!("Saved best weights to {:?}", best_path.display());
                }
                Verdict::Continue => {}
                Verdict::Stop => {
                    log::info!(
                        "Early stopping after epoch {epoch}: no improvement in {} epochs",
                        stopping.wait()
                    );
                    break;
                }
            }
        }

        checkpoint::save_weights(&self.varmap, &self.save_path.join(LAST_WEIGHTS))?;
        history.save(&history_path)?;
        if best_saved {
            self.best_model_path = Some(best_path);
        }
        self.predictions = None;
        Ok(())
    }

    fn best_model_path(&self) -> Option<PathBuf> {
        self.best_model_path.clone()
    }

    fn test_model(&mut self, opts: &TestOptions) -> anyhow::Result<TestReport> {
        let key = PredictionKey {
            test_stride: opts.test_stride,
            shrink: opts.shrink,
            read: opts.read.clone(),
        };
        let (model, spec, index) = self.ready()?;
        let test = &index.test[..shrink_len(index.test.len(), opts.shrink)];

        let cached = matches!(&self.predictions, Some((k, _)) if *k == key);
        let fresh = if cached {
            None
        } else {
            let transform = Self::transform(spec, &opts.read)?;
            let ctx = LoopContext {
                model,
                device: &self.device,
                transform: &transform,
                read: &opts.read,
                stats: &index.stats,
                batch_size: opts.batch_size,
                files_per_io: opts.files_per_io,
            };
            Some(runloops::predict(&ctx, test, opts.test_stride)?)
        };
        if let Some(predictions) = fresh {
            self.predictions = Some((key, predictions));
        }

        let (_, spec, index) = self.ready()?;
        let predictions = self
            .predictions
            .as_ref()
            .map(|(_, p)| p.as_slice())
            .unwrap_or_default();
        let scored = report::score(
            predictions,
            &index.test,
            &index.devices,
            spec.classes,
            opts.vote_type,
            opts.get_device_acc,
        );

        std::fs::create_dir_all(&opts.figure_path)?;
        report::write_confusion(&scored, &index.devices, &opts.figure_path)?;
        if opts.get_device_acc > 0 {
            report::write_device_accuracy(&scored, &self.save_path)?;
            for device in scored.per_device.iter() {
                log::debug!(
                    "{}: accuracy {:.4}, top-{} accuracy {:.4} ({} examples)",
                    device.device,
                    device.accuracy,
                    opts.get_device_acc,
                    device.top_k_accuracy,
                    device.examples
                );
            }
        }
        if opts.save_predictions {
            report::write_predictions(&scored, &self.save_path)?;
        }

        let r = &scored.report;
        log::info!(
            "[{}] per-slice accuracy: {:.4}, per-example accuracy: {:.4} ({} examples, {} slices)",
            r.vote,
            r.slice_accuracy,
            r.example_accuracy,
            r.examples,
            r.slices
        );
        if let Some(top) = r.top_k_accuracy {
            log::info!("[{}] top-{} accuracy: {:.4}", r.vote, r.top_k, top);
        }
        Ok(scored.report)
    }
}
