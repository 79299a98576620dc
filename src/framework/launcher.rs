use super::params::{config_lines, makedirs, save_params, set_params, PARAMS_FILE};
use super::{Learner, Pipeline, TestOptions, TestReport, TrainOptions, TrainValTest};
use crate::datasets::ReadOptions;
use crate::models::ModelSpec;
use std::time::Instant;

impl From<&Learner> for ModelSpec {
    fn from(lnr: &Learner) -> Self {
        ModelSpec {
            model_flag: lnr.model_flag,
            slice_size: lnr.slice_size as usize,
            classes: lnr.devices as usize,
            cnn_stacks: lnr.cnn_stack,
            fc_stacks: lnr.fc_stack,
            channels: lnr.channels,
            dropout_flag: lnr.dropout_flag,
            fc1: lnr.fc1,
            fc2: lnr.fc2,
            batchnorm: lnr.batchnorm,
            preprocessor: lnr.effective_preprocessor(),
        }
    }
}

impl From<&Learner> for ReadOptions {
    fn from(lnr: &Learner) -> Self {
        ReadOptions {
            file_type: lnr.file_type,
            slice_size: lnr.slice_size as usize,
            normalize: lnr.normalize,
            decimated: lnr.decimated,
            add_padding: lnr.padding,
            try_concat: lnr.try_concat,
            crop: lnr.crop,
        }
    }
}

/// Points CUDA at the requested GPU. Without an id every GPU stays visible.
pub fn configure_gpus(lnr: &Learner) {
    std::env::set_var("CUDA_DEVICE_ORDER", "PCI_BUS_ID");
    if let Some(id) = lnr.id_gpu {
        std::env::set_var("CUDA_VISIBLE_DEVICES", id.to_string());
    }
}

/// Replaces the command-line configuration with the one saved at
/// `--restore_params_from`, keeping that path. Applying it twice loads the
/// same file again.
pub fn restore_params(lnr: Learner) -> anyhow::Result<Learner> {
    let Some(restore_params_from) = lnr.restore_params_from else {
        return Ok(lnr);
    };
    log::info!("restoring parameters from {:?}", restore_params_from.display());
    let mut restored = set_params(&restore_params_from)?;
    restored.restore_params_from = Some(restore_params_from);
    Ok(restored)
}

/// Settles the effective configuration and the experiment directory, then
/// persists the configuration as `params.json`.
pub fn prepare(mut lnr: Learner) -> anyhow::Result<Learner> {
    if lnr.multigpu {
        lnr.id_gpu = None;
    }
    makedirs(&lnr.experiment_dir())?;

    lnr = restore_params(lnr)?;

    makedirs(&lnr.save_path)?;
    let save_path = lnr.experiment_dir();
    makedirs(&save_path)?;

    configure_gpus(&lnr);

    log::info!("*************** Configuration ***************");
    for line in config_lines(&lnr)? {
        log::info!("{line}");
    }
    save_params(&lnr, &save_path.join(PARAMS_FILE))?;
    Ok(lnr)
}

/// Runs the phases in their fixed order: model (new or restored structure),
/// weights, data, training, testing. Returns one report per vote strategy.
pub fn execute<P: Pipeline>(lnr: &Learner, pipeline: &mut P) -> anyhow::Result<Vec<TestReport>> {
    let read = ReadOptions::from(lnr);

    match &lnr.restore_model_from {
        Some(path) => {
            log::info!("*************** Adding Existing Model ***************");
            pipeline.load_model_structure(lnr.slice_size as usize, lnr.devices as usize, path)?;
        }
        None => {
            log::info!("*************** Adding New Model ***************");
            pipeline.add_model(ModelSpec::from(lnr))?;
        }
    }

    if let Some(path) = &lnr.restore_weight_from {
        log::info!("*************** Adding Existing Weights ***************");
        pipeline.load_weights(path, lnr.load_by_name)?;
    }

    log::info!("*************** Loading Data ***************");
    pipeline.load_data(lnr.sampling)?;

    if lnr.train {
        log::info!("*************** Training Model ***************");
        log::info!(
            "training strategy {:?}, preprocessor {:?}",
            lnr.training_strategy,
            lnr.effective_preprocessor()
        );
        let start_time = Instant::now();
        pipeline.train_model(&TrainOptions {
            batch_size: lnr.batch_size as usize,
            k: lnr.k as usize,
            files_per_io: lnr.files_per_io as usize,
            cont: lnr.restores_model(),
            lr: lnr.lr,
            decay: lnr.decay,
            shrink: lnr.shrink,
            epochs: lnr.epochs,
            read: read.clone(),
            early_stopping: lnr.early_stopping,
            patience: lnr.patience,
        })?;
        log::info!(
            "Time to train model {:0.3} s",
            start_time.elapsed().as_secs_f64()
        );
    } else {
        log::info!("*************** Not Training Model ***************");
    }

    let mut reports = Vec::new();
    if lnr.test {
        if let Some(best) = pipeline.best_model_path() {
            log::info!("Loading model from {:?}", best.display());
            pipeline.load_weights(&best, false)?;
        }

        log::info!("*************** Testing Model ***************");
        let start_time = Instant::now();
        for vote_type in lnr.per_example_strategy.votes() {
            reports.push(pipeline.test_model(&TestOptions {
                batch_size: lnr.batch_size as usize,
                shrink: lnr.shrink,
                vote_type,
                test_stride: lnr.test_stride,
                files_per_io: lnr.files_per_io as usize,
                read: read.clone(),
                figure_path: lnr.experiment_dir(),
                save_predictions: lnr.save_predictions,
                get_device_acc: lnr.get_device_acc,
            })?);
        }
        log::info!(
            "Time to test model {:0.3} s",
            start_time.elapsed().as_secs_f64()
        );
    }
    Ok(reports)
}

pub fn run(lnr: Learner) -> anyhow::Result<Vec<TestReport>> {
    let lnr = prepare(lnr)?;

    log::info!("*************** Framework Initialized ***************");
    let mut pipeline = TrainValTest::new(
        lnr.pickle_files.clone(),
        lnr.pickle_files.clone(),
        lnr.experiment_dir(),
        lnr.multigpu,
        lnr.num_gpu,
        lnr.val_from_train,
        lnr.seed,
    )?;
    execute(&lnr, &mut pipeline)
}
