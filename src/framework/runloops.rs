use crate::datasets::{
    load_round, random_offsets, strided_offsets, ExampleRef, IqSignal, ReadOptions, SliceSet,
    SliceTransform, Stats,
};
use crate::models::ModelTrait;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{AdamW, Optimizer};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Everything the loops need besides the examples themselves.
pub struct LoopContext<'a> {
    pub model: &'a dyn ModelTrait,
    pub device: &'a Device,
    pub transform: &'a SliceTransform,
    pub read: &'a ReadOptions,
    pub stats: &'a Stats,
    pub batch_size: usize,
    pub files_per_io: usize,
}

impl LoopContext<'_> {
    fn input_shape(&self) -> (usize, usize) {
        let kind = self.transform.kind();
        (kind.channels(), kind.input_len(self.transform.slice_size()))
    }

    /// Loads `examples` in IO rounds. `offsets` picks the slice positions of
    /// each loaded signal; `per_round` consumes the slices of one round.
    fn for_each_round<O, F>(
        &self,
        examples: &[ExampleRef],
        mut offsets: O,
        mut per_round: F,
    ) -> anyhow::Result<()>
    where
        O: FnMut(&IqSignal) -> Vec<usize>,
        F: FnMut(usize, SliceSet) -> anyhow::Result<()>,
    {
        let files_per_io = self.files_per_io.max(1);
        for (round, chunk) in examples.chunks(files_per_io).enumerate() {
            let signals = load_round(chunk, self.read, self.stats)?;
            let mut set = SliceSet::new(self.transform.output_len());
            for (owner, signal) in signals.iter() {
                for offset in offsets(signal) {
                    set.push(signal, *owner, offset, self.transform);
                }
            }
            log::debug!(
                "IO round {round}: {} examples, {} slices",
                signals.len(),
                set.len()
            );
            per_round(round * files_per_io, set)?;
        }
        Ok(())
    }
}

/// Keras-style time-based decay: `lr / (1 + decay * iterations)`.
#[derive(Clone, Debug)]
pub struct LrSchedule {
    pub base: f64,
    pub decay: f64,
    pub iterations: usize,
}

impl LrSchedule {
    pub fn current(&self) -> f64 {
        self.base / (1.0 + self.decay * self.iterations as f64)
    }

    fn step(&mut self) -> f64 {
        let lr = self.current();
        self.iterations += 1;
        lr
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EpochStats {
    pub loss: f32,
    pub accuracy: f32,
    pub slices: usize,
}

#[derive(Default)]
struct Accumulator {
    sum_loss: f32,
    sum_ok: f32,
    slices: usize,
}

impl Accumulator {
    fn add(&mut self, logits: &Tensor, labels: &Tensor, loss: &Tensor) -> candle_core::Result<()> {
        let b = labels.dim(0)?;
        self.sum_loss += loss.to_vec0::<f32>()? * b as f32;
        self.sum_ok += logits
            .argmax(D::Minus1)?
            .eq(labels)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_vec0::<f32>()?;
        self.slices += b;
        Ok(())
    }

    fn finish(self) -> EpochStats {
        if self.slices == 0 {
            return EpochStats::default();
        }
        EpochStats {
            loss: self.sum_loss / self.slices as f32,
            accuracy: self.sum_ok / self.slices as f32,
            slices: self.slices,
        }
    }
}

pub fn train_epoch(
    ctx: &LoopContext,
    opt: &mut AdamW,
    schedule: &mut LrSchedule,
    examples: &[ExampleRef],
    k: usize,
    rng: &mut ChaCha8Rng,
    epoch: usize,
) -> anyhow::Result<EpochStats> {
    let shape = ctx.input_shape();
    let slice_size = ctx.transform.slice_size();
    let mut acc = Accumulator::default();
    let mut offsets_rng = ChaCha8Rng::seed_from_u64(rng.gen());
    ctx.for_each_round(
        examples,
        |signal| random_offsets(signal.len(), slice_size, k, &mut offsets_rng),
        |_, mut set| {
            set.shuffle(rng);
            for (i, range) in set.batch_ranges(ctx.batch_size).enumerate() {
                let (images, labels) = set.batch(range, shape, ctx.device)?;
                let logits = ctx.model.forward_t(&images, true)?;
                let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
                opt.set_learning_rate(schedule.step());
                opt.backward_step(&loss)?;
                log::trace!(
                    "[Epoch: {epoch:?};{i:?}], batch loss: {:?}",
                    loss.to_vec0::<f32>()?
                );
                acc.add(&logits, &labels, &loss)?;
            }
            Ok(())
        },
    )?;
    Ok(acc.finish())
}

/// Loss and slice accuracy over non-overlapping slices of `examples`.
pub fn valid(ctx: &LoopContext, examples: &[ExampleRef]) -> anyhow::Result<EpochStats> {
    let shape = ctx.input_shape();
    let slice_size = ctx.transform.slice_size();
    let mut acc = Accumulator::default();
    ctx.for_each_round(
        examples,
        |signal| strided_offsets(signal.len(), slice_size, slice_size),
        |_, set| {
            for range in set.batch_ranges(ctx.batch_size) {
                let (images, labels) = set.batch(range, shape, ctx.device)?;
                let logits = ctx.model.forward(&images)?;
                let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
                acc.add(&logits, &labels, &loss)?;
            }
            Ok(())
        },
    )?;
    Ok(acc.finish())
}

/// Slice probabilities of one test example.
#[derive(Clone, Debug, PartialEq)]
pub struct ExamplePrediction {
    /// Position in the test split.
    pub example: usize,
    pub label: u32,
    pub slice_probs: Vec<Vec<f32>>,
}

/// Softmax outputs for every `stride`-spaced slice of `examples`, grouped by
/// example. Examples that could not be loaded are absent.
pub fn predict(
    ctx: &LoopContext,
    examples: &[ExampleRef],
    stride: usize,
) -> anyhow::Result<Vec<ExamplePrediction>> {
    let shape = ctx.input_shape();
    let slice_size = ctx.transform.slice_size();
    let mut predictions: Vec<ExamplePrediction> = Vec::new();
    ctx.for_each_round(
        examples,
        |signal| strided_offsets(signal.len(), slice_size, stride),
        |first, set| {
            for range in set.batch_ranges(ctx.batch_size) {
                let owners = &set.owners[range.clone()];
                let labels = &set.labels[range.clone()];
                let (images, _) = set.batch(range, shape, ctx.device)?;
                let logits = ctx.model.forward(&images)?;
                let probs = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;
                for ((&owner, &label), p) in owners.iter().zip(labels).zip(probs) {
                    let example = first + owner;
                    // slices of one example are contiguous in an unshuffled set
                    match predictions.last_mut() {
                        Some(entry) if entry.example == example => {
                            entry.slice_probs.push(p);
                            continue;
                        }
                        _ => {}
                    }
                    predictions.push(ExamplePrediction {
                        example,
                        label,
                        slice_probs: vec![p],
                    });
                }
            }
            Ok(())
        },
    )?;
    predictions.sort_by_key(|p| p.example);
    Ok(predictions)
}
