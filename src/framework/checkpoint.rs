use anyhow::Context;
use candle_core::Device;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MODEL_FILE: &str = "model.json";
pub const BEST_WEIGHTS: &str = "best_model.safetensors";
pub const LAST_WEIGHTS: &str = "last_model.safetensors";
pub const HISTORY_FILE: &str = "history.json";

pub fn count_size(vm: &VarMap) -> usize {
    vm.all_vars()
        .iter()
        .map(|v| v.as_tensor().elem_count())
        .sum()
}

/// Loads weights into `varmap`. Strict loading requires every variable to be
/// present; `by_name` copies only tensors whose name and shape both match.
/// Returns the number of variables loaded.
pub fn load_weights(
    varmap: &mut VarMap,
    path: &Path,
    by_name: bool,
    device: &Device,
) -> anyhow::Result<usize> {
    if !by_name {
        varmap
            .load(path)
            .with_context(|| format!("loading weights from {}", path.display()))?;
        return Ok(varmap.all_vars().len());
    }

    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("reading weights from {}", path.display()))?;
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let mut loaded = 0;
    for (name, var) in vars.iter() {
        match tensors.get(name) {
            Some(t) if t.dims() == var.dims() => {
                var.set(&t.to_dtype(var.dtype())?)?;
                loaded += 1;
            }
            Some(t) => log::debug!(
                "skipping {name}: shape {:?} in file, {:?} in model",
                t.dims(),
                var.dims()
            ),
            None => log::debug!("skipping {name}: not in {}", path.display()),
        }
    }
    log::info!("loaded {loaded}/{} variables by name", vars.len());
    Ok(loaded)
}

pub fn save_weights(varmap: &VarMap, path: &Path) -> anyhow::Result<()> {
    varmap
        .save(path)
        .with_context(|| format!("saving weights to {}", path.display()))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
    pub lr: f64,
    pub seconds: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainHistory {
    /// The stored history, or an empty one when none was saved yet.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    pub fn next_epoch(&self) -> usize {
        self.epochs.last().map_or(0, |r| r.epoch + 1)
    }
}

/// Outcome of one epoch's validation loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// New best loss: checkpoint the weights.
    Improved,
    Continue,
    Stop,
}

/// Tracks the best validation loss. Stops after `patience` epochs without a
/// strict improvement when enabled.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    enabled: bool,
    patience: usize,
    best: f32,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(enabled: bool, patience: usize) -> Self {
        Self {
            enabled,
            patience,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    pub fn best(&self) -> f32 {
        self.best
    }

    pub fn wait(&self) -> usize {
        self.wait
    }

    pub fn update(&mut self, val_loss: f32) -> Verdict {
        if val_loss < self.best {
            self.best = val_loss;
            self.wait = 0;
            return Verdict::Improved;
        }
        self.wait += 1;
        if self.enabled && self.wait >= self.patience {
            Verdict::Stop
        } else {
            Verdict::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarBuilder;

    fn varmap_with(shapes: &[(&str, usize)]) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (name, n) in shapes {
            vb.get_with_hints(*n, name, candle_nn::Init::Const(1.0))
                .unwrap();
        }
        varmap
    }

    fn value(varmap: &VarMap, name: &str) -> Vec<f32> {
        let vars = varmap.data().lock().unwrap();
        vars[name].as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn strict_and_by_name_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let source = varmap_with(&[("a", 2), ("b", 3)]);
        source
            .data()
            .lock()
            .unwrap()
            .get("a")
            .unwrap()
            .set(&candle_core::Tensor::new(&[5f32, 6.], &Device::Cpu).unwrap())
            .unwrap();
        save_weights(&source, &path).unwrap();

        // "b" has another shape, "c" is missing from the file
        let mut target = varmap_with(&[("a", 2), ("b", 4), ("c", 1)]);
        assert!(load_weights(&mut target, &path, false, &Device::Cpu).is_err());
        assert_eq!(load_weights(&mut target, &path, true, &Device::Cpu).unwrap(), 1);
        assert_eq!(value(&target, "a"), vec![5., 6.]);
        assert_eq!(value(&target, "b"), vec![1.; 4]);

        let mut same = varmap_with(&[("a", 2), ("b", 3)]);
        assert_eq!(load_weights(&mut same, &path, false, &Device::Cpu).unwrap(), 2);
        assert_eq!(value(&same, "a"), vec![5., 6.]);
        assert_eq!(count_size(&same), 5);
    }

    #[test]
    fn history_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE);
        let mut history = TrainHistory::load_or_default(&path).unwrap();
        assert_eq!(history.next_epoch(), 0);
        history.epochs.push(EpochRecord {
            epoch: 0,
            loss: 1.0,
            accuracy: 0.5,
            val_loss: 1.1,
            val_accuracy: 0.4,
            lr: 1e-4,
            seconds: 2.0,
        });
        history.save(&path).unwrap();
        let restored = TrainHistory::load_or_default(&path).unwrap();
        assert_eq!(restored, history);
        assert_eq!(restored.next_epoch(), 1);
    }

    #[test]
    fn early_stopping_waits_for_patience() {
        let mut stop = EarlyStopping::new(true, 2);
        assert_eq!(stop.update(1.0), Verdict::Improved);
        assert_eq!(stop.update(0.5), Verdict::Improved);
        assert_eq!(stop.update(0.5), Verdict::Continue);
        assert_eq!(stop.update(0.4), Verdict::Improved);
        assert_eq!(stop.update(0.7), Verdict::Continue);
        assert_eq!(stop.update(f32::NAN), Verdict::Stop);
        assert_eq!(stop.best(), 0.4);
        assert_eq!(stop.wait(), 2);

        let mut never = EarlyStopping::new(false, 1);
        assert_eq!(never.update(1.0), Verdict::Improved);
        for _ in 0..5 {
            assert_eq!(never.update(2.0), Verdict::Continue);
        }
        assert_eq!(never.best(), 1.0);
    }
}
