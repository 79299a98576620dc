mod generator;
mod preprocess;
mod reader;
use anyhow::Context;
use clap::ValueEnum;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub use generator::{load_round, random_offsets, shrink_len, strided_offsets, SliceSet};
pub use preprocess::{Preprocessor, SliceTransform, TrainingStrategy};
pub use reader::{read_example, IqSignal, ReadOptions};

pub const PARTITION_FILE: &str = "partition.json";
pub const LABELS_FILE: &str = "labels.json";
pub const STATS_FILE: &str = "stats.json";
/// Share of the training set moved to validation when the partition has none.
pub const VAL_FRACTION: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Npy,
    Npz,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Wifi,
    Adsb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    /// Use the partition as it is.
    Model,
    /// Undersample training examples to the rarest device's count.
    Balanced,
}

/// An example file and its class index.
#[derive(Clone, Debug, PartialEq)]
pub struct ExampleRef {
    pub id: String,
    pub path: PathBuf,
    pub label: u32,
}

/// Normalization statistics. One value applies to both channels, two values
/// are I and Q.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default)]
    pub mean: Option<Vec<f32>>,
    #[serde(default)]
    pub std: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct Partition {
    train: Vec<String>,
    #[serde(default)]
    val: Option<Vec<String>>,
    test: Vec<String>,
}

/// Everything `load_data` knows about the dataset, before any capture is read.
#[derive(Clone, Debug, Default)]
pub struct DatasetIndex {
    pub train: Vec<ExampleRef>,
    pub val: Vec<ExampleRef>,
    pub test: Vec<ExampleRef>,
    /// Device names; the position is the class index.
    pub devices: Vec<String>,
    pub stats: Stats,
}

/// Options of `load_index`, the arguments `TrainValTest::load_data` forwards.
#[derive(Clone, Debug)]
pub struct IndexOptions {
    pub classes: usize,
    pub sampling: Sampling,
    pub val_from_train: bool,
    pub seed: u64,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))
}

fn read_stats(stats_path: &Path) -> anyhow::Result<Stats> {
    let path = stats_path.join(STATS_FILE);
    if !path.exists() {
        log::info!("no stats file at {:?}, normalization disabled", path.display());
        return Ok(Stats::default());
    }
    read_json(&path)
}

fn resolve(base_path: &Path, id: &str) -> PathBuf {
    let p = Path::new(id);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_path.join(p)
    }
}

fn balance(train: Vec<ExampleRef>, rng: &mut ChaCha8Rng) -> Vec<ExampleRef> {
    let mut per_device: BTreeMap<u32, Vec<ExampleRef>> = BTreeMap::new();
    for ex in train {
        per_device.entry(ex.label).or_default().push(ex);
    }
    let Some(min) = per_device.values().map(Vec::len).min() else {
        return Vec::new();
    };
    let mut balanced = Vec::with_capacity(min * per_device.len());
    for (_, mut examples) in per_device {
        examples.shuffle(rng);
        examples.truncate(min);
        balanced.extend(examples);
    }
    balanced
}

/// Reads the partition, labels and stats files into a `DatasetIndex`.
pub fn load_index(
    base_path: &Path,
    stats_path: &Path,
    opts: &IndexOptions,
) -> anyhow::Result<DatasetIndex> {
    let partition: Partition = read_json(&base_path.join(PARTITION_FILE))?;
    let labels: BTreeMap<String, String> = read_json(&base_path.join(LABELS_FILE))?;
    let stats = read_stats(stats_path)?;

    let ids = partition
        .train
        .iter()
        .chain(partition.val.iter().flatten())
        .chain(partition.test.iter());
    let mut names = BTreeSet::new();
    for id in ids {
        let name = labels
            .get(id)
            .with_context(|| format!("example {id} has no device label"))?;
        names.insert(name.clone());
    }
    let devices = names.into_iter().collect::<Vec<_>>();
    if devices.len() > opts.classes {
        anyhow::bail!(
            "dataset has {} devices but the model classifies {}",
            devices.len(),
            opts.classes
        );
    }

    let to_refs = |ids: &[String]| -> Vec<ExampleRef> {
        ids.iter()
            .map(|id| {
                let name = &labels[id];
                let label = devices.binary_search(name).unwrap_or_default() as u32;
                ExampleRef {
                    id: id.clone(),
                    path: resolve(base_path, id),
                    label,
                }
            })
            .collect()
    };

    let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);
    let mut train = to_refs(&partition.train);
    let test = to_refs(&partition.test);
    let val = match &partition.val {
        Some(val) => to_refs(val),
        None if opts.val_from_train => {
            train.shuffle(&mut rng);
            let n_val = if train.len() >= 2 {
                ((train.len() as f64 * VAL_FRACTION).round() as usize).clamp(1, train.len() - 1)
            } else {
                0
            };
            log::info!("no validation split, taking {n_val} examples from train");
            train.split_off(train.len() - n_val)
        }
        None => {
            log::info!("no validation split, validating on test");
            test.clone()
        }
    };

    if opts.sampling == Sampling::Balanced {
        train = balance(train, &mut rng);
    }

    log::info!(
        "Load dataset: {} devices, {} train / {} val / {} test examples",
        devices.len(),
        train.len(),
        val.len(),
        test.len()
    );
    Ok(DatasetIndex {
        train,
        val,
        test,
        devices,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_metadata(dir: &Path, partition: serde_json::Value, labels: serde_json::Value) {
        std::fs::write(dir.join(PARTITION_FILE), partition.to_string()).unwrap();
        std::fs::write(dir.join(LABELS_FILE), labels.to_string()).unwrap();
    }

    fn opts(val_from_train: bool) -> IndexOptions {
        IndexOptions {
            classes: 4,
            sampling: Sampling::Model,
            val_from_train,
            seed: 1,
        }
    }

    fn labels() -> serde_json::Value {
        json!({
            "a0": "dev_b", "a1": "dev_b", "a2": "dev_b", "a3": "dev_b", "a4": "dev_b",
            "b0": "dev_a", "b1": "dev_a", "b2": "dev_a", "b3": "dev_a", "b4": "dev_a",
            "t0": "dev_a", "t1": "dev_b", "v0": "dev_c",
        })
    }

    #[test]
    fn devices_are_sorted_and_paths_resolved() {
        let dir = tempfile::tempdir().unwrap();
        write_metadata(
            dir.path(),
            json!({"train": ["a0", "b0"], "val": ["v0"], "test": ["t0", "t1"]}),
            labels(),
        );
        let index = load_index(dir.path(), dir.path(), &opts(true)).unwrap();
        assert_eq!(index.devices, vec!["dev_a", "dev_b", "dev_c"]);
        assert_eq!(index.train[0].label, 1);
        assert_eq!(index.train[1].label, 0);
        assert_eq!(index.val[0].label, 2);
        assert_eq!(index.test[0].path, dir.path().join("t0"));
        assert_eq!(index.stats, Stats::default());
    }

    #[test]
    fn validation_comes_from_train_or_test() {
        let dir = tempfile::tempdir().unwrap();
        let train = json!(["a0", "a1", "a2", "a3", "a4", "b0", "b1", "b2", "b3", "b4"]);
        write_metadata(
            dir.path(),
            json!({"train": train, "test": ["t0", "t1"]}),
            labels(),
        );
        let index = load_index(dir.path(), dir.path(), &opts(true)).unwrap();
        assert_eq!(index.train.len(), 9);
        assert_eq!(index.val.len(), 1);
        assert!(!index.train.contains(&index.val[0]));

        let index = load_index(dir.path(), dir.path(), &opts(false)).unwrap();
        assert_eq!(index.train.len(), 10);
        assert_eq!(index.val, index.test);
    }

    #[test]
    fn balanced_sampling_undersamples_train() {
        let dir = tempfile::tempdir().unwrap();
        write_metadata(
            dir.path(),
            json!({"train": ["a0", "a1", "a2", "b0"], "val": ["v0"], "test": ["t0"]}),
            labels(),
        );
        let mut o = opts(true);
        o.sampling = Sampling::Balanced;
        let index = load_index(dir.path(), dir.path(), &o).unwrap();
        assert_eq!(index.train.len(), 2);
        let mut labels = index.train.iter().map(|e| e.label).collect::<Vec<_>>();
        labels.sort();
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn missing_label_and_too_many_devices_fail() {
        let dir = tempfile::tempdir().unwrap();
        write_metadata(
            dir.path(),
            json!({"train": ["zz"], "test": []}),
            labels(),
        );
        assert!(load_index(dir.path(), dir.path(), &opts(true)).is_err());

        write_metadata(
            dir.path(),
            json!({"train": ["a0", "b0"], "val": ["v0"], "test": []}),
            labels(),
        );
        let mut o = opts(true);
        o.classes = 2;
        assert!(load_index(dir.path(), dir.path(), &o).is_err());
    }

    #[test]
    fn stats_are_optional() {
        let dir = tempfile::tempdir().unwrap();
        write_metadata(
            dir.path(),
            json!({"train": ["a0"], "val": ["v0"], "test": ["t0"]}),
            labels(),
        );
        std::fs::write(dir.path().join(STATS_FILE), r#"{"mean": [0.5], "std": [2.0]}"#).unwrap();
        let index = load_index(dir.path(), dir.path(), &opts(true)).unwrap();
        assert_eq!(index.stats.mean, Some(vec![0.5]));
        assert_eq!(index.stats.std, Some(vec![2.0]));
    }
}
