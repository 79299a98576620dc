use super::runloops::ExamplePrediction;
use super::voting::{argmax, top_k, VoteType};
use crate::datasets::ExampleRef;
use anyhow::Context;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestReport {
    pub vote: VoteType,
    pub slice_accuracy: f32,
    pub example_accuracy: f32,
    /// `k` of the top-k report, 0 when disabled.
    pub top_k: usize,
    pub top_k_accuracy: Option<f32>,
    pub examples: usize,
    pub slices: usize,
}

/// One line of `predictions_<vote>.json`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub example: String,
    pub device: String,
    pub predicted: String,
    pub correct: bool,
    pub slices: usize,
    pub slice_accuracy: f32,
    pub top_candidates: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceAccuracy {
    pub device: String,
    pub examples: usize,
    pub accuracy: f32,
    pub top_k_accuracy: f32,
}

/// Everything derived from the cached predictions for one vote type.
#[derive(Clone, Debug)]
pub struct Scored {
    pub report: TestReport,
    pub records: Vec<PredictionRecord>,
    pub per_device: Vec<DeviceAccuracy>,
    /// `confusion[true][predicted]`
    pub confusion: Vec<Vec<usize>>,
}

fn device_name(devices: &[String], class: usize) -> String {
    devices
        .get(class)
        .cloned()
        .unwrap_or_else(|| format!("class_{class}"))
}

pub fn score(
    predictions: &[ExamplePrediction],
    examples: &[ExampleRef],
    devices: &[String],
    classes: usize,
    vote: VoteType,
    k: usize,
) -> Scored {
    let mut confusion = vec![vec![0usize; classes]; classes];
    let mut records = Vec::with_capacity(predictions.len());
    let mut slice_ok = 0usize;
    let mut slices = 0usize;
    let mut example_ok = 0usize;
    let mut top_k_ok = 0usize;
    // (examples, correct, top-k correct) per device
    let mut per_class = vec![(0usize, 0usize, 0usize); classes];

    for pred in predictions {
        let label = pred.label as usize;
        let ok = pred
            .slice_probs
            .iter()
            .filter(|p| argmax(p) == label)
            .count();
        slice_ok += ok;
        slices += pred.slice_probs.len();

        let scores = vote.scores(&pred.slice_probs, classes);
        let predicted = argmax(&scores);
        let candidates = top_k(&scores, k);
        let correct = predicted == label;
        let in_top_k = candidates.contains(&label);
        example_ok += correct as usize;
        top_k_ok += in_top_k as usize;
        if label < classes {
            confusion[label][predicted] += 1;
            let entry = &mut per_class[label];
            entry.0 += 1;
            entry.1 += correct as usize;
            entry.2 += in_top_k as usize;
        }

        records.push(PredictionRecord {
            example: examples
                .get(pred.example)
                .map(|e| e.id.clone())
                .unwrap_or_default(),
            device: device_name(devices, label),
            predicted: device_name(devices, predicted),
            correct,
            slices: pred.slice_probs.len(),
            slice_accuracy: ok as f32 / pred.slice_probs.len().max(1) as f32,
            top_candidates: candidates.iter().map(|&c| device_name(devices, c)).collect(),
        });
    }

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f32 / den as f32 };
    let per_device = per_class
        .iter()
        .enumerate()
        .filter(|(_, (n, _, _))| *n > 0)
        .map(|(class, &(n, ok, top))| DeviceAccuracy {
            device: device_name(devices, class),
            examples: n,
            accuracy: ratio(ok, n),
            top_k_accuracy: ratio(top, n),
        })
        .collect();

    Scored {
        report: TestReport {
            vote,
            slice_accuracy: ratio(slice_ok, slices),
            example_accuracy: ratio(example_ok, predictions.len()),
            top_k: k,
            top_k_accuracy: (k > 0).then(|| ratio(top_k_ok, predictions.len())),
            examples: predictions.len(),
            slices,
        },
        records,
        per_device,
        confusion,
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("writing {}", path.display()))
}

pub fn write_predictions(scored: &Scored, dir: &Path) -> anyhow::Result<()> {
    let path = dir.join(format!("predictions_{}.json", scored.report.vote));
    write_json(&path, &scored.records)?;
    log::info!("Saved predictions to {:?}", path.display());
    Ok(())
}

pub fn write_device_accuracy(scored: &Scored, dir: &Path) -> anyhow::Result<()> {
    let path = dir.join(format!("device_accuracy_{}.json", scored.report.vote));
    write_json(&path, &scored.per_device)
}

/// Confusion matrix as CSV, rows are true devices, columns predictions.
pub fn write_confusion(scored: &Scored, devices: &[String], dir: &Path) -> anyhow::Result<()> {
    let classes = scored.confusion.len();
    let names = (0..classes)
        .map(|c| device_name(devices, c))
        .collect::<Vec<_>>();
    let mut csv = String::from("device");
    for name in names.iter() {
        write!(csv, ",{name}")?;
    }
    csv.push('\n');
    for (name, row) in names.iter().zip(scored.confusion.iter()) {
        csv.push_str(name);
        for count in row {
            write!(csv, ",{count}")?;
        }
        csv.push('\n');
    }
    let path = dir.join(format!("confusion_{}.csv", scored.report.vote));
    std::fs::write(&path, csv).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn refs() -> Vec<ExampleRef> {
        ["e0", "e1", "e2"]
            .iter()
            .enumerate()
            .map(|(i, id)| ExampleRef {
                id: id.to_string(),
                path: PathBuf::from(id),
                label: i as u32 % 2,
            })
            .collect()
    }

    fn predictions() -> Vec<ExamplePrediction> {
        vec![
            ExamplePrediction {
                example: 0,
                label: 0,
                slice_probs: vec![vec![0.9, 0.1, 0.0], vec![0.2, 0.8, 0.0]],
            },
            ExamplePrediction {
                example: 1,
                label: 1,
                slice_probs: vec![vec![0.1, 0.9, 0.0]],
            },
            ExamplePrediction {
                example: 2,
                label: 0,
                slice_probs: vec![vec![0.3, 0.7, 0.0], vec![0.4, 0.6, 0.0]],
            },
        ]
    }

    #[test]
    fn accuracies_and_top_k() {
        let devices = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let scored = score(&predictions(), &refs(), &devices, 3, VoteType::ProbSum, 2);
        let r = &scored.report;
        // 2 of 5 slices are right; e0 (1.1 vs 0.9) and e1 are right, e2 is not
        assert!((r.slice_accuracy - 0.4).abs() < 1e-6);
        assert!((r.example_accuracy - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(r.top_k_accuracy, Some(1.0));
        assert_eq!((r.examples, r.slices), (3, 5));
        assert_eq!(scored.confusion[0], vec![1, 1, 0]);
        assert_eq!(scored.confusion[1], vec![0, 1, 0]);
        assert_eq!(scored.records[2].predicted, "b");
        assert_eq!(scored.records[2].top_candidates, vec!["b", "a"]);
        assert_eq!(scored.per_device.len(), 2);
        assert_eq!(scored.per_device[0].accuracy, 0.5);

        let scored = score(&predictions(), &refs(), &devices, 3, VoteType::Majority, 0);
        // e0 ties one slice each and resolves to class 0
        assert!((scored.report.example_accuracy - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(scored.report.top_k_accuracy, None);
        assert!(scored.records[0].top_candidates.is_empty());
    }

    #[test]
    fn writes_reports() {
        let dir = tempfile::tempdir().unwrap();
        let devices = vec!["a".to_string(), "b".to_string()];
        let scored = score(&predictions()[..2], &refs(), &devices, 3, VoteType::LogProbSum, 1);
        write_predictions(&scored, dir.path()).unwrap();
        write_device_accuracy(&scored, dir.path()).unwrap();
        write_confusion(&scored, &devices, dir.path()).unwrap();

        let csv = std::fs::read_to_string(dir.path().join("confusion_log_prob_sum.csv")).unwrap();
        assert_eq!(csv.lines().next().unwrap(), "device,a,b,class_2");
        assert_eq!(csv.lines().count(), 4);
        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("predictions_log_prob_sum.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert!(dir.path().join("device_accuracy_log_prob_sum.json").exists());
    }
}
