use super::Learner;
use anyhow::Context;
use serde_json::{Map, Value};
use std::path::Path;

pub const PARAMS_FILE: &str = "params.json";

/// Creates `dir_path` if needed. Returns whether it already existed.
pub fn makedirs(dir_path: &Path) -> anyhow::Result<bool> {
    if dir_path.exists() {
        return Ok(true);
    }
    std::fs::create_dir_all(dir_path)
        .with_context(|| format!("creating directory {}", dir_path.display()))?;
    Ok(false)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::String(s) => s.clone(),
        v => v.to_string(),
    }
}

/// The configuration as `key : value` lines, the format `load_params` reads.
pub fn config_lines(lnr: &Learner) -> anyhow::Result<Vec<String>> {
    let Value::Object(map) = serde_json::to_value(lnr)? else {
        anyhow::bail!("configuration does not serialize to an object");
    };
    Ok(map
        .iter()
        .map(|(arg, value)| format!("{arg} : {}", display_value(value)))
        .collect())
}

pub fn save_params(lnr: &Learner, json_file: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(json_file)
        .with_context(|| format!("creating {}", json_file.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), lnr)?;
    Ok(())
}

/// Types a text value after the default value stored under the same key.
fn typed_value(raw: &str, default: &Value) -> anyhow::Result<Value> {
    if raw == "None" {
        return Ok(Value::Null);
    }
    let value = match default {
        Value::Bool(_) => match raw.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => anyhow::bail!("expected a boolean, found {other:?}"),
        },
        Value::Number(n) if n.is_f64() => Value::from(raw.parse::<f64>()?),
        // numeric Option fields (id_gpu) and plain integers
        Value::Number(_) => Value::from(raw.parse::<u64>()?),
        _ => Value::String(raw.to_string()),
    };
    Ok(value)
}

/// Parses a `key : value` text dump into a JSON object typed like the
/// defaults. Unknown keys are dropped.
pub fn load_params(path: &Path) -> anyhow::Result<Map<String, Value>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let Value::Object(defaults) = serde_json::to_value(Learner::default())? else {
        anyhow::bail!("configuration does not serialize to an object");
    };

    let mut params = Map::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let (param, value) = line
            .split_once(" : ")
            .with_context(|| format!("malformed parameter line {line:?}"))?;
        let param = param.trim();
        let Some(default) = defaults.get(param) else {
            log::warn!("ignoring unknown parameter {param:?}");
            continue;
        };
        let value = typed_value(value.trim(), default)
            .with_context(|| format!("parameter {param}"))?;
        params.insert(param.to_string(), value);
    }
    Ok(params)
}

/// Loads a saved configuration: JSON for `.json` files, the text dump
/// otherwise. Keys that are absent keep their defaults.
pub fn set_params(restore_params_from: &Path) -> anyhow::Result<Learner> {
    let is_json = restore_params_from
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let value = if is_json {
        let text = std::fs::read_to_string(restore_params_from)
            .with_context(|| format!("reading {}", restore_params_from.display()))?;
        serde_json::from_str::<Value>(&text)
            .with_context(|| format!("parsing {}", restore_params_from.display()))?
    } else {
        Value::Object(load_params(restore_params_from)?)
    };
    serde_json::from_value(value)
        .with_context(|| format!("loading parameters from {}", restore_params_from.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::voting::PerExampleStrategy;
    use clap::Parser;

    #[test]
    fn makedirs_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        assert!(!makedirs(&nested).unwrap());
        assert!(nested.is_dir());
        assert!(makedirs(&nested).unwrap());
    }

    #[test]
    fn json_params_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let lnr = Learner::parse_from([
            "rf-fingerprint",
            "--exp_name",
            "run7",
            "--lr",
            "0.003",
            "--per_example_strategy",
            "all",
            "--restore_weight_from",
            "/tmp/w.safetensors",
            "--multigpu",
        ]);
        let mut lnr = lnr;
        lnr.id_gpu = None;
        let path = dir.path().join(PARAMS_FILE);
        save_params(&lnr, &path).unwrap();
        assert_eq!(set_params(&path).unwrap(), lnr);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        std::fs::write(&path, r#"{"exp_name": "old", "epochs": 3}"#).unwrap();
        let lnr = set_params(&path).unwrap();
        assert_eq!(lnr.exp_name, "old");
        assert_eq!(lnr.epochs, 3);
        assert_eq!(lnr.batch_size, 512);
    }

    #[test]
    fn text_dump_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut lnr = Learner::parse_from([
            "rf-fingerprint",
            "--pickle_files",
            "/data/wifi",
            "--shrink",
            "0.5",
            "--per_example_strategy",
            "majority",
            "--save_predictions",
            "--K",
            "3",
        ]);
        lnr.id_gpu = None;
        let path = dir.path().join("params.txt");
        let mut text = config_lines(&lnr).unwrap().join("\n");
        text.push_str("\nlegacy_key : 1\n");
        std::fs::write(&path, text).unwrap();

        let restored = set_params(&path).unwrap();
        assert_eq!(restored, lnr);
        assert_eq!(restored.per_example_strategy, PerExampleStrategy::Majority);
        assert!(!restored.save_predictions);
    }

    #[test]
    fn malformed_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "epochs = 3\n").unwrap();
        assert!(set_params(&path).is_err());
        std::fs::write(&path, "epochs : many\n").unwrap();
        assert!(set_params(&path).is_err());
        let json = dir.path().join("bad.json");
        std::fs::write(&json, "{not json").unwrap();
        assert!(set_params(&json).is_err());
    }
}
