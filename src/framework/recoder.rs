use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};
use std::path::{Path, PathBuf};

const CONSOLE_PATTERN: &str = "{h({l})} {m}{n}";
const FILE_PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)(utc)} [{f}:{L}] {l} -> {m}{n}";

/// `run-<local time>.log` inside `log_dir`. The stamp avoids `:` so the name
/// is valid on every platform.
pub fn log_file_path(log_dir: &Path, now: chrono::DateTime<chrono::Local>) -> PathBuf {
    log_dir.join(format!("run-{}.log", now.format("%Y%m%d-%H%M%S")))
}

/// Info and above on stderr; everything in a per-run file under the
/// experiment directory of `learner`.
pub fn build_log_config(learner: &crate::framework::Learner) -> anyhow::Result<Config> {
    let log_dir = learner.experiment_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_file_path(&log_dir, chrono::Local::now());

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
        .build(log_path)?;

    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(log::LevelFilter::Info)))
                .build("stderr", Box::new(stderr)),
        )
        .build(
            Root::builder()
                .appender("logfile")
                .appender("stderr")
                .build(log::LevelFilter::Trace),
        )?;
    Ok(config)
}
