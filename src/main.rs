use clap::Parser;
use rf_fingerprint::framework;

fn main() -> anyhow::Result<()> {
    // the log file belongs to the restored experiment, not the command-line one
    let lnr = framework::restore_params(framework::Learner::parse())?;
    let _log_handle = log4rs::init_config(framework::build_log_config(&lnr)?)?;

    let reports = framework::run(lnr)?;

    for report in reports.iter() {
        println!(
            "[{}] per-slice accuracy: {:.4}, per-example accuracy: {:.4}",
            report.vote, report.slice_accuracy, report.example_accuracy
        );
    }
    Ok(())
}
