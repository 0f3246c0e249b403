use std::path::PathBuf;

use clap::Parser;
use tdt_pipeline::{Mode, RunOptions, TdtPipeline};
use tracing::Level;

/// Theranostic digital twin pipeline: simulate quantitative SPECT
/// acquisitions from patient CT volumes.
///
/// Each entry of the input directory (a DICOM series directory or a NIfTI
/// file) is processed as one CT, in sorted-name order, into its own output
/// root. A failing CT is reported and does not stop the batch.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Pipeline configuration file (JSON, comments tolerated).
    #[arg(long = "config_file", value_name = "FILE")]
    config_file: PathBuf,

    /// Directory holding the CT inputs, one entry per CT.
    #[arg(long = "input_ct_dir", value_name = "DIR")]
    input_ct_dir: PathBuf,

    /// Write a per-CT log file under each CT output root (default).
    #[arg(long = "logging_on", default_value_t = false)]
    logging_on: bool,
    /// Disable the per-CT log files.
    #[arg(long = "no-logging_on", default_value_t = false, conflicts_with = "logging_on")]
    no_logging_on: bool,

    /// Copy the CT input into the CT output root.
    #[arg(long = "save_ct_scan", default_value_t = false)]
    save_ct_scan: bool,
    #[arg(long = "no-save_ct_scan", default_value_t = false, conflicts_with = "save_ct_scan")]
    no_save_ct_scan: bool,

    /// Copy the configuration file into each CT output root.
    #[arg(long = "save_config", default_value_t = false)]
    save_config: bool,
    #[arg(long = "no-save_config", default_value_t = false, conflicts_with = "save_config")]
    no_save_config: bool,

    /// Insert synthetic lesions (requires a synthetic_lesions config
    /// section).
    #[arg(long = "synthetic_lesions", default_value_t = false)]
    synthetic_lesions: bool,
    #[arg(
        long = "no-synthetic_lesions",
        default_value_t = false,
        conflicts_with = "synthetic_lesions"
    )]
    no_synthetic_lesions: bool,

    /// Run mode; PRODUCTION skips CTs whose reconstructions already exist
    /// and cleans up simulator scratch files.
    #[arg(long, value_enum, default_value = "production", ignore_case = true)]
    mode: Mode,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.mode {
        Mode::Debug => Level::DEBUG,
        Mode::Production => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let options = RunOptions {
        mode: cli.mode,
        logging_on: !cli.no_logging_on,
        save_ct_scan: cli.save_ct_scan && !cli.no_save_ct_scan,
        save_config: cli.save_config && !cli.no_save_config,
        synthetic_lesions: cli.synthetic_lesions && !cli.no_synthetic_lesions,
    };

    let pipeline = TdtPipeline::new(&cli.config_file, options)?;
    let failures = pipeline.run_batch(&cli.input_ct_dir)?;
    if failures > 0 {
        eprintln!("{failures} CT input(s) failed; see the per-CT logs for details.");
    }
    // per-CT failures are reported above but never change the exit code
    Ok(())
}
