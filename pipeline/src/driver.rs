//! Pipeline driver: linear stage sequencing with per-stage timing,
//! per-CT output isolation, and batch error reporting.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use tdt_common::labels::LabelMapRegistry;
use tracing::{Level, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, Mode};
use crate::context::Context;
use crate::error::{PipelineError, Result};
use crate::external::Collaborators;
use crate::stages::fmt_minutes;
use crate::stages::lesions::LesionsStage;
use crate::stages::pbpk::PbpkStage;
use crate::stages::preprocess::PreprocessStage;
use crate::stages::recon::ReconStage;
use crate::stages::segmentation::SegmentationStage;
use crate::stages::simind::SimindStage;
use crate::stages::unify::UnifyStage;

/// Canonical label map shipped with the pipeline.
const BUILTIN_LABEL_MAP: &str = include_str!("../data/tdt_map.json");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtInputKind {
    Nifti,
    Dicom,
}

/// A file input must be a NIfTI volume; a directory is treated as a DICOM
/// series. Anything else is rejected.
pub fn classify_ct_input(path: &Path) -> Result<CtInputKind> {
    if path.is_dir() {
        return Ok(CtInputKind::Dicom);
    }
    if path.is_file() {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            return Ok(CtInputKind::Nifti);
        }
    }
    Err(PipelineError::BadInput(path.to_path_buf()))
}

/// Per-CT work area: one deterministic output root per CT input, so runs
/// over multiple CTs never touch each other's files.
pub struct CtWorkspace {
    pub root: PathBuf,
    pub ct_index: usize,
    pub ct_input: PathBuf,
    pub kind: CtInputKind,
}

impl CtWorkspace {
    pub fn subdir(&self, config: &Config, key: &str) -> PathBuf {
        self.root.join(config.subdir_name(key))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RunOptions {
    pub mode: Mode,
    pub logging_on: bool,
    pub save_ct_scan: bool,
    pub save_config: bool,
    pub synthetic_lesions: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Production,
            logging_on: true,
            save_ct_scan: false,
            save_config: false,
            synthetic_lesions: false,
        }
    }
}

/// The CT inputs of a batch directory, in sorted-name order, hidden
/// entries ignored.
pub fn ct_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut inputs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    inputs.sort();
    Ok(inputs)
}

fn timed<F: FnOnce() -> Result<()>>(name: &str, f: F) -> Result<()> {
    info!("Stage start: {name}");
    let start = Instant::now();
    f()?;
    info!(
        "Stage end: {name} | elapsed={:.2}s",
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            PipelineError::Io(std::io::Error::other(format!(
                "walking {}: {e}",
                src.display()
            )))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

pub struct TdtPipeline {
    config: Config,
    config_path: PathBuf,
    config_text: String,
    registry: LabelMapRegistry,
    collaborators: Collaborators,
    options: RunOptions,
    base_dir: PathBuf,
}

impl TdtPipeline {
    /// Loads the config and builds the production collaborators. Per-CT
    /// output roots are created under the current working directory.
    pub fn new<P: AsRef<Path>>(config_path: P, options: RunOptions) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Config::load(&config_path)?;
        let config_text = std::fs::read_to_string(&config_path)?;
        let registry = LabelMapRegistry::from_json_str(BUILTIN_LABEL_MAP)?;
        let collaborators = Collaborators::from_config(&config);
        let base_dir = std::env::current_dir()?;
        Ok(Self {
            config,
            config_path,
            config_text,
            registry,
            collaborators,
            options,
            base_dir,
        })
    }

    /// Replaces the external collaborators (tests inject mocks here).
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Places per-CT output roots under `dir` instead of the current
    /// working directory.
    pub fn with_base_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.base_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs every CT input in the batch directory. A CT failure is
    /// reported and does not abort the remaining CTs. Returns the number
    /// of failed CTs.
    pub fn run_batch(&self, input_ct_dir: &Path) -> Result<usize> {
        let inputs = ct_inputs(input_ct_dir)?;
        if inputs.is_empty() {
            warn!("No CT inputs found in {}", input_ct_dir.display());
        }
        let mut failures = 0usize;
        for (ct_index, ct_input) in inputs.iter().enumerate() {
            println!("Processing CT {ct_index}: {}", ct_input.display());
            if let Err(e) = self.run_ct(ct_index, ct_input) {
                failures += 1;
                eprintln!(
                    "[ERROR] CT index {ct_index} failed for input: {}\n{e}",
                    ct_input.display()
                );
            }
        }
        Ok(failures)
    }

    /// Runs the full stage sequence for a single CT input.
    pub fn run_ct(&self, ct_index: usize, ct_input: &Path) -> Result<()> {
        let kind = classify_ct_input(ct_input)?;
        let root = self
            .base_dir
            .join(format!("{}_CT_{ct_index}", self.config.output_folder.title));
        std::fs::create_dir_all(&root)?;
        for name in self.config.subdir_names.values() {
            std::fs::create_dir_all(root.join(name))?;
        }

        let workspace = CtWorkspace {
            root,
            ct_index,
            ct_input: ct_input.to_path_buf(),
            kind,
        };

        if self.options.save_config {
            if let Some(name) = self.config_path.file_name() {
                std::fs::copy(&self.config_path, workspace.root.join(name))?;
            }
        }
        if self.options.save_ct_scan {
            let Some(name) = ct_input.file_name() else {
                return Err(PipelineError::BadInput(ct_input.to_path_buf()));
            };
            let dst = workspace.root.join(name);
            if !dst.exists() {
                match kind {
                    CtInputKind::Dicom => copy_tree(ct_input, &dst)?,
                    CtInputKind::Nifti => {
                        std::fs::copy(ct_input, &dst)?;
                    }
                }
            }
        }

        if !self.options.logging_on {
            return self.run_stages(&workspace);
        }

        let log_path = workspace
            .root
            .join(format!("logging_file_CT_{ct_index}.log"));
        let file = std::fs::File::create(&log_path)?;
        let level = match self.options.mode {
            Mode::Debug => Level::DEBUG,
            Mode::Production => Level::INFO,
        };
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_target(false)
            .with_max_level(level)
            .with_writer(Mutex::new(file))
            .finish();

        // stage events for this CT land in its own log file only,
        // mirroring a per-CT logger with propagation disabled
        tracing::subscriber::with_default(subscriber, || {
            info!("---- Log started ----");
            info!("CT INDEX: {ct_index}");
            info!("CT INPUT: {}", ct_input.display());
            info!("CONFIG SOURCE: {}", self.config_path.display());
            match serde_json::from_str::<serde_json::Value>(
                &tdt_common::jsonc::strip_json_comments(&self.config_text),
            ) {
                Ok(value) => info!(
                    "CONFIG CONTENTS:\n{}",
                    serde_json::to_string_pretty(&value).unwrap_or_default()
                ),
                Err(_) => info!("CONFIG CONTENTS: <unparseable>"),
            }
            self.run_stages(&workspace)
        })
    }

    fn recon_outputs_exist(&self, workspace: &CtWorkspace) -> bool {
        let recon_dir = workspace.subdir(&self.config, "recon");
        let prefix = &self.config.spect_simulation.name;
        self.config.pbpk.frame_start_times.iter().all(|t| {
            recon_dir
                .join(format!("{prefix}_{}min.nii", fmt_minutes(*t)))
                .exists()
        })
    }

    fn run_stages(&self, workspace: &CtWorkspace) -> Result<()> {
        let total = Instant::now();
        info!("Pipeline start | mode={:?}", self.options.mode);

        if self.options.mode == Mode::Production && self.recon_outputs_exist(workspace) {
            info!(
                "Skipping CT_{}: reconstruction outputs already exist.",
                workspace.ct_index
            );
            return Ok(());
        }

        let mut context = Context::new();

        timed("Organ Segmentation", || {
            SegmentationStage::new(&self.config, workspace, self.collaborators.segmenter.as_ref())
                .run(&mut context)
        })?;

        timed("TDT ROI Unification", || {
            UnifyStage::new(&self.config, workspace, &self.registry).run(&mut context)
        })?;

        if self.options.synthetic_lesions {
            match &self.config.synthetic_lesions {
                Some(lesions) => timed("Synthetic Lesions", || {
                    LesionsStage::new(&self.config, lesions, workspace, &self.registry)
                        .run(&mut context)
                })?,
                None => warn!(
                    "Synthetic lesions requested but the config has no synthetic_lesions section."
                ),
            }
        }

        timed("SIMIND Preprocessing", || {
            PreprocessStage::new(&self.config, workspace, &self.registry).run(&mut context)
        })?;

        timed("PBPK", || {
            PbpkStage::new(&self.config, workspace, self.collaborators.tac_solver.as_ref())
                .run(&mut context)
        })?;

        timed("SIMIND Simulation", || {
            SimindStage::new(&self.config, workspace, self.options.mode).run(&mut context)
        })?;

        timed("SPECT Reconstruction", || {
            ReconStage::new(&self.config, workspace, self.collaborators.osem_solver.as_ref())
                .run(&mut context)
        })?;

        info!(
            "Pipeline end | total_elapsed={:.2}s",
            total.elapsed().as_secs_f64()
        );
        Ok(())
    }
}
