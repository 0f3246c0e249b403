//! Pipeline configuration: a single JSON document, comments tolerated.
//!
//! The parsed [`Config`] is an immutable snapshot; stages never mutate it.
//! Values that change during a run (the effective ROI subset after lesion
//! insertion) live in the [`crate::context::Context`] instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tdt_common::jsonc::strip_json_comments;

use crate::error::{PipelineError, Result};

/// Run mode. DEBUG keeps per-core simulator scratch files; PRODUCTION
/// removes them after aggregation and skips CTs whose reconstructions
/// already exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Debug,
    Production,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub output_folder: OutputFolder,
    pub subdir_names: BTreeMap<String, String>,
    pub spect_preprocessing: PreprocessingCfg,
    pub pbpk: PbpkCfg,
    pub spect_simulation: SimulationCfg,
    #[serde(default)]
    pub synthetic_lesions: Option<LesionsCfg>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OutputFolder {
    pub title: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PreprocessingCfg {
    /// Prefix used for every artifact of the preprocessing chain.
    pub name: String,
    /// Target in-plane dimension of the simulation grid; omit to keep the
    /// CT resolution.
    #[serde(default)]
    pub xy_dim: Option<usize>,
    /// Canonical ROI names requested by the user.
    pub roi_subset: Vec<String>,
    /// External segmenter executable; defaults to `TotalSegmentator` on
    /// the PATH.
    #[serde(default)]
    pub segmenter_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PbpkCfg {
    pub name: String,
    #[serde(rename = "VOIs")]
    pub vois: Vec<String>,
    /// Acquisition frame start times in minutes post injection.
    #[serde(rename = "FrameStartTimes")]
    pub frame_start_times: Vec<f64>,
    /// Acquisition frame durations in seconds, one per frame.
    #[serde(rename = "FrameDurations")]
    pub frame_durations: Vec<f64>,
    /// Sample kidney / salivary gland receptor density and release rate
    /// from lognormal distributions instead of using model defaults.
    #[serde(rename = "Randomization_Kidney_SG_Para", default)]
    pub randomize_kidney_sg: bool,
    /// TAC solver executable (JSON request on stdin, JSON result on stdout).
    #[serde(rename = "SolverPath", default)]
    pub solver_path: Option<PathBuf>,
    #[serde(rename = "HotAmount", default = "default_hot_amount")]
    pub hot_amount: f64,
    #[serde(rename = "ColdAmount", default = "default_cold_amount")]
    pub cold_amount: f64,
}

fn default_hot_amount() -> f64 {
    10.0
}

fn default_cold_amount() -> f64 {
    100.0
}

#[derive(Clone, Debug, Deserialize)]
pub struct SimulationCfg {
    pub name: String,
    #[serde(rename = "Collimator")]
    pub collimator: String,
    #[serde(rename = "Isotope")]
    pub isotope: String,
    #[serde(rename = "NumProjections")]
    pub num_projections: u32,
    /// Detector orbit radius in cm.
    #[serde(rename = "DetectorDistance")]
    pub detector_distance: f64,
    #[serde(rename = "OutputImgSize")]
    pub output_img_size: u32,
    /// Output pixel width in cm.
    #[serde(rename = "OutputPixelWidth")]
    pub output_pixel_width: f64,
    /// Output slice width in cm.
    #[serde(rename = "OutputSliceWidth")]
    pub output_slice_width: f64,
    #[serde(rename = "NumPhotons")]
    pub num_photons: f64,
    #[serde(rename = "SIMINDDirectory")]
    pub simind_directory: PathBuf,
    /// Energy window width in percent around the photopeak.
    #[serde(rename = "EnergyWindowWidth")]
    pub energy_window_width: f64,
    /// Detector crystal width in cm.
    #[serde(rename = "DetectorWidth")]
    pub detector_width: f64,
    /// Detector crystal length in cm; 0 means "use the CT length".
    #[serde(rename = "DetectorLength")]
    pub detector_length: f64,
    /// Child processes per organ; out-of-range values fall back to the
    /// machine's available parallelism.
    #[serde(rename = "NumCores", default)]
    pub num_cores: Option<usize>,
    #[serde(rename = "Iterations")]
    pub iterations: u32,
    #[serde(rename = "Subsets")]
    pub subsets: u32,
    /// OSEM solver executable consuming a problem directory.
    #[serde(rename = "ReconSolverPath", default)]
    pub recon_solver_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LesionsCfg {
    pub name: String,
    /// Per-ROI lesion specifications, keyed by canonical ROI name.
    pub specs: BTreeMap<String, LesionSpec>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbScheme {
    Uniform,
    Gaussian,
    UserDefined,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LesionSpec {
    pub n_lesions: usize,
    pub radii_mm: Vec<f64>,
    pub prob: ProbScheme,
    /// Gaussian width in mm; required when `prob` is `gaussian`.
    #[serde(default)]
    pub sigma_mm: Option<f64>,
    #[serde(default = "default_margin_mm")]
    pub margin_mm: f64,
    #[serde(default)]
    pub seed: u64,
    /// Fixed centers for `prob = user_defined`, (Z, Y, X) voxel indices.
    #[serde(default)]
    pub user_centers_zyx: Option<Vec<[i64; 3]>>,
}

fn default_margin_mm() -> f64 {
    1.0
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let stripped = strip_json_comments(text);
        let config: Config = serde_json::from_str(&stripped)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pbpk.frame_start_times.is_empty() {
            return Err(PipelineError::Config(
                "pbpk.FrameStartTimes must not be empty".into(),
            ));
        }
        if self.pbpk.frame_durations.len() != self.pbpk.frame_start_times.len() {
            return Err(PipelineError::Config(format!(
                "pbpk.FrameDurations has {} entries, expected {} (one per frame)",
                self.pbpk.frame_durations.len(),
                self.pbpk.frame_start_times.len()
            )));
        }
        if self
            .pbpk
            .frame_start_times
            .iter()
            .any(|t| !t.is_finite() || *t < 0.0)
        {
            return Err(PipelineError::Config(
                "pbpk.FrameStartTimes must be finite and >= 0".into(),
            ));
        }
        if self.pbpk.vois.is_empty() {
            return Err(PipelineError::Config("pbpk.VOIs must not be empty".into()));
        }
        if let Some(lesions) = &self.synthetic_lesions {
            for (roi, spec) in &lesions.specs {
                if spec.n_lesions == 0 {
                    return Err(PipelineError::Config(format!(
                        "synthetic_lesions.specs.{roi}: n_lesions must be > 0"
                    )));
                }
                if spec.radii_mm.len() != spec.n_lesions {
                    return Err(PipelineError::Config(format!(
                        "synthetic_lesions.specs.{roi}: radii_mm length must equal n_lesions"
                    )));
                }
                if spec.prob == ProbScheme::Gaussian && spec.sigma_mm.is_none() {
                    return Err(PipelineError::Config(format!(
                        "synthetic_lesions.specs.{roi}: sigma_mm is required for prob = gaussian"
                    )));
                }
                if spec.prob == ProbScheme::UserDefined && spec.user_centers_zyx.is_none() {
                    return Err(PipelineError::Config(format!(
                        "synthetic_lesions.specs.{roi}: user_centers_zyx is required for prob = user_defined"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Subdirectory name for a module, falling back to `<key>_outputs`.
    pub fn subdir_name(&self, key: &str) -> String {
        self.subdir_names
            .get(key)
            .cloned()
            .unwrap_or_else(|| format!("{key}_outputs"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
    {
        // output root
        "output_folder": { "title": "TDT_Output" },
        "subdir_names": {
            "spect_preprocessing": "spect_preprocessing_outputs",
            "pbpk": "pbpk_outputs",
            "spect_simulation": "spect_simulation_outputs"
        },
        "spect_preprocessing": {
            "name": "spect_preprocessing",
            "xy_dim": 128,
            "roi_subset": ["body", "kidney", "liver"]
        },
        "pbpk": {
            "name": "pbpk",
            "VOIs": ["Kidney", "Liver", "Rest"],
            "FrameStartTimes": [240.0, 1440.0],
            "FrameDurations": [600.0, 600.0],
            "Randomization_Kidney_SG_Para": true,
            "SolverPath": "/opt/pbpk/solve"
        },
        "spect_simulation": {
            "name": "spect_simulation",
            "Collimator": "me-legp",
            "Isotope": "lu177",
            "NumProjections": 64,
            "DetectorDistance": 15.0,
            "OutputImgSize": 128,
            "OutputPixelWidth": 0.48,
            "OutputSliceWidth": 0.48,
            "NumPhotons": 1e7, /* per organ */
            "SIMINDDirectory": "/opt/simind",
            "EnergyWindowWidth": 20,
            "DetectorWidth": 40.0,
            "DetectorLength": 0,
            "NumCores": 4,
            "Iterations": 4,
            "Subsets": 8
        },
        "synthetic_lesions": {
            "name": "synthetic_lesions",
            "specs": {
                "prostate": {
                    "n_lesions": 3,
                    "radii_mm": [8.0, 6.0, 10.0],
                    "prob": "uniform",
                    "margin_mm": 2.0,
                    "seed": 17
                }
            }
        }
    }
    "#;

    #[test]
    fn parses_commented_config() {
        let config = Config::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.output_folder.title, "TDT_Output");
        assert_eq!(config.spect_preprocessing.xy_dim, Some(128));
        assert_eq!(config.pbpk.vois, vec!["Kidney", "Liver", "Rest"]);
        assert_eq!(config.pbpk.frame_start_times, vec![240.0, 1440.0]);
        assert_eq!(config.pbpk.hot_amount, 10.0);
        assert!(config.pbpk.randomize_kidney_sg);
        assert_eq!(config.spect_simulation.num_cores, Some(4));
        assert_eq!(config.spect_simulation.detector_length, 0.0);
        let lesions = config.synthetic_lesions.as_ref().unwrap();
        assert_eq!(lesions.specs["prostate"].prob, ProbScheme::Uniform);
        assert_eq!(lesions.specs["prostate"].margin_mm, 2.0);
    }

    #[test]
    fn frame_length_mismatch_rejected() {
        let broken = SAMPLE.replace(
            "\"FrameDurations\": [600.0, 600.0]",
            "\"FrameDurations\": [600.0]",
        );
        assert!(matches!(
            Config::from_json_str(&broken),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn gaussian_without_sigma_rejected() {
        let broken = SAMPLE.replace("\"prob\": \"uniform\"", "\"prob\": \"gaussian\"");
        assert!(matches!(
            Config::from_json_str(&broken),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn subdir_fallback() {
        let config = Config::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.subdir_name("pbpk"), "pbpk_outputs");
        assert_eq!(config.subdir_name("unknown"), "unknown_outputs");
    }
}
