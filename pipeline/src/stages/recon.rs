//! Reconstruction stage: per frame, Poisson realizations of the projection
//! totals, triple-energy-window scatter estimation, OSEM reconstruction
//! through the solver seam, and calibration to MBq/mL.

use std::path::{Path, PathBuf};

use ndarray::{Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use tdt_common::blob;
use tdt_nifti::{NiftiHeader, VoxelData};
use tracing::{debug, info};

use crate::config::Config;
use crate::context::{Context, assign, need};
use crate::driver::CtWorkspace;
use crate::error::{PipelineError, Result};
use crate::external::{OsemSolver, ProjMeta, PsfMeta, ReconProblem};
use crate::stages::fmt_minutes;

/// Looks up an interfile `key := value` entry, case-insensitive on the key.
pub(crate) fn header_value(text: &str, key: &str) -> Option<String> {
    let key = key.to_ascii_lowercase();
    for line in text.lines() {
        let Some((name, value)) = line.split_once(":=") else {
            continue;
        };
        let name = name
            .trim_start_matches([';', '!', '#', ' '])
            .trim()
            .to_ascii_lowercase();
        if name == key {
            return Some(value.trim().to_string());
        }
    }
    None
}

fn header_num<T: std::str::FromStr>(text: &str, key: &str, path: &Path) -> Result<T> {
    header_value(text, key)
        .and_then(|v| v.split_whitespace().next().map(|s| s.to_string()))
        .and_then(|v| v.parse::<T>().ok())
        .ok_or_else(|| {
            PipelineError::SimulatorProcessFailed(format!(
                "missing or invalid '{key}' in {}",
                path.display()
            ))
        })
}

/// Energy window width (keV) from a projection header: upper minus lower
/// window level.
pub(crate) fn energy_window_width(text: &str, path: &Path) -> Result<f64> {
    let lower: f64 = header_num(text, "energy window lower level", path)?;
    let upper: f64 = header_num(text, "energy window upper level", path)?;
    Ok(upper - lower)
}

/// Parses the system sensitivity (counts/s/MBq) out of the calibration
/// report by key, tolerating layout drift between simulator versions.
pub(crate) fn parse_sensitivity(text: &str, path: &Path) -> Result<f64> {
    for line in text.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains("sensitivity") && lower.contains("cps/mbq") {
            if let Some(value) = line.rsplit(':').next() {
                if let Some(token) = value.split_whitespace().next() {
                    if let Ok(v) = token.parse::<f64>() {
                        return Ok(v);
                    }
                }
            }
        }
    }
    Err(PipelineError::CalibrationParseFailed(path.to_path_buf()))
}

/// Reshapes a flat window blob to (num_proj, Y, X), flips Y and transposes
/// to (num_proj, X, Y).
pub(crate) fn reshape_projections(
    flat: Vec<f32>,
    dim1: usize,
    dim2: usize,
    num_proj: usize,
    path: &Path,
) -> Result<Array3<f32>> {
    let expected = num_proj * dim1 * dim2;
    if flat.len() != expected {
        return Err(PipelineError::ShapeMismatch {
            what: format!("projection blob {}", path.display()),
            a: vec![flat.len()],
            b: vec![expected],
        });
    }
    let mut arr = Array3::from_shape_vec((num_proj, dim2, dim1), flat)
        .expect("length checked above");
    arr.invert_axis(Axis(1));
    let arr = arr.permuted_axes([0, 2, 1]);
    Ok(arr.as_standard_layout().to_owned())
}

/// Independent Poisson realization of every projection bin.
pub(crate) fn poisson_realization<R: Rng>(rng: &mut R, arr: &Array3<f32>) -> Array3<f32> {
    arr.mapv(|lambda| {
        if lambda <= 0.0 {
            0.0
        } else {
            let dist = Poisson::new(lambda as f64).expect("lambda > 0");
            dist.sample(rng) as f32
        }
    })
}

/// Triple-energy-window scatter estimate:
/// `S = (lower/ww_lower + upper/ww_upper) * ww_peak / 2`.
pub(crate) fn tew_scatter(
    lower: &Array3<f32>,
    upper: &Array3<f32>,
    ww_lower: f64,
    ww_upper: f64,
    ww_peak: f64,
) -> Array3<f32> {
    ndarray::Zip::from(lower).and(upper).map_collect(|&l, &u| {
        ((l as f64 / ww_lower + u as f64 / ww_upper) * ww_peak / 2.0) as f32
    })
}

/// Counts -> MBq/mL: divide by sensitivity, frame duration and voxel
/// dimensions.
pub(crate) fn counts_to_mbq_per_ml(
    recon: &Array3<f32>,
    sensitivity: f64,
    frame_duration_sec: f64,
    pixel_width: f64,
    slice_width: f64,
) -> Array3<f32> {
    let denom = sensitivity * frame_duration_sec * pixel_width * pixel_width * slice_width;
    recon.mapv(|v| (v as f64 / denom) as f32)
}

/// Attenuation volume referenced by an interfile `.hct` header.
fn load_attenuation(hct_path: &Path) -> Result<Array3<f32>> {
    let text = std::fs::read_to_string(hct_path)?;
    let nx: usize = header_num(&text, "matrix size [1]", hct_path)?;
    let ny: usize = header_num(&text, "matrix size [2]", hct_path)?;
    let nz: usize = header_num(&text, "matrix size [3]", hct_path)?;
    let data_name = header_value(&text, "name of data file").ok_or_else(|| {
        PipelineError::SimulatorProcessFailed(format!(
            "missing 'name of data file' in {}",
            hct_path.display()
        ))
    })?;
    let data_path = hct_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(data_name.trim());
    blob::read_f32_volume(&data_path, [nz, ny, nx]).map_err(Into::into)
}

/// Center-of-rotation offsets, one per projection. Two-column files keep
/// their first column and are rewritten in single-column form.
fn load_cor(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)?;
    let rows: Vec<Vec<f64>> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            l.split_whitespace()
                .filter_map(|t| t.parse::<f64>().ok())
                .collect()
        })
        .collect();
    let values: Vec<f64> = rows.iter().filter_map(|r| r.first().copied()).collect();
    if rows.iter().any(|r| r.len() > 1) {
        let rewritten: String = values.iter().map(|v| format!("{v}\n")).collect();
        std::fs::write(path, rewritten)?;
    }
    Ok(values)
}

fn psf_meta(text: &str) -> PsfMeta {
    let opt = |key: &str| {
        header_value(text, key)
            .and_then(|v| v.split_whitespace().next().map(|s| s.to_string()))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    PsfMeta {
        hole_diameter_cm: opt("collimator hole diameter"),
        hole_length_cm: opt("collimator thickness"),
        intrinsic_fwhm_cm: opt("intrinsic resolution"),
    }
}

pub struct ReconStage<'a> {
    config: &'a Config,
    workspace: &'a CtWorkspace,
    solver: &'a dyn OsemSolver,
}

impl<'a> ReconStage<'a> {
    pub fn new(
        config: &'a Config,
        workspace: &'a CtWorkspace,
        solver: &'a dyn OsemSolver,
    ) -> Self {
        Self {
            config,
            workspace,
            solver,
        }
    }

    pub fn run(&self, context: &mut Context) -> Result<()> {
        context.require(&["class_seg", "spect_sim_output_dir", "simind_work_dir"])?;
        let class_seg = need(&context.class_seg, "class_seg")?;
        let output_dir = need(&context.spect_sim_output_dir, "spect_sim_output_dir")?.clone();
        let header_dir = need(&context.simind_work_dir, "simind_work_dir")?.clone();

        let sim = &self.config.spect_simulation;
        let prefix = &sim.name;
        let recon_dir = self.workspace.subdir(self.config, "recon");
        std::fs::create_dir_all(&recon_dir)?;

        let calibration_file = output_dir.join("calib.res");
        if !calibration_file.exists() {
            return Err(PipelineError::CalibrationParseFailed(calibration_file));
        }
        let sensitivity =
            parse_sensitivity(&std::fs::read_to_string(&calibration_file)?, &calibration_file)?;
        debug!("System sensitivity: {sensitivity} cps/MBq");

        // headers come from the first organ's first core
        let first_organ = class_seg
            .keys()
            .next()
            .ok_or(PipelineError::EmptySegmentation)?
            .name();
        let h00 = |window: usize| {
            header_dir.join(format!("{prefix}_{first_organ}_0_tot_w{window}.h00"))
        };
        let (lower_h, peak_h, upper_h) = (h00(1), h00(2), h00(3));
        for p in [&lower_h, &peak_h, &upper_h] {
            if !p.exists() {
                return Err(PipelineError::SimulatorProcessFailed(format!(
                    "missing projection header: {}",
                    p.display()
                )));
            }
        }

        let peak_text = std::fs::read_to_string(&peak_h)?;
        let dim1: usize = header_num(&peak_text, "matrix size [1]", &peak_h)?;
        let dim2: usize = header_num(&peak_text, "matrix size [2]", &peak_h)?;
        let num_proj: usize = header_num(&peak_text, "total number of images", &peak_h)?;
        let ww_peak = energy_window_width(&peak_text, &peak_h)?;
        let ww_lower = energy_window_width(&std::fs::read_to_string(&lower_h)?, &lower_h)?;
        let ww_upper = energy_window_width(&std::fs::read_to_string(&upper_h)?, &upper_h)?;
        let psf = psf_meta(&peak_text);

        let cor_path = header_dir.join(format!("{prefix}_{first_organ}_0.cor"));
        if !cor_path.exists() {
            return Err(PipelineError::SimulatorProcessFailed(format!(
                "missing COR file: {}",
                cor_path.display()
            )));
        }
        let cor = load_cor(&cor_path)?;

        let hct_path = header_dir.join(format!("{prefix}_{first_organ}_0.hct"));
        if !hct_path.exists() {
            return Err(PipelineError::SimulatorProcessFailed(format!(
                "missing attenuation header: {}",
                hct_path.display()
            )));
        }
        let attenuation = load_attenuation(&hct_path)?;

        let proj = ProjMeta {
            dim1,
            dim2,
            num_proj,
            ww_peak,
            ww_lower,
            ww_upper,
        };

        let mut rng = StdRng::from_entropy();
        let mut recon_paths: Vec<PathBuf> = Vec::new();

        for (frame, start) in self.config.pbpk.frame_start_times.iter().enumerate() {
            let minutes = fmt_minutes(*start);
            let out_path = recon_dir.join(format!("{prefix}_{minutes}min.nii"));
            if out_path.exists() {
                debug!("Reconstruction already exists: {}", out_path.display());
                recon_paths.push(out_path);
                continue;
            }

            let window = |w: usize| {
                let path = output_dir.join(format!("{prefix}_{minutes}min_tot_w{w}.a00"));
                let flat = blob::read_f32_vec(&path)?;
                reshape_projections(flat, dim1, dim2, num_proj, &path)
            };
            let lower = window(1)?;
            let photopeak = window(2)?;
            let upper = window(3)?;

            let photopeak_real = poisson_realization(&mut rng, &photopeak);
            let lower_real = poisson_realization(&mut rng, &lower);
            let upper_real = poisson_realization(&mut rng, &upper);

            let scatter = tew_scatter(&lower_real, &upper_real, ww_lower, ww_upper, ww_peak);

            info!(
                "Reconstructing frame {minutes} min ({} iterations, {} subsets)",
                sim.iterations, sim.subsets
            );
            let problem = ReconProblem {
                photopeak: &photopeak_real,
                scatter: &scatter,
                attenuation: &attenuation,
                cor: &cor,
                proj,
                psf,
                iterations: sim.iterations,
                subsets: sim.subsets,
            };
            let solver_work = recon_dir.join("osem_work").join(format!("{minutes}min"));
            let recon = self.solver.reconstruct(&solver_work, &problem)?;

            let calibrated = counts_to_mbq_per_ml(
                &recon,
                sensitivity,
                self.config.pbpk.frame_durations[frame],
                sim.output_pixel_width,
                sim.output_slice_width,
            );

            let (nz, ny, nx) = calibrated.dim();
            let header = NiftiHeader::new(
                [nx, ny, nz],
                [
                    sim.output_pixel_width as f32,
                    sim.output_pixel_width as f32,
                    sim.output_slice_width as f32,
                ],
            );
            tdt_nifti::write(&out_path, &header, VoxelData::F32(calibrated.view()))?;
            recon_paths.push(out_path);
        }

        // attenuation map as NIfTI, written once
        let atn_img_path = recon_dir.join(format!("{prefix}_atn_img.nii"));
        if !atn_img_path.exists() {
            let (nz, ny, nx) = attenuation.dim();
            let header = NiftiHeader::new(
                [nx, ny, nz],
                [
                    sim.output_pixel_width as f32,
                    sim.output_pixel_width as f32,
                    sim.output_slice_width as f32,
                ],
            );
            tdt_nifti::write(&atn_img_path, &header, VoxelData::F32(attenuation.view()))?;
        }

        assign(&mut context.recon_paths, "recon_paths", recon_paths);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_values_parsed_case_insensitively() {
        let text = "!INTERFILE :=\n!matrix size [1] := 128\n;energy window lower level := 187.2\ntotal number of images := 64\n";
        assert_eq!(header_value(text, "matrix size [1]").unwrap(), "128");
        assert_eq!(header_value(text, "Total Number of Images").unwrap(), "64");
        assert!(header_value(text, "absent key").is_none());
    }

    #[test]
    fn energy_window_width_from_levels() {
        let text = ";energy window lower level := 187.2\n;energy window upper level := 228.8\n";
        let ww = energy_window_width(text, Path::new("w.h00")).unwrap();
        assert!((ww - 41.6).abs() < 1e-9);
    }

    #[test]
    fn sensitivity_parsed_by_key() {
        let text = "header line\nSome other value: 3\n Sensitivity Cps/MBq : 85.4 counts\ntrailing\n";
        let s = parse_sensitivity(text, Path::new("calib.res")).unwrap();
        assert!((s - 85.4).abs() < 1e-9);
    }

    #[test]
    fn sensitivity_missing_fails() {
        assert!(matches!(
            parse_sensitivity("no such key here", Path::new("calib.res")),
            Err(PipelineError::CalibrationParseFailed(_))
        ));
    }

    #[test]
    fn projection_reshape_flips_and_transposes() {
        // one projection, 2x3 (dim1=3, dim2=2): flat row-major (proj, y, x)
        let flat = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let arr = reshape_projections(flat, 3, 2, 1, Path::new("p.a00")).unwrap();
        assert_eq!(arr.dim(), (1, 3, 2));
        // original y=0 row [1,2,3] moves to y=1 after the flip, then the
        // transpose makes it the second column
        assert_eq!(arr[[0, 0, 1]], 1.0);
        assert_eq!(arr[[0, 1, 1]], 2.0);
        assert_eq!(arr[[0, 2, 1]], 3.0);
        assert_eq!(arr[[0, 0, 0]], 4.0);
    }

    #[test]
    fn projection_size_checked() {
        let err = reshape_projections(vec![0.0; 5], 3, 2, 1, Path::new("p.a00")).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn tew_scatter_formula() {
        let lower = ndarray::arr3(&[[[10.0f32]]]);
        let upper = ndarray::arr3(&[[[20.0f32]]]);
        let s = tew_scatter(&lower, &upper, 5.0, 10.0, 4.0);
        // (10/5 + 20/10) * 4/2 = 8
        assert!((s[[0, 0, 0]] - 8.0).abs() < 1e-6);
    }

    #[test]
    fn poisson_zero_stays_zero() {
        let mut rng = StdRng::seed_from_u64(0);
        let arr = ndarray::arr3(&[[[0.0f32, 1000.0]]]);
        let out = poisson_realization(&mut rng, &arr);
        assert_eq!(out[[0, 0, 0]], 0.0);
        // a high-rate bin stays in a plausible range
        assert!(out[[0, 0, 1]] > 800.0 && out[[0, 0, 1]] < 1200.0);
    }

    #[test]
    fn calibration_conversion() {
        let recon = ndarray::arr3(&[[[100.0f32]]]);
        let img = counts_to_mbq_per_ml(&recon, 10.0, 600.0, 0.5, 0.4);
        // 100 / 10 / 600 / 0.25 / 0.4
        let expected = 100.0 / 10.0 / 600.0 / 0.25 / 0.4;
        assert!((img[[0, 0, 0]] as f64 - expected).abs() < 1e-9);
    }

    #[test]
    fn cor_two_column_files_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.cor");
        std::fs::write(&path, "1.5 9.0\n2.5 9.0\n").unwrap();
        let values = load_cor(&path).unwrap();
        assert_eq!(values, vec![1.5, 2.5]);
        // rewritten single-column
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "1.5\n2.5\n");
        // second load is a no-op
        assert_eq!(load_cor(&path).unwrap(), vec![1.5, 2.5]);
    }

    #[test]
    fn attenuation_loaded_via_hct() {
        let dir = tempfile::tempdir().unwrap();
        let hct = dir.path().join("sim.hct");
        std::fs::write(
            &hct,
            "!matrix size [1] := 2\n!matrix size [2] := 2\n!matrix size [3] := 1\n!name of data file := sim.ict\n",
        )
        .unwrap();
        blob::write_f32_slice(dir.path().join("sim.ict"), &[1.0, 2.0, 3.0, 4.0]).unwrap();

        let amap = load_attenuation(&hct).unwrap();
        assert_eq!(amap.dim(), (1, 2, 2));
        assert_eq!(amap[[0, 0, 0]], 1.0);
        assert_eq!(amap[[0, 1, 1]], 4.0);
    }
}
