//! SIMIND simulation stage: per-organ Monte Carlo fan-out across CPU
//! cores, per-organ averaging, linear recombination into per-frame
//! projection totals, and the one-shot Jaszczak sensitivity calibration.
//!
//! Child processes communicate strictly via the filesystem. The simulator
//! environment (`SMC_DIR`, `PATH`) is passed as explicit child-process
//! overrides; the parent environment is never mutated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tdt_common::blob;
use tdt_common::labels::TdtRoi;
use tracing::{debug, info};

use crate::config::{Config, Mode};
use crate::context::{Context, assign, need};
use crate::driver::CtWorkspace;
use crate::error::{PipelineError, Result};
use crate::stages::fmt_minutes;

/// Photon budget scale for one organ and one core. The per-organ budgets
/// are proportional to the organ's share of the first-frame activity, so
/// the recombined projections scale with the total activity.
pub(crate) fn organ_scale_factor(
    num_photons: f64,
    organ_sum_frame0: f64,
    map_sum_frame0: f64,
    num_cores: usize,
) -> f64 {
    let ratio = organ_sum_frame0 / map_sum_frame0;
    num_photons * ratio / map_sum_frame0 / num_cores as f64
}

/// Geometry of one simulator invocation, mapped onto positional switches.
pub(crate) struct SimindGeometry {
    pub input_half_length_cm: f64,
    pub input_pixel_width_cm: f64,
    pub input_slice_width_cm: f64,
    pub detector_length_cm: f64,
    pub detector_width_cm: f64,
    pub output_img_length: f64,
    pub shape_zyx: [usize; 3],
}

impl SimindGeometry {
    pub(crate) fn derive(config: &Config, shape_zyx: [usize; 3], spacing_cm_zyx: [f64; 3]) -> Self {
        let sim = &config.spect_simulation;
        let input_slice_width_cm = spacing_cm_zyx[0];
        let input_pixel_width_cm = spacing_cm_zyx[1];
        let ct_length_cm = shape_zyx[0] as f64 * input_slice_width_cm;
        // DetectorLength == 0 is the "use the CT length" sentinel
        let detector_length_cm = if sim.detector_length == 0.0 {
            ct_length_cm
        } else {
            sim.detector_length
        };
        Self {
            input_half_length_cm: ct_length_cm / 2.0,
            input_pixel_width_cm,
            input_slice_width_cm,
            detector_length_cm,
            detector_width_cm: sim.detector_width,
            output_img_length: ct_length_cm / sim.output_slice_width,
            shape_zyx,
        }
    }
}

pub(crate) fn build_switches(
    config: &Config,
    geometry: &SimindGeometry,
    atn_name: &str,
    act_name: &str,
    scale_factor: f64,
) -> String {
    let sim = &config.spect_simulation;
    format!(
        "/fd:{atn}/fs:{act}/in:x22,3x/nn:{nn}/cc:{cc}/fi:{fi}\
         /02:{half}/05:{half}/08:{dl:.2}/10:{dw:.2}/14:-7/15:-7\
         /20:{ew}/21:{ew}/28:{opw}/29:{np}/31:{ipw}/34:{nz}\
         /42:{dd}/76:{ois}/77:{oil}/78:{ny}/79:{nx}",
        atn = atn_name,
        act = act_name,
        nn = scale_factor,
        cc = sim.collimator,
        fi = sim.isotope,
        half = geometry.input_half_length_cm,
        dl = geometry.detector_length_cm,
        dw = geometry.detector_width_cm,
        ew = -sim.energy_window_width,
        opw = sim.output_pixel_width,
        np = sim.num_projections,
        ipw = geometry.input_pixel_width_cm,
        nz = geometry.shape_zyx[0],
        dd = sim.detector_distance,
        ois = sim.output_img_size,
        oil = geometry.output_img_length,
        ny = geometry.shape_zyx[1],
        nx = geometry.shape_zyx[2],
    )
}

fn organ_total_path(output_dir: &Path, prefix: &str, organ: &str, window: usize) -> PathBuf {
    output_dir.join(format!("{prefix}_{organ}_tot_w{window}.a00"))
}

fn frame_total_path(output_dir: &Path, prefix: &str, minutes: &str, window: usize) -> PathBuf {
    output_dir.join(format!("{prefix}_{minutes}min_tot_w{window}.a00"))
}

fn organ_totals_exist(output_dir: &Path, prefix: &str, organ: &str) -> bool {
    (1..=3).all(|w| organ_total_path(output_dir, prefix, organ, w).exists())
}

/// Sums the per-core window totals of one organ, divides by the core
/// count and writes one aggregate per window. With `cleanup` the per-core
/// `.a00` files are removed afterwards (headers stay for reconstruction).
pub(crate) fn aggregate_core_totals(
    work_dir: &Path,
    output_dir: &Path,
    prefix: &str,
    organ: &str,
    num_cores: usize,
    cleanup: bool,
) -> Result<()> {
    for window in 1..=3 {
        let mut total: Option<Vec<f32>> = None;
        for core in 0..num_cores {
            let path = work_dir.join(format!("{prefix}_{organ}_{core}_tot_w{window}.a00"));
            if !path.exists() {
                return Err(PipelineError::SimulatorProcessFailed(format!(
                    "expected output missing: {}",
                    path.display()
                )));
            }
            let values = blob::read_f32_vec(&path)?;
            match &mut total {
                None => total = Some(values),
                Some(acc) => {
                    if acc.len() != values.len() {
                        return Err(PipelineError::SimulatorProcessFailed(format!(
                            "core outputs disagree in size for {}",
                            path.display()
                        )));
                    }
                    for (a, v) in acc.iter_mut().zip(values) {
                        *a += v;
                    }
                }
            }
        }
        let mut total = total.expect("at least one core");
        for v in &mut total {
            *v /= num_cores as f32;
        }
        blob::write_f32_slice(organ_total_path(output_dir, prefix, organ, window), &total)?;
    }

    if cleanup {
        for window in 1..=3 {
            for core in 0..num_cores {
                let path = work_dir.join(format!("{prefix}_{organ}_{core}_tot_w{window}.a00"));
                let _ = std::fs::remove_file(path);
            }
        }
    }
    Ok(())
}

/// Recombines the per-organ aggregates into per-frame totals:
/// `frame[t] = sum_organ organ * activity[organ][t] * duration[t]`.
pub(crate) fn combine_organs_into_frame_totals(
    output_dir: &Path,
    prefix: &str,
    activity_organ_sum: &BTreeMap<TdtRoi, Vec<f64>>,
    frame_starts: &[f64],
    frame_durations: &[f64],
) -> Result<()> {
    for (frame, start) in frame_starts.iter().enumerate() {
        let minutes = fmt_minutes(*start);
        for window in 1..=3 {
            let mut total: Option<Vec<f32>> = None;
            for (roi, organ_sum) in activity_organ_sum {
                let values =
                    blob::read_f32_vec(organ_total_path(output_dir, prefix, roi.name(), window))?;
                let weight = (organ_sum[frame] * frame_durations[frame]) as f32;
                match &mut total {
                    None => {
                        total = Some(values.iter().map(|v| v * weight).collect());
                    }
                    Some(acc) => {
                        if acc.len() != values.len() {
                            return Err(PipelineError::SimulatorProcessFailed(format!(
                                "organ totals disagree in size for window {window}"
                            )));
                        }
                        for (a, v) in acc.iter_mut().zip(values) {
                            *a += v * weight;
                        }
                    }
                }
            }
            let total = total.ok_or_else(|| {
                PipelineError::SimulatorProcessFailed("no organ totals to combine".into())
            })?;
            blob::write_f32_slice(
                frame_total_path(output_dir, prefix, &minutes, window),
                &total,
            )?;
        }
    }
    Ok(())
}

pub struct SimindStage<'a> {
    config: &'a Config,
    workspace: &'a CtWorkspace,
    mode: Mode,
}

impl<'a> SimindStage<'a> {
    pub fn new(config: &'a Config, workspace: &'a CtWorkspace, mode: Mode) -> Self {
        Self {
            config,
            workspace,
            mode,
        }
    }

    fn num_cores(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self.config.spect_simulation.num_cores {
            Some(n) if (1..=available).contains(&n) => n,
            _ => available,
        }
    }

    fn simind_exe(&self) -> PathBuf {
        self.config.spect_simulation.simind_directory.join("simind")
    }

    /// Child-process environment: the simulator needs `SMC_DIR` and its
    /// own directory on `PATH`.
    fn simulator_command(&self, cwd: &Path) -> Command {
        let simind_dir = &self.config.spect_simulation.simind_directory;
        let path = match std::env::var_os("PATH") {
            Some(existing) => {
                let mut joined = simind_dir.as_os_str().to_os_string();
                joined.push(":");
                joined.push(existing);
                joined
            }
            None => simind_dir.as_os_str().to_os_string(),
        };
        let mut cmd = Command::new(self.simind_exe());
        cmd.current_dir(cwd)
            .env("SMC_DIR", simind_dir.join("smc_dir/"))
            .env("PATH", path);
        cmd
    }

    fn copy_template(&self, name: &str, dest: &Path) -> Result<()> {
        let src = self.config.spect_simulation.simind_directory.join(name);
        std::fs::copy(&src, dest).map_err(|e| {
            PipelineError::SimulatorProcessFailed(format!(
                "unable to copy template {}: {e}",
                src.display()
            ))
        })?;
        Ok(())
    }

    fn run_simind_for_organ_cores(
        &self,
        work_dir: &Path,
        organ: &str,
        switches: &str,
        num_cores: usize,
    ) -> Result<()> {
        let prefix = &self.config.spect_simulation.name;
        let mut children = Vec::with_capacity(num_cores);
        for core in 0..num_cores {
            let mut cmd = self.simulator_command(work_dir);
            cmd.arg(prefix)
                .arg(format!("{prefix}_{organ}_{core}"))
                .arg(format!("{switches}/rr:{core}"));
            // only the first core inherits stdout; the rest stay silent
            if core > 0 {
                cmd.stdout(Stdio::null());
            }
            let child = cmd.spawn().map_err(|e| {
                PipelineError::SimulatorProcessFailed(format!(
                    "unable to spawn {}: {e}",
                    self.simind_exe().display()
                ))
            })?;
            children.push((core, child));
        }

        for (core, mut child) in children {
            let status = child.wait()?;
            if !status.success() {
                return Err(PipelineError::SimulatorProcessFailed(format!(
                    "organ '{organ}' core {core} exited with {status}"
                )));
            }
        }
        Ok(())
    }

    fn run_jaszczak_calibration(&self, output_dir: &Path) -> Result<()> {
        if output_dir.join("calib.res").exists() {
            debug!("Calibration already present; skipping.");
            return Ok(());
        }
        self.copy_template("jaszak.smc", &output_dir.join("jaszak.smc"))?;

        let sim = &self.config.spect_simulation;
        let switches = format!(
            "calib/fi:{}/cc:{}/29:1/15:5/fa:11/fa:15/fa:14",
            sim.isotope, sim.collimator
        );
        info!("Running Jaszczak calibration");
        let status = self
            .simulator_command(output_dir)
            .arg("jaszak")
            .arg(switches)
            .stdout(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(PipelineError::SimulatorProcessFailed(format!(
                "calibration exited with {status}"
            )));
        }
        Ok(())
    }

    pub fn run(&self, context: &mut Context) -> Result<()> {
        context.require(&[
            "class_seg",
            "roi_body_seg_arr",
            "activity_organ_sum",
            "activity_map_sum",
            "grid",
            "activity_map_paths_by_organ",
            "atn_av_path",
        ])?;
        let grid = *need(&context.grid, "grid")?;
        let activity_organ_sum = need(&context.activity_organ_sum, "activity_organ_sum")?.clone();
        let activity_map_sum = need(&context.activity_map_sum, "activity_map_sum")?.clone();
        let organ_paths = need(
            &context.activity_map_paths_by_organ,
            "activity_map_paths_by_organ",
        )?
        .clone();
        let atn_av_path = need(&context.atn_av_path, "atn_av_path")?.clone();

        if !atn_av_path.exists() {
            return Err(PipelineError::SimulatorProcessFailed(format!(
                "attenuation map not found: {}",
                atn_av_path.display()
            )));
        }

        let output_dir = self.workspace.subdir(self.config, "spect_simulation");
        let work_dir = output_dir.join("simind_work");
        std::fs::create_dir_all(&work_dir)?;

        let prefix = &self.config.spect_simulation.name;
        let num_cores = self.num_cores();
        let geometry = SimindGeometry::derive(self.config, grid.shape_zyx, grid.spacing_cm_zyx);

        self.copy_template("smc.smc", &work_dir.join(format!("{prefix}.smc")))?;
        self.copy_template("scattwin.win", &work_dir.join(format!("{prefix}.win")))?;

        let atn_name = atn_av_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PipelineError::SimulatorProcessFailed("attenuation path has no file name".into())
            })?
            .to_string();
        let atn_work = work_dir.join(&atn_name);
        if !atn_work.exists() {
            std::fs::copy(&atn_av_path, &atn_work)?;
        }

        for (roi, act_path) in &organ_paths {
            let organ = roi.name();
            if organ_totals_exist(&output_dir, prefix, organ) {
                debug!("Organ totals already present for '{organ}'; skipping simulation.");
                continue;
            }
            if !act_path.exists() {
                return Err(PipelineError::SimulatorProcessFailed(format!(
                    "activity map not found: {}",
                    act_path.display()
                )));
            }

            let organ_sum = activity_organ_sum.get(roi).ok_or_else(|| {
                PipelineError::SimulatorProcessFailed(format!("no activity totals for '{organ}'"))
            })?;
            let scale_factor = organ_scale_factor(
                self.config.spect_simulation.num_photons,
                organ_sum[0],
                activity_map_sum[0],
                num_cores,
            );

            let act_name = act_path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    PipelineError::SimulatorProcessFailed("activity path has no file name".into())
                })?
                .to_string();
            std::fs::copy(act_path, work_dir.join(&act_name))?;

            let switches =
                build_switches(self.config, &geometry, &atn_name, &act_name, scale_factor);
            info!("Simulating organ '{organ}' on {num_cores} core(s)");
            self.run_simind_for_organ_cores(&work_dir, organ, &switches, num_cores)?;
            aggregate_core_totals(
                &work_dir,
                &output_dir,
                prefix,
                organ,
                num_cores,
                self.mode == Mode::Production,
            )?;
        }

        let frame_starts = &self.config.pbpk.frame_start_times;
        let all_frames_exist = frame_starts.iter().all(|t| {
            (1..=3).all(|w| frame_total_path(&output_dir, prefix, &fmt_minutes(*t), w).exists())
        });
        if !all_frames_exist {
            combine_organs_into_frame_totals(
                &output_dir,
                prefix,
                &activity_organ_sum,
                frame_starts,
                &self.config.pbpk.frame_durations,
            )?;
        }

        self.run_jaszczak_calibration(&output_dir)?;

        assign(
            &mut context.spect_sim_output_dir,
            "spect_sim_output_dir",
            output_dir,
        );
        assign(&mut context.simind_work_dir, "simind_work_dir", work_dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;

    #[test]
    fn scale_factor_proportional_to_organ_share() {
        // organ holds a quarter of the activity, 2 cores
        let s = organ_scale_factor(1e7, 25.0, 100.0, 2);
        assert!((s - 1e7 * 0.25 / 100.0 / 2.0).abs() < 1e-9);
        // the shares of all organs sum to photons / map_sum / cores
        let organs = [25.0, 55.0, 20.0];
        let total: f64 = organs
            .iter()
            .map(|&o| organ_scale_factor(1e7, o, 100.0, 2))
            .sum();
        assert!((total - 1e7 / 100.0 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn switches_carry_geometry() {
        let config = Config::from_json_str(SAMPLE).unwrap();
        let geometry = SimindGeometry::derive(&config, [64, 128, 128], [0.3, 0.15, 0.15]);
        // DetectorLength = 0 in SAMPLE: falls back to CT length
        assert!((geometry.detector_length_cm - 64.0 * 0.3).abs() < 1e-9);
        assert!((geometry.input_half_length_cm - 9.6).abs() < 1e-9);
        assert!((geometry.output_img_length - 19.2 / 0.48).abs() < 1e-9);

        let s = build_switches(&config, &geometry, "atn.bin", "act.bin", 0.5);
        assert!(s.starts_with("/fd:atn.bin/fs:act.bin/in:x22,3x/nn:0.5"));
        assert!(s.contains("/cc:me-legp"));
        assert!(s.contains("/fi:lu177"));
        assert!(s.contains("/29:64"));
        assert!(s.contains("/34:64"));
        assert!(s.contains("/78:128"));
        assert!(s.contains("/79:128"));
        assert!(s.contains("/20:-20"));
        assert!(s.contains("/42:15"));
    }

    #[test]
    fn explicit_detector_length_respected() {
        let text = SAMPLE.replace("\"DetectorLength\": 0", "\"DetectorLength\": 55.5");
        let config = Config::from_json_str(&text).unwrap();
        let geometry = SimindGeometry::derive(&config, [64, 128, 128], [0.3, 0.15, 0.15]);
        assert!((geometry.detector_length_cm - 55.5).abs() < 1e-9);
    }

    #[test]
    fn core_aggregation_averages() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::create_dir_all(&out).unwrap();

        for window in 1..=3 {
            for core in 0..2 {
                let values = vec![(core as f32 + 1.0) * window as f32; 4];
                blob::write_f32_slice(
                    work.join(format!("sim_kidney_{core}_tot_w{window}.a00")),
                    &values,
                )
                .unwrap();
            }
        }

        aggregate_core_totals(&work, &out, "sim", "kidney", 2, true).unwrap();

        for window in 1..=3 {
            let agg =
                blob::read_f32_vec(out.join(format!("sim_kidney_tot_w{window}.a00"))).unwrap();
            // mean of w and 2w is 1.5 w
            assert!(agg.iter().all(|&v| (v - 1.5 * window as f32).abs() < 1e-6));
            // cleanup removed the per-core files
            assert!(!work.join(format!("sim_kidney_0_tot_w{window}.a00")).exists());
        }
    }

    #[test]
    fn aggregation_fails_on_missing_core_output() {
        let dir = tempfile::tempdir().unwrap();
        blob::write_f32_slice(dir.path().join("sim_liver_0_tot_w1.a00"), &[1.0]).unwrap();
        let err =
            aggregate_core_totals(dir.path(), dir.path(), "sim", "liver", 2, false).unwrap_err();
        assert!(matches!(err, PipelineError::SimulatorProcessFailed(_)));
    }

    #[test]
    fn frame_recombination_weights_by_activity_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path();

        // two organs with flat unit projections
        for organ in ["body", "kidney"] {
            for window in 1..=3 {
                blob::write_f32_slice(
                    out.join(format!("sim_{organ}_tot_w{window}.a00")),
                    &[1.0, 1.0],
                )
                .unwrap();
            }
        }

        let activity = BTreeMap::from([
            (TdtRoi::Body, vec![100.0, 50.0]),
            (TdtRoi::Kidney, vec![10.0, 5.0]),
        ]);
        let starts = [240.0, 1440.0];
        let durations = [600.0, 300.0];

        combine_organs_into_frame_totals(out, "sim", &activity, &starts, &durations).unwrap();

        let w1_240 = blob::read_f32_vec(out.join("sim_240min_tot_w1.a00")).unwrap();
        let expected0 = (100.0 + 10.0) * 600.0;
        assert!(w1_240.iter().all(|&v| (v - expected0 as f32).abs() < 1.0));

        let w2_1440 = blob::read_f32_vec(out.join("sim_1440min_tot_w2.a00")).unwrap();
        let expected1 = (50.0 + 5.0) * 300.0;
        assert!(w2_1440.iter().all(|&v| (v - expected1 as f32).abs() < 1.0));
    }
}
