//! PBPK stage: samples physiological parameters, runs the compartment
//! solver, and paints per-frame activity concentration maps for every ROI
//! on the simulation grid.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::Array3;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, LogNormal};
use tdt_common::{blob, interp};
use tdt_common::labels::TdtRoi;
use tracing::{debug, info};

use crate::config::Config;
use crate::context::{Context, assign, need};
use crate::dicom_ct;
use crate::driver::{CtInputKind, CtWorkspace};
use crate::error::{PipelineError, Result};
use crate::external::{TacRequest, TacSolver};
use crate::stages::fmt_minutes;

/// Kidney receptor density prior, nmol/L (mean, sd).
const RDEN_KIDNEY: (f64, f64) = (30.0, 10.0);
/// Salivary gland receptor density prior, nmol/L (mean, sd).
const RDEN_SG: (f64, f64) = (60.0, 20.0);
/// Kidney release rate prior (mean, sd).
const LAMBDA_REL_KIDNEY: (f64, f64) = (2.88e-4, 0.55e-4);
/// Salivary gland release rate prior (mean, sd).
const LAMBDA_REL_SG: (f64, f64) = (3.9e-4, 0.63e-4);

/// Draws from a lognormal parameterized so the resulting distribution has
/// the requested mean and standard deviation:
/// `sigma^2 = ln(1 + sd^2/mean^2)`, `mu = ln(mean) - sigma^2/2`.
pub(crate) fn lognormal_from_mean_sd<R: Rng>(rng: &mut R, mean: f64, sd: f64) -> Result<f64> {
    if mean <= 0.0 || sd <= 0.0 {
        return Err(PipelineError::Config(format!(
            "lognormal parameters must be > 0 (got mean={mean}, sd={sd})"
        )));
    }
    let sigma2 = (1.0 + (sd * sd) / (mean * mean)).ln();
    let mu = mean.ln() - 0.5 * sigma2;
    let dist = LogNormal::new(mu, sigma2.sqrt())
        .map_err(|e| PipelineError::Config(format!("invalid lognormal: {e}")))?;
    Ok(dist.sample(rng))
}

/// Builds the solver parameter overrides: randomized receptor densities and
/// release rates for the VOIs that are actually requested, plus patient
/// height/weight when the CT input is DICOM and carries them.
pub(crate) fn build_parameters<R: Rng>(
    config: &Config,
    workspace: &CtWorkspace,
    rng: &mut R,
) -> Result<BTreeMap<String, f64>> {
    let mut parameters = BTreeMap::new();

    if config.pbpk.randomize_kidney_sg {
        let has = |voi: &str| config.pbpk.vois.iter().any(|v| v == voi);
        if has("Kidney") {
            parameters.insert(
                "Rden_Kidney".to_string(),
                lognormal_from_mean_sd(rng, RDEN_KIDNEY.0, RDEN_KIDNEY.1)?,
            );
            parameters.insert(
                "lambdaRel_Kidney".to_string(),
                lognormal_from_mean_sd(rng, LAMBDA_REL_KIDNEY.0, LAMBDA_REL_KIDNEY.1)?,
            );
        }
        if has("SG") {
            parameters.insert(
                "Rden_SG".to_string(),
                lognormal_from_mean_sd(rng, RDEN_SG.0, RDEN_SG.1)?,
            );
            parameters.insert(
                "lambdaRel_SG".to_string(),
                lognormal_from_mean_sd(rng, LAMBDA_REL_SG.0, LAMBDA_REL_SG.1)?,
            );
        }
    }

    if workspace.kind == CtInputKind::Dicom {
        let (height, weight) = dicom_ct::extract_height_weight(&workspace.ct_input);
        if let Some(height) = height {
            parameters.insert("bodyHeight".to_string(), height);
        }
        if let Some(weight) = weight {
            parameters.insert("bodyWeight".to_string(), weight);
        }
    }

    Ok(parameters)
}

/// Resolves the compartment an ROI draws from. ROIs without an explicit
/// mapping, and mapped compartments absent from the observables, fall back
/// to `Rest`.
pub(crate) fn resolve_voi(roi: TdtRoi, observables: &[String]) -> Result<usize> {
    let has = |name: &str| observables.iter().position(|v| v == name);
    if let Some(name) = roi.voi_name() {
        if let Some(idx) = has(name) {
            return Ok(idx);
        }
    }
    has("Rest").ok_or_else(|| PipelineError::NoVoiMapping {
        roi: roi.name().to_string(),
        observables: observables.to_vec(),
    })
}

pub struct PbpkStage<'a> {
    config: &'a Config,
    workspace: &'a CtWorkspace,
    solver: &'a dyn TacSolver,
}

impl<'a> PbpkStage<'a> {
    pub fn new(
        config: &'a Config,
        workspace: &'a CtWorkspace,
        solver: &'a dyn TacSolver,
    ) -> Self {
        Self {
            config,
            workspace,
            solver,
        }
    }

    pub fn run(&self, context: &mut Context) -> Result<()> {
        context.require(&["roi_body_seg_arr", "mask_roi_body", "class_seg", "grid"])?;
        let mask_roi_body = need(&context.mask_roi_body, "mask_roi_body")?;
        let class_seg = need(&context.class_seg, "class_seg")?.clone();
        let grid = *need(&context.grid, "grid")?;

        let frame_starts = &self.config.pbpk.frame_start_times;
        let n_frames = frame_starts.len();
        let voxel_vol_ml = grid.voxel_volume_ml();

        let stop_min = frame_starts.iter().cloned().fold(0.0f64, f64::max);
        let steps = (stop_min.ceil() as usize).max(1);

        let mut rng = StdRng::from_entropy();
        let parameters = build_parameters(self.config, self.workspace, &mut rng)?;
        debug!("PBPK parameter overrides: {parameters:?}");

        let request = TacRequest {
            model: "PSMA".to_string(),
            hot_amount: self.config.pbpk.hot_amount,
            cold_amount: self.config.pbpk.cold_amount,
            parameters,
            stop_min,
            steps,
            observables: self.config.pbpk.vois.clone(),
        };
        info!("Running TAC solver (model {}, {} observables)", request.model, request.observables.len());
        let tacs = self.solver.simulate(&request)?;

        let output_dir = self.workspace.subdir(self.config, "pbpk");
        std::fs::create_dir_all(&output_dir)?;
        let prefix = &self.config.pbpk.name;

        let shape = grid.shape_zyx;
        let mut frame_maps: Vec<Array3<f32>> = (0..n_frames)
            .map(|_| Array3::zeros((shape[0], shape[1], shape[2])))
            .collect();

        let mut activity_organ_sum: BTreeMap<TdtRoi, Vec<f64>> = BTreeMap::new();
        let mut organ_paths: Vec<(TdtRoi, std::path::PathBuf)> = Vec::new();
        let mut saved_vois: BTreeSet<String> = BTreeSet::new();

        for (&roi, &label) in &class_seg {
            let voi_index = resolve_voi(roi, &request.observables)?;
            let voi_name = &request.observables[voi_index];
            let curve = &tacs.tacs_mbq[voi_index];

            let tac_interp = interp::sample(&tacs.time_min, curve, frame_starts);

            let mask = mask_roi_body.get(&label).ok_or_else(|| {
                PipelineError::MissingContextField(format!("mask for label {label}"))
            })?;
            let n_vox = mask.iter().filter(|&&m| m).count();
            if n_vox == 0 {
                return Err(PipelineError::EmptySegmentation);
            }

            // uniform concentration inside the ROI at each frame
            let conc: Vec<f32> = tac_interp
                .iter()
                .map(|a| (a / (n_vox as f64 * voxel_vol_ml)) as f32)
                .collect();

            for (frame, map) in frame_maps.iter_mut().enumerate() {
                let value = conc[frame];
                ndarray::Zip::from(map).and(mask).for_each(|v, &m| {
                    if m {
                        *v = value;
                    }
                });
            }

            // first-frame organ map for the simulator
            let organ_map =
                ndarray::Zip::from(mask).map_collect(|&m| if m { conc[0] } else { 0.0f32 });
            let organ_path = output_dir.join(format!("{prefix}_{roi}_act_av.bin"));
            blob::write_f32_volume(&organ_path, organ_map.view())?;
            organ_paths.push((roi, organ_path));

            let organ_sum: Vec<f64> = conc
                .iter()
                .map(|&c| c as f64 * n_vox as f64 * voxel_vol_ml)
                .collect();
            activity_organ_sum.insert(roi, organ_sum);

            // TAC provenance, once per VOI
            if saved_vois.insert(voi_name.clone()) {
                let as_f32 = |v: &[f64]| v.iter().map(|&x| x as f32).collect::<Vec<f32>>();
                blob::write_f32_slice(
                    output_dir.join(format!("{prefix}_{voi_name}_TAC_time.bin")),
                    &as_f32(&tacs.time_min),
                )?;
                blob::write_f32_slice(
                    output_dir.join(format!("{prefix}_{voi_name}_TAC_values.bin")),
                    &as_f32(curve),
                )?;
                blob::write_f32_slice(
                    output_dir.join(format!("{prefix}_{voi_name}_sample_times.bin")),
                    &as_f32(frame_starts),
                )?;
                blob::write_f32_slice(
                    output_dir.join(format!("{prefix}_{voi_name}_sample_values.bin")),
                    &as_f32(&tac_interp),
                )?;
            }
        }

        let mut activity_map_sum = Vec::with_capacity(n_frames);
        for (frame, map) in frame_maps.iter().enumerate() {
            let total: f64 = map.iter().map(|&v| v as f64).sum::<f64>() * voxel_vol_ml;
            activity_map_sum.push(total);

            let t = fmt_minutes(frame_starts[frame]);
            blob::write_f32_volume(
                output_dir.join(format!("{prefix}_{t}_act_av.bin")),
                map.view(),
            )?;
        }
        info!(
            "PBPK activity maps written for {} organ(s), {} frame(s)",
            organ_paths.len(),
            n_frames
        );

        assign(&mut context.activity_map_sum, "activity_map_sum", activity_map_sum);
        assign(
            &mut context.activity_organ_sum,
            "activity_organ_sum",
            activity_organ_sum,
        );
        assign(
            &mut context.activity_map_paths_by_organ,
            "activity_map_paths_by_organ",
            organ_paths,
        );
        Ok(())
    }
}
