//! Organ segmentation stage: standardizes the CT to NIfTI and drives the
//! external segmenter once per required task.

use std::path::{Path, PathBuf};

use tdt_common::labels::{SegTask, TdtRoi};
use tdt_nifti::{NiftiImage, VoxelData};
use tracing::{debug, info};

use crate::config::Config;
use crate::context::{Context, SegPlan, assign};
use crate::dicom_ct;
use crate::driver::{CtInputKind, CtWorkspace};
use crate::error::{PipelineError, Result};
use crate::external::OrganSegmenter;

/// Validates the user's ROI subset and derives the task execution plan.
///
/// `run_body` is always set when any ROI is requested; the other tasks run
/// only when a requested ROI expands into them. Expanded class names keep
/// the request order, deduplicated.
pub fn build_plan(roi_subset: &[String]) -> Result<SegPlan> {
    let names: Vec<&str> = roi_subset
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if names.is_empty() {
        return Err(PipelineError::Config(format!(
            "roi_subset must contain at least one ROI from: {:?}",
            TdtRoi::requestable_names()
        )));
    }

    let mut rois = Vec::new();
    let mut invalid = Vec::new();
    for name in &names {
        match TdtRoi::from_name(name) {
            Some(roi) if TdtRoi::REQUESTABLE.contains(&roi) => {
                if !rois.contains(&roi) {
                    rois.push(roi);
                }
            }
            _ => invalid.push(name.to_string()),
        }
    }
    if !invalid.is_empty() {
        return Err(PipelineError::InvalidRoi {
            invalid,
            allowed: TdtRoi::requestable_names(),
        });
    }

    let mut total_roi_subset = Vec::new();
    let mut head_roi_subset = Vec::new();
    for roi in &rois {
        let target = match roi.task() {
            Some(SegTask::Total) => &mut total_roi_subset,
            Some(SegTask::HeadGlandsCavities) => &mut head_roi_subset,
            _ => continue,
        };
        for name in roi.expanded_names() {
            if !target.iter().any(|n| n == name) {
                target.push(name.to_string());
            }
        }
    }

    Ok(SegPlan {
        run_body: true,
        run_total: !total_roi_subset.is_empty(),
        run_head_glands_cavities: !head_roi_subset.is_empty(),
        total_roi_subset,
        head_roi_subset,
        tdt_roi_subset: rois,
    })
}

pub struct SegmentationStage<'a> {
    config: &'a Config,
    workspace: &'a CtWorkspace,
    segmenter: &'a dyn OrganSegmenter,
}

impl<'a> SegmentationStage<'a> {
    pub fn new(
        config: &'a Config,
        workspace: &'a CtWorkspace,
        segmenter: &'a dyn OrganSegmenter,
    ) -> Self {
        Self {
            config,
            workspace,
            segmenter,
        }
    }

    fn output_dir(&self) -> PathBuf {
        self.workspace.subdir(self.config, "spect_preprocessing")
    }

    fn prefix(&self) -> &str {
        &self.config.spect_preprocessing.name
    }

    /// Rewrites the CT input as the canonical `<prefix>_ct.nii.gz`.
    /// Idempotent: an existing standardized CT is trusted.
    fn standardize_ct(&self, ct_nii_path: &Path) -> Result<()> {
        if ct_nii_path.exists() {
            debug!("Standardized CT already exists: {}", ct_nii_path.display());
            return Ok(());
        }
        match self.workspace.kind {
            CtInputKind::Dicom => {
                dicom_ct::convert_series_to_nifti(&self.workspace.ct_input, ct_nii_path)
            }
            CtInputKind::Nifti => {
                let img = NiftiImage::read(&self.workspace.ct_input)?;
                tdt_nifti::write(ct_nii_path, &img.header, VoxelData::F32(img.data.view()))?;
                Ok(())
            }
        }
    }

    pub fn run(&self, context: &mut Context) -> Result<()> {
        let output_dir = self.output_dir();
        std::fs::create_dir_all(&output_dir)?;
        let prefix = self.prefix();

        let ct_nii_path = output_dir.join(format!("{prefix}_ct.nii.gz"));
        self.standardize_ct(&ct_nii_path)?;

        let plan = build_plan(&self.config.spect_preprocessing.roi_subset)?;

        let body_ml_path = output_dir.join(format!("{prefix}_body_ml.nii.gz"));
        let total_ml_path = output_dir.join(format!("{prefix}_total_ml.nii.gz"));
        let head_ml_path = output_dir.join(format!("{prefix}_head_glands_cavities_ml.nii.gz"));

        // existing task outputs are trusted and never overwritten
        if plan.run_body && !body_ml_path.exists() {
            info!("Running segmentation task: body");
            self.segmenter
                .segment(&ct_nii_path, &body_ml_path, SegTask::Body, &[])?;
        }
        if plan.run_total && !total_ml_path.exists() {
            info!("Running segmentation task: total");
            self.segmenter.segment(
                &ct_nii_path,
                &total_ml_path,
                SegTask::Total,
                &plan.total_roi_subset,
            )?;
        }
        if plan.run_head_glands_cavities && !head_ml_path.exists() {
            info!("Running segmentation task: head_glands_cavities");
            self.segmenter.segment(
                &ct_nii_path,
                &head_ml_path,
                SegTask::HeadGlandsCavities,
                &[],
            )?;
        }

        // every enabled task must have produced its output
        let checks: [(bool, &'static str, &PathBuf); 3] = [
            (plan.run_body, "body", &body_ml_path),
            (plan.run_total, "total", &total_ml_path),
            (
                plan.run_head_glands_cavities,
                "head_glands_cavities",
                &head_ml_path,
            ),
        ];
        for (enabled, task, path) in checks {
            if enabled && !path.exists() {
                return Err(PipelineError::SegmentationMissingOutput {
                    task,
                    path: path.clone(),
                });
            }
        }

        assign(&mut context.ct_nii_path, "ct_nii_path", ct_nii_path);
        assign(&mut context.body_ml_path, "body_ml_path", body_ml_path);
        if plan.run_total {
            assign(&mut context.total_ml_path, "total_ml_path", total_ml_path);
        }
        if plan.run_head_glands_cavities {
            assign(
                &mut context.head_glands_cavities_ml_path,
                "head_glands_cavities_ml_path",
                head_ml_path,
            );
        }
        assign(
            &mut context.roi_subset,
            "roi_subset",
            plan.tdt_roi_subset.clone(),
        );
        assign(&mut context.totseg_plan, "totseg_plan", plan);
        Ok(())
    }
}
