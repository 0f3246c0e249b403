//! ROI unification stage: combines the per-task segmenter outputs into a
//! single multilabel volume in canonical TDT label space, aligned to the
//! standardized CT.

use ndarray::Array3;
use tdt_common::labels::{LabelMapRegistry, SegTask, TdtRoi};
use tdt_nifti::{NiftiImage, VoxelData};
use tracing::info;

use crate::config::Config;
use crate::context::{Context, SegPlan, assign, need};
use crate::driver::CtWorkspace;
use crate::error::{PipelineError, Result};

fn check_shape(what: &str, a: [usize; 3], b: [usize; 3]) -> Result<()> {
    if a != b {
        return Err(PipelineError::ShapeMismatch {
            what: what.to_string(),
            a: a.to_vec(),
            b: b.to_vec(),
        });
    }
    Ok(())
}

/// Paints the unified volume. Body is painted first, then organs, so organ
/// voxels override body; this tie-break is what downstream stages rely on.
pub(crate) fn paint_unified(
    body: &Array3<f32>,
    total: Option<&Array3<f32>>,
    head: Option<&Array3<f32>>,
    plan: &SegPlan,
    registry: &LabelMapRegistry,
) -> Result<Array3<u8>> {
    let mut unified = Array3::<u8>::zeros(body.raw_dim());

    let body_id = registry.tdt_id(TdtRoi::Body)?;
    ndarray::Zip::from(&mut unified).and(body).for_each(|u, &b| {
        if b > 0.0 {
            *u = body_id;
        }
    });

    for roi in &plan.tdt_roi_subset {
        match roi.task() {
            Some(SegTask::Total) => {
                let Some(total) = total else { continue };
                let tdt_id = registry.tdt_id(*roi)?;
                let ids: Vec<i32> = roi
                    .expanded_names()
                    .iter()
                    .map(|&n| registry.total_id(n).map(i32::from))
                    .collect::<std::result::Result<_, _>>()?;
                ndarray::Zip::from(&mut unified).and(total).for_each(|u, &t| {
                    if ids.contains(&(t.round() as i32)) {
                        *u = tdt_id;
                    }
                });
            }
            Some(SegTask::HeadGlandsCavities) => {
                let Some(head) = head else { continue };
                let tdt_id = registry.tdt_id(*roi)?;
                let ids: Vec<i32> = roi
                    .expanded_names()
                    .iter()
                    .map(|&n| registry.head_id(n).map(i32::from))
                    .collect::<std::result::Result<_, _>>()?;
                ndarray::Zip::from(&mut unified).and(head).for_each(|u, &h| {
                    if ids.contains(&(h.round() as i32)) {
                        *u = tdt_id;
                    }
                });
            }
            _ => {}
        }
    }

    Ok(unified)
}

pub struct UnifyStage<'a> {
    config: &'a Config,
    workspace: &'a CtWorkspace,
    registry: &'a LabelMapRegistry,
}

impl<'a> UnifyStage<'a> {
    pub fn new(
        config: &'a Config,
        workspace: &'a CtWorkspace,
        registry: &'a LabelMapRegistry,
    ) -> Self {
        Self {
            config,
            workspace,
            registry,
        }
    }

    pub fn run(&self, context: &mut Context) -> Result<()> {
        context.require(&["ct_nii_path", "body_ml_path", "totseg_plan"])?;
        let plan = need(&context.totseg_plan, "totseg_plan")?.clone();

        let ct = NiftiImage::read(need(&context.ct_nii_path, "ct_nii_path")?)?;
        let body = NiftiImage::read(need(&context.body_ml_path, "body_ml_path")?)?;
        check_shape("body vs ct", body.shape_zyx(), ct.shape_zyx())?;

        let total = if plan.run_total {
            let img = NiftiImage::read(need(&context.total_ml_path, "total_ml_path")?)?;
            check_shape("total vs ct", img.shape_zyx(), ct.shape_zyx())?;
            Some(img)
        } else {
            None
        };
        let head = if plan.run_head_glands_cavities {
            let img = NiftiImage::read(need(
                &context.head_glands_cavities_ml_path,
                "head_glands_cavities_ml_path",
            )?)?;
            check_shape("head_glands_cavities vs ct", img.shape_zyx(), ct.shape_zyx())?;
            Some(img)
        } else {
            None
        };

        let unified = paint_unified(
            &body.data,
            total.as_ref().map(|i| &i.data),
            head.as_ref().map(|i| &i.data),
            &plan,
            self.registry,
        )?;

        let output_dir = self.workspace.subdir(self.config, "spect_preprocessing");
        std::fs::create_dir_all(&output_dir)?;
        let prefix = &self.config.spect_preprocessing.name;
        let out_path = output_dir.join(format!("{prefix}_tdt_roi_seg.nii.gz"));
        tdt_nifti::write(&out_path, &ct.header, VoxelData::U8(unified.view()))?;
        info!("Unified ROI segmentation written: {}", out_path.display());

        assign(&mut context.tdt_roi_seg_path, "tdt_roi_seg_path", out_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::segmentation::build_plan;

    const MAP: &str = r#"
    {
        "total": {"1": "spleen", "2": "kidney_right", "3": "kidney_left", "5": "liver",
                  "51": "heart", "57": "prostate"},
        "head_glands_cavities": {"5": "parotid_gland_right", "6": "parotid_gland_left",
                                 "9": "submandibular_gland_right", "10": "submandibular_gland_left"},
        "TDT_Pipeline": {"0": "background", "1": "body", "2": "kidney", "3": "liver",
                         "4": "prostate", "5": "spleen", "6": "heart", "7": "salivary_glands",
                         "8": "synthetic_lesion"}
    }
    "#;

    fn registry() -> LabelMapRegistry {
        LabelMapRegistry::from_json_str(MAP).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn organs_override_body() {
        let registry = registry();
        let plan = build_plan(&names(&["body", "kidney", "liver"])).unwrap();

        let mut body = Array3::<f32>::zeros((1, 4, 4));
        body.fill(1.0);
        let mut total = Array3::<f32>::zeros((1, 4, 4));
        total[[0, 0, 0]] = 3.0; // kidney_left
        total[[0, 0, 1]] = 2.0; // kidney_right
        total[[0, 1, 0]] = 5.0; // liver
        total[[0, 2, 2]] = 1.0; // spleen: not requested, stays body

        let unified = paint_unified(&body, Some(&total), None, &plan, &registry).unwrap();

        assert_eq!(unified[[0, 0, 0]], 2); // kidney
        assert_eq!(unified[[0, 0, 1]], 2); // kidney
        assert_eq!(unified[[0, 1, 0]], 3); // liver
        assert_eq!(unified[[0, 2, 2]], 1); // body (spleen not requested)
        assert_eq!(unified[[0, 3, 3]], 1); // plain body
    }

    #[test]
    fn salivary_glands_collapse_to_one_label() {
        let registry = registry();
        let plan = build_plan(&names(&["salivary_glands"])).unwrap();

        let body = Array3::<f32>::ones((1, 2, 4));
        let mut head = Array3::<f32>::zeros((1, 2, 4));
        head[[0, 0, 0]] = 5.0; // parotid right
        head[[0, 0, 1]] = 6.0; // parotid left
        head[[0, 0, 2]] = 9.0; // submandibular right
        head[[0, 0, 3]] = 10.0; // submandibular left
        head[[0, 1, 0]] = 4.0; // unrelated head class

        let unified = paint_unified(&body, None, Some(&head), &plan, &registry).unwrap();
        for x in 0..4 {
            assert_eq!(unified[[0, 0, x]], 7);
        }
        assert_eq!(unified[[0, 1, 0]], 1); // body, unrelated class ignored
    }

    #[test]
    fn labels_stay_in_canonical_set() {
        let registry = registry();
        let plan = build_plan(&names(&["body", "kidney"])).unwrap();

        let body = Array3::<f32>::ones((2, 3, 3));
        let total = Array3::<f32>::from_elem((2, 3, 3), 3.0);
        let unified = paint_unified(&body, Some(&total), None, &plan, &registry).unwrap();

        let allowed = [0u8, 1, 2];
        assert!(unified.iter().all(|l| allowed.contains(l)));
    }

    #[test]
    fn zero_background_preserved() {
        let registry = registry();
        let plan = build_plan(&names(&["body"])).unwrap();
        let mut body = Array3::<f32>::zeros((1, 2, 2));
        body[[0, 0, 0]] = 1.0;
        let unified = paint_unified(&body, None, None, &plan, &registry).unwrap();
        assert_eq!(unified[[0, 0, 0]], 1);
        assert_eq!(unified[[0, 1, 1]], 0);
    }
}
