//! Preprocessing stage: reorients and resizes CT and segmentations onto
//! the simulation grid, computes the attenuation map, and writes the
//! binary blobs the simulator consumes.

use std::collections::BTreeMap;

use ndarray::{Array3, Axis};
use tdt_common::blob;
use tdt_common::grid::SimGrid;
use tdt_common::labels::{LabelMapRegistry, TdtRoi};
use tdt_common::resample::{ZoomOrder, zoom3};
use tdt_nifti::NiftiImage;
use tracing::{debug, info};

use crate::config::Config;
use crate::context::{Context, assign, need};
use crate::driver::CtWorkspace;
use crate::error::{PipelineError, Result};

/// Linear attenuation coefficient of water at ~140 keV (1/cm).
const MU_WATER: f32 = 0.1537;
/// Linear attenuation coefficient of cortical bone at ~140 keV (1/cm).
const MU_BONE: f32 = 0.2234;

/// Brings a volume onto the simulation grid: Y-flip of the (Z, Y, X)
/// array, then an optional isotropic zoom so the in-plane dimension equals
/// `xy_dim`. Returns the array and the applied scale.
pub(crate) fn to_sim_grid(
    img: &NiftiImage,
    xy_dim: Option<usize>,
    order: ZoomOrder,
) -> Result<(Array3<f32>, f64)> {
    let mut arr = img.data.clone();
    arr.invert_axis(Axis(1));

    let Some(xy_dim) = xy_dim else {
        return Ok((arr, 1.0));
    };

    let (_, ny, nx) = arr.dim();
    if ny != nx {
        return Err(PipelineError::ShapeMismatch {
            what: "in-plane dimensions must be square before zoom".into(),
            a: vec![ny],
            b: vec![nx],
        });
    }
    let scale = xy_dim as f64 / ny as f64;
    let zoomed = zoom3(arr.view(), scale, order);
    Ok((zoomed, scale))
}

/// Bilinear HU -> linear attenuation, scaled by the effective in-plane
/// pixel size so the values are per pixel, then masked to the body.
pub(crate) fn hu_to_mu(
    hu: &Array3<f32>,
    body: &Array3<u8>,
    pixel_size_cm: f64,
) -> Array3<f32> {
    let mu_water_px = MU_WATER * pixel_size_cm as f32;
    let mu_bone_px = MU_BONE * pixel_size_cm as f32;

    ndarray::Zip::from(hu).and(body).map_collect(|&hu, &b| {
        if b == 0 {
            return 0.0;
        }
        if hu <= 0.0 {
            mu_water_px * (1.0 + hu / 1000.0)
        } else {
            mu_water_px + (hu / 1000.0) * (mu_bone_px - mu_water_px)
        }
    })
}

/// Per-label boolean masks for every non-zero label on the grid.
fn build_label_masks(arr: &Array3<u8>) -> Result<BTreeMap<u8, Array3<bool>>> {
    let mut labels: Vec<u8> = arr.iter().copied().filter(|&l| l != 0).collect();
    labels.sort_unstable();
    labels.dedup();
    if labels.is_empty() {
        return Err(PipelineError::EmptySegmentation);
    }
    Ok(labels
        .into_iter()
        .map(|label| (label, arr.mapv(|v| v == label)))
        .collect())
}

pub struct PreprocessStage<'a> {
    config: &'a Config,
    workspace: &'a CtWorkspace,
    registry: &'a LabelMapRegistry,
}

impl<'a> PreprocessStage<'a> {
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
        context.require(&["ct_nii_path", "body_ml_path", "tdt_roi_seg_path", "roi_subset"])?;

        let ct_img = NiftiImage::read(need(&context.ct_nii_path, "ct_nii_path")?)?;
        let roi_img = NiftiImage::read(need(&context.tdt_roi_seg_path, "tdt_roi_seg_path")?)?;
        let body_img = NiftiImage::read(need(&context.body_ml_path, "body_ml_path")?)?;
        let roi_subset = need(&context.roi_subset, "roi_subset")?.clone();

        let xy_dim = self.config.spect_preprocessing.xy_dim;
        let (ct_arr, scale) = to_sim_grid(&ct_img, xy_dim, ZoomOrder::Linear)?;
        let (roi_arr, _) = to_sim_grid(&roi_img, xy_dim, ZoomOrder::Nearest)?;
        let (body_arr, _) = to_sim_grid(&body_img, xy_dim, ZoomOrder::Nearest)?;

        if ct_arr.dim() != roi_arr.dim() || ct_arr.dim() != body_arr.dim() {
            let (a, b, c) = (ct_arr.dim(), roi_arr.dim(), body_arr.dim());
            return Err(PipelineError::ShapeMismatch {
                what: "simulation grid arrays".into(),
                a: vec![a.0, a.1, a.2],
                b: vec![b.0, b.1, b.2, c.0, c.1, c.2],
            });
        }

        // keep only requested labels (plus body); everything else becomes
        // background
        let mut allowed: Vec<u8> = Vec::new();
        for roi in &roi_subset {
            allowed.push(self.registry.tdt_id(*roi)?);
        }
        allowed.push(self.registry.tdt_id(TdtRoi::Body)?);
        let body_id = self.registry.tdt_id(TdtRoi::Body)?;

        let body_arr: Array3<u8> = body_arr.mapv(|v| u8::from(v > 0.0));
        let roi_body_arr: Array3<u8> = roi_arr.mapv(|v| {
            let label = v.round() as i32;
            if label > 0 && label <= u8::MAX as i32 && allowed.contains(&(label as u8)) {
                label as u8
            } else {
                0
            }
        });
        // organs only, body stripped
        let roi_only_arr = roi_body_arr.mapv(|l| if l == body_id { 0 } else { l });

        let mask_roi_body = build_label_masks(&roi_body_arr)?;

        let mut class_seg: BTreeMap<TdtRoi, u8> = BTreeMap::new();
        for &label in mask_roi_body.keys() {
            if let Some(roi) = self.registry.tdt_roi_for_id(label) {
                class_seg.insert(roi, label);
            }
        }

        // header zooms are (x, y, z); the grid is (z, y, x), mm -> cm
        let zooms = ct_img.header.zooms_zyx_mm();
        let spacing_cm_zyx = [
            zooms[0] / scale / 10.0,
            zooms[1] / scale / 10.0,
            zooms[2] / scale / 10.0,
        ];
        let (nz, ny, nx) = ct_arr.dim();
        let grid = SimGrid {
            shape_zyx: [nz, ny, nx],
            spacing_cm_zyx,
        };
        debug!("Simulation grid: {grid:?} (zoom scale {scale})");

        let output_dir = self.workspace.subdir(self.config, "spect_preprocessing");
        std::fs::create_dir_all(&output_dir)?;
        let prefix = &self.config.spect_preprocessing.name;

        let mu = hu_to_mu(&ct_arr, &body_arr, grid.in_plane_pixel_cm());
        let atn_av_path = output_dir.join(format!("{prefix}_atn_av.bin"));
        blob::write_f32_volume(&atn_av_path, mu.view())?;
        info!("Attenuation map written: {}", atn_av_path.display());

        let as_f32 = |a: &Array3<u8>| a.mapv(|v| v as f32);
        blob::write_f32_volume(
            output_dir.join(format!("{prefix}_roi_seg.bin")),
            as_f32(&roi_only_arr).view(),
        )?;
        blob::write_f32_volume(
            output_dir.join(format!("{prefix}_body_seg.bin")),
            as_f32(&body_arr).view(),
        )?;
        blob::write_f32_volume(
            output_dir.join(format!("{prefix}_roi_body_seg.bin")),
            as_f32(&roi_body_arr).view(),
        )?;

        assign(&mut context.ct_arr, "ct_arr", ct_arr);
        assign(&mut context.body_seg_arr, "body_seg_arr", body_arr);
        assign(&mut context.roi_body_seg_arr, "roi_body_seg_arr", roi_body_arr);
        assign(&mut context.mask_roi_body, "mask_roi_body", mask_roi_body);
        assign(&mut context.class_seg, "class_seg", class_seg);
        assign(&mut context.grid, "grid", grid);
        assign(&mut context.atn_av_path, "atn_av_path", atn_av_path);
        Ok(())
    }
}
