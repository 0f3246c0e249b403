//! Synthetic lesions stage: constrained sphere packing inside ROI masks.
//!
//! Three geometric guarantees hold for every placed lesion:
//! - the center lies inside the ROI,
//! - the full sphere stays inside the ROI (distance-transform boundary
//!   constraint with a configurable margin),
//! - lesions do not overlap (pairwise physical separation with the same
//!   margin).
//!
//! All placements for all ROIs are computed before any file is touched, so
//! a placement failure leaves the unified segmentation exactly as the
//! unification stage wrote it.

use std::path::{Path, PathBuf};

use ndarray::Array3;
use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::Serialize;
use tdt_common::edt::distance_transform_mm;
use tdt_common::labels::{LabelMapRegistry, TdtRoi};
use tdt_nifti::{NiftiImage, VoxelData};
use tracing::info;

use crate::config::{Config, LesionSpec, LesionsCfg, ProbScheme};
use crate::context::{Context, assign, need};
use crate::driver::CtWorkspace;
use crate::error::{PipelineError, Result};

const MAX_ATTEMPTS_PER_LESION: usize = 4000;

fn placement_err(roi: &str, detail: impl Into<String>) -> PipelineError {
    PipelineError::LesionPlacementFailed {
        roi: roi.to_string(),
        detail: detail.into(),
    }
}

fn phys_dist_mm(a: [usize; 3], b: [usize; 3], spacing_mm: [f64; 3]) -> f64 {
    let mut sum = 0.0;
    for k in 0..3 {
        let d = (a[k] as f64 - b[k] as f64) * spacing_mm[k];
        sum += d * d;
    }
    sum.sqrt()
}

fn candidate_weights(
    mask: &Array3<bool>,
    candidates: &[[usize; 3]],
    spacing_mm: [f64; 3],
    scheme: ProbScheme,
    sigma_mm: Option<f64>,
    roi: &str,
) -> Result<Vec<f64>> {
    match scheme {
        ProbScheme::Uniform | ProbScheme::UserDefined => Ok(vec![1.0; candidates.len()]),
        ProbScheme::Gaussian => {
            let sigma = sigma_mm
                .ok_or_else(|| placement_err(roi, "sigma_mm required for prob = gaussian"))?;
            // centroid of the ROI in voxel coordinates
            let mut sums = [0.0f64; 3];
            let mut count = 0usize;
            for ((z, y, x), &inside) in mask.indexed_iter() {
                if inside {
                    sums[0] += z as f64;
                    sums[1] += y as f64;
                    sums[2] += x as f64;
                    count += 1;
                }
            }
            if count == 0 {
                return Err(placement_err(roi, "mask is empty, no centroid"));
            }
            let mu = [
                sums[0] / count as f64,
                sums[1] / count as f64,
                sums[2] / count as f64,
            ];
            Ok(candidates
                .iter()
                .map(|c| {
                    let mut r2 = 0.0;
                    for k in 0..3 {
                        let d = (c[k] as f64 - mu[k]) * spacing_mm[k];
                        r2 += d * d;
                    }
                    (-0.5 * r2 / (sigma * sigma)).exp()
                })
                .collect())
        }
    }
}

/// Sequentially places lesion centers under the boundary and separation
/// constraints. Returns the centers and the boundary-distance map (mm).
pub(crate) fn place_lesion_centers(
    roi: &str,
    mask: &Array3<bool>,
    radii_mm: &[f64],
    spacing_mm: [f64; 3],
    spec: &LesionSpec,
) -> Result<(Vec<[usize; 3]>, Array3<f64>)> {
    let dist_mm = distance_transform_mm(mask, spacing_mm);
    let margin = spec.margin_mm;
    let mut centers: Vec<[usize; 3]> = Vec::with_capacity(radii_mm.len());

    if spec.prob == ProbScheme::UserDefined {
        let user = spec
            .user_centers_zyx
            .as_ref()
            .ok_or_else(|| placement_err(roi, "prob = user_defined requires user_centers_zyx"))?;
        if user.len() != radii_mm.len() {
            return Err(placement_err(
                roi,
                "user_centers_zyx length must match radii_mm length",
            ));
        }
        let dims = mask.dim();
        for (c, &r) in user.iter().zip(radii_mm) {
            if c.iter().any(|&v| v < 0)
                || c[0] as usize >= dims.0
                || c[1] as usize >= dims.1
                || c[2] as usize >= dims.2
            {
                return Err(placement_err(roi, format!("center {c:?} is out of bounds")));
            }
            let c = [c[0] as usize, c[1] as usize, c[2] as usize];
            if !mask[c] {
                return Err(placement_err(roi, format!("center {c:?} is not inside the ROI")));
            }
            if dist_mm[c] < r + margin {
                return Err(placement_err(
                    roi,
                    format!("center {c:?} is too close to the ROI boundary for radius {r} mm"),
                ));
            }
            for (cj, &rj) in centers.iter().zip(radii_mm) {
                if phys_dist_mm(c, *cj, spacing_mm) < r + rj + margin {
                    return Err(placement_err(
                        roi,
                        format!("center {c:?} overlaps the lesion at {cj:?}"),
                    ));
                }
            }
            centers.push(c);
        }
        return Ok((centers, dist_mm));
    }

    let mut rng = StdRng::seed_from_u64(spec.seed);
    for (i, &r) in radii_mm.iter().enumerate() {
        // admissible centers for this radius
        let candidates: Vec<[usize; 3]> = dist_mm
            .indexed_iter()
            .filter(|&(_, &d)| d >= r + margin)
            .map(|((z, y, x), _)| [z, y, x])
            .collect();
        if candidates.is_empty() {
            return Err(placement_err(
                roi,
                format!("no admissible centers for radius {r} mm (margin {margin} mm)"),
            ));
        }

        let weights =
            candidate_weights(mask, &candidates, spacing_mm, spec.prob, spec.sigma_mm, roi)?;
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(placement_err(roi, "all candidate weights are zero"));
        }
        let sampler = WeightedIndex::new(&weights)
            .map_err(|e| placement_err(roi, format!("invalid candidate weights: {e}")))?;

        let mut placed = false;
        for _ in 0..MAX_ATTEMPTS_PER_LESION {
            let c = candidates[sampler.sample(&mut rng)];
            let separated = centers
                .iter()
                .zip(radii_mm)
                .all(|(cj, &rj)| phys_dist_mm(c, *cj, spacing_mm) >= r + rj + margin);
            if separated {
                centers.push(c);
                placed = true;
                break;
            }
        }
        if !placed {
            return Err(placement_err(
                roi,
                format!(
                    "failed to place lesion {}/{} (r = {r} mm) after {MAX_ATTEMPTS_PER_LESION} attempts",
                    i + 1,
                    radii_mm.len()
                ),
            ));
        }
    }

    Ok((centers, dist_mm))
}

/// Rasterizes the lesions as filled spheres clipped to the ROI mask.
/// Labels are 1..=N in placement order.
pub(crate) fn build_lesion_labelmap(
    mask: &Array3<bool>,
    centers: &[[usize; 3]],
    radii_mm: &[f64],
    spacing_mm: [f64; 3],
) -> Array3<i16> {
    let (nz, ny, nx) = mask.dim();
    let mut labels = Array3::<i16>::zeros((nz, ny, nx));

    for (lesion, (c, &r)) in centers.iter().zip(radii_mm).enumerate() {
        let rad = |axis: usize| (r / spacing_mm[axis]).ceil() as usize;
        let (rz, ry, rx) = (rad(0), rad(1), rad(2));
        let z_range = c[0].saturating_sub(rz)..(c[0] + rz + 1).min(nz);
        let y_range = c[1].saturating_sub(ry)..(c[1] + ry + 1).min(ny);
        let x_range = c[2].saturating_sub(rx)..(c[2] + rx + 1).min(nx);

        for z in z_range {
            for y in y_range.clone() {
                for x in x_range.clone() {
                    let idx = [z, y, x];
                    if !mask[idx] {
                        continue;
                    }
                    if phys_dist_mm(idx, *c, spacing_mm) <= r {
                        labels[idx] = (lesion + 1) as i16;
                    }
                }
            }
        }
    }
    labels
}

#[derive(Serialize)]
struct LesionPaths {
    lesions_labels: PathBuf,
    lesions_binary: PathBuf,
    organ_minus_lesions: PathBuf,
}

#[derive(Serialize)]
struct LesionMetadata {
    roi: String,
    roi_id: u8,
    synthetic_lesion_id: u8,
    prob: String,
    sigma_mm: Option<f64>,
    margin_mm: f64,
    seed: u64,
    spacing_zyx_mm: [f64; 3],
    centers_zyx: Vec<[usize; 3]>,
    radii_mm: Vec<f64>,
    dist_to_boundary_mm: Vec<f64>,
    paths: LesionPaths,
}

struct RoiPlacement {
    roi: TdtRoi,
    roi_id: u8,
    mask: Array3<bool>,
    centers: Vec<[usize; 3]>,
    dist_mm: Array3<f64>,
    labels: Array3<i16>,
}

pub struct LesionsStage<'a> {
    config: &'a Config,
    lesions: &'a LesionsCfg,
    workspace: &'a CtWorkspace,
    registry: &'a LabelMapRegistry,
}

impl<'a> LesionsStage<'a> {
    pub fn new(
        config: &'a Config,
        lesions: &'a LesionsCfg,
        workspace: &'a CtWorkspace,
        registry: &'a LabelMapRegistry,
    ) -> Self {
        Self {
            config,
            lesions,
            workspace,
            registry,
        }
    }

    fn write_seg_like(
        path: &Path,
        template: &NiftiImage,
        data: VoxelData<'_>,
    ) -> Result<()> {
        tdt_nifti::write(path, &template.header, data)?;
        Ok(())
    }

    pub fn run(&self, context: &mut Context) -> Result<()> {
        if self.lesions.specs.is_empty() {
            info!("Synthetic lesions enabled but no specs configured; skipping.");
            return Ok(());
        }
        context.require(&["tdt_roi_seg_path", "roi_subset"])?;
        let seg_path = need(&context.tdt_roi_seg_path, "tdt_roi_seg_path")?.clone();

        let seg = NiftiImage::read(&seg_path)?;
        let spacing_zyx_mm = seg.header.zooms_zyx_mm();
        let lesion_id = self.registry.tdt_id(TdtRoi::SyntheticLesion)?;

        // place everything first; nothing is written if any ROI fails
        let mut placements: Vec<(&String, &LesionSpec, RoiPlacement)> = Vec::new();
        for (roi_name, spec) in &self.lesions.specs {
            let roi = TdtRoi::from_name(roi_name)
                .filter(|r| *r != TdtRoi::SyntheticLesion)
                .ok_or_else(|| placement_err(roi_name, "not a canonical organ ROI"))?;
            let roi_id = self.registry.tdt_id(roi)?;

            let mask = seg.data.mapv(|v| v.round() as i32 == i32::from(roi_id));
            if !mask.iter().any(|&m| m) {
                return Err(placement_err(
                    roi_name,
                    "mask is empty in the unified segmentation",
                ));
            }

            let (centers, dist_mm) =
                place_lesion_centers(roi_name, &mask, &spec.radii_mm, spacing_zyx_mm, spec)?;
            let labels = build_lesion_labelmap(&mask, &centers, &spec.radii_mm, spacing_zyx_mm);
            placements.push((
                roi_name,
                spec,
                RoiPlacement {
                    roi,
                    roi_id,
                    mask,
                    centers,
                    dist_mm,
                    labels,
                },
            ));
        }

        let lesions_outdir = self
            .workspace
            .subdir(self.config, "spect_preprocessing")
            .join(format!("{}_outputs", self.lesions.name));
        std::fs::create_dir_all(&lesions_outdir)?;

        // backup of the pre-lesion unified seg
        let backup = seg.data.mapv(|v| v.round() as u8);
        Self::write_seg_like(
            &lesions_outdir.join("tdt_roi_seg_pre_lesions.nii.gz"),
            &seg,
            VoxelData::U8(backup.view()),
        )?;

        let mut global_binary = Array3::<u8>::zeros(seg.data.raw_dim());
        let mut global_labels = Array3::<i16>::zeros(seg.data.raw_dim());
        let mut next_global_id: i16 = 1;

        for (roi_name, spec, placement) in &placements {
            let binary = placement.labels.mapv(|l| u8::from(l > 0));
            let organ_minus = ndarray::Zip::from(&placement.mask)
                .and(&binary)
                .map_collect(|&m, &b| u8::from(m && b == 0));

            let local_max = placement.labels.iter().copied().max().unwrap_or(0);
            for local in 1..=local_max {
                ndarray::Zip::from(&mut global_labels)
                    .and(&placement.labels)
                    .for_each(|g, &l| {
                        if l == local {
                            *g = next_global_id;
                        }
                    });
                next_global_id += 1;
            }
            ndarray::Zip::from(&mut global_binary)
                .and(&binary)
                .for_each(|g, &b| *g |= b);

            let roi_dir = lesions_outdir.join(roi_name);
            std::fs::create_dir_all(&roi_dir)?;
            let labels_path = roi_dir.join(format!("{roi_name}_lesions_labels.nii.gz"));
            let binary_path = roi_dir.join(format!("{roi_name}_lesions_binary.nii.gz"));
            let minus_path = roi_dir.join(format!("{roi_name}_organ_minus_lesions.nii.gz"));

            Self::write_seg_like(&labels_path, &seg, VoxelData::I16(placement.labels.view()))?;
            Self::write_seg_like(&binary_path, &seg, VoxelData::U8(binary.view()))?;
            Self::write_seg_like(&minus_path, &seg, VoxelData::U8(organ_minus.view()))?;

            let metadata = LesionMetadata {
                roi: placement.roi.name().to_string(),
                roi_id: placement.roi_id,
                synthetic_lesion_id: lesion_id,
                prob: format!("{:?}", spec.prob).to_lowercase(),
                sigma_mm: spec.sigma_mm,
                margin_mm: spec.margin_mm,
                seed: spec.seed,
                spacing_zyx_mm,
                centers_zyx: placement.centers.clone(),
                radii_mm: spec.radii_mm.clone(),
                dist_to_boundary_mm: placement
                    .centers
                    .iter()
                    .map(|c| placement.dist_mm[*c])
                    .collect(),
                paths: LesionPaths {
                    lesions_labels: labels_path,
                    lesions_binary: binary_path,
                    organ_minus_lesions: minus_path,
                },
            };
            std::fs::write(
                roi_dir.join(format!("{roi_name}_lesion_metadata.json")),
                serde_json::to_vec_pretty(&metadata)?,
            )?;
        }

        Self::write_seg_like(
            &lesions_outdir.join("all_lesions_binary.nii.gz"),
            &seg,
            VoxelData::U8(global_binary.view()),
        )?;
        Self::write_seg_like(
            &lesions_outdir.join("all_lesions_labels.nii.gz"),
            &seg,
            VoxelData::I16(global_labels.view()),
        )?;

        // overwrite the unified seg: lesion voxels take the canonical
        // synthetic_lesion label, every other voxel is preserved
        let mut modified = seg.data.mapv(|v| v.round() as u8);
        ndarray::Zip::from(&mut modified)
            .and(&global_binary)
            .for_each(|m, &b| {
                if b > 0 {
                    *m = lesion_id;
                }
            });
        Self::write_seg_like(&seg_path, &seg, VoxelData::U8(modified.view()))?;
        info!(
            "Inserted {} lesion(s) across {} ROI(s); unified seg overwritten.",
            next_global_id - 1,
            placements.len()
        );

        // downstream filtering must keep lesion voxels
        let mut roi_subset = need(&context.roi_subset, "roi_subset")?.clone();
        if !roi_subset.contains(&TdtRoi::SyntheticLesion) {
            roi_subset.push(TdtRoi::SyntheticLesion);
        }
        assign(&mut context.roi_subset, "roi_subset", roi_subset);
        assign(&mut context.lesions_outdir, "lesions_outdir", lesions_outdir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ball_mask(dim: usize, radius: f64) -> Array3<bool> {
        let c = (dim / 2) as f64;
        Array3::from_shape_fn((dim, dim, dim), |(z, y, x)| {
            let d = ((z as f64 - c).powi(2) + (y as f64 - c).powi(2) + (x as f64 - c).powi(2))
                .sqrt();
            d <= radius
        })
    }

    fn spec(prob: ProbScheme, radii: &[f64], margin: f64, seed: u64) -> LesionSpec {
        LesionSpec {
            n_lesions: radii.len(),
            radii_mm: radii.to_vec(),
            prob,
            sigma_mm: None,
            margin_mm: margin,
            seed,
            user_centers_zyx: None,
        }
    }

    #[test]
    fn placed_lesions_satisfy_constraints() {
        let mask = ball_mask(41, 18.0);
        let spacing = [1.0, 1.0, 1.0];
        let radii = [3.0, 3.0, 4.0];
        let margin = 1.0;
        let s = spec(ProbScheme::Uniform, &radii, margin, 11);

        let (centers, dist) =
            place_lesion_centers("prostate", &mask, &radii, spacing, &s).unwrap();
        assert_eq!(centers.len(), 3);

        // boundary constraint
        for (c, r) in centers.iter().zip(radii) {
            assert!(dist[*c] >= r + margin);
        }
        // pairwise separation
        for i in 0..centers.len() {
            for j in (i + 1)..centers.len() {
                let d = phys_dist_mm(centers[i], centers[j], spacing);
                assert!(
                    d >= radii[i] + radii[j] + margin,
                    "lesions {i} and {j} overlap"
                );
            }
        }
    }

    #[test]
    fn rasterized_spheres_stay_inside_roi() {
        let mask = ball_mask(41, 18.0);
        let spacing = [1.0, 1.0, 1.0];
        let radii = [5.0, 4.0];
        let s = spec(ProbScheme::Uniform, &radii, 1.0, 3);

        let (centers, _) = place_lesion_centers("liver", &mask, &radii, spacing, &s).unwrap();
        let labels = build_lesion_labelmap(&mask, &centers, &radii, spacing);

        assert!(labels.iter().any(|&l| l > 0));
        for (idx, &l) in labels.indexed_iter() {
            if l > 0 {
                assert!(mask[idx], "lesion voxel {idx:?} escaped the ROI");
            }
        }
    }

    #[test]
    fn deterministic_for_a_seed() {
        let mask = ball_mask(31, 13.0);
        let spacing = [1.0, 1.0, 1.0];
        let radii = [3.0, 3.0];
        let s = spec(ProbScheme::Uniform, &radii, 1.0, 42);

        let (a, _) = place_lesion_centers("spleen", &mask, &radii, spacing, &s).unwrap();
        let (b, _) = place_lesion_centers("spleen", &mask, &radii, spacing, &s).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn oversized_radius_fails() {
        let mask = ball_mask(21, 8.0);
        let radii = [30.0];
        let s = spec(ProbScheme::Uniform, &radii, 1.0, 0);
        let err =
            place_lesion_centers("heart", &mask, &radii, [1.0, 1.0, 1.0], &s).unwrap_err();
        assert!(matches!(err, PipelineError::LesionPlacementFailed { .. }));
    }

    #[test]
    fn user_center_on_boundary_rejected() {
        let mask = ball_mask(31, 12.0);
        let radii = [4.0];
        let mut s = spec(ProbScheme::UserDefined, &radii, 1.0, 0);
        // a voxel right at the ball surface: inside, but the sphere would
        // poke out
        s.user_centers_zyx = Some(vec![[15, 15, 26]]);
        let err =
            place_lesion_centers("prostate", &mask, &radii, [1.0, 1.0, 1.0], &s).unwrap_err();
        match err {
            PipelineError::LesionPlacementFailed { roi, detail } => {
                assert_eq!(roi, "prostate");
                assert!(detail.contains("boundary"), "detail: {detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn user_centers_validated_for_overlap() {
        let mask = ball_mask(41, 18.0);
        let radii = [4.0, 4.0];
        let mut s = spec(ProbScheme::UserDefined, &radii, 1.0, 0);
        s.user_centers_zyx = Some(vec![[20, 20, 20], [20, 20, 22]]);
        let err =
            place_lesion_centers("liver", &mask, &radii, [1.0, 1.0, 1.0], &s).unwrap_err();
        match err {
            PipelineError::LesionPlacementFailed { detail, .. } => {
                assert!(detail.contains("overlaps"), "detail: {detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn gaussian_weights_peak_at_centroid() {
        let mask = ball_mask(21, 9.0);
        let spacing = [1.0, 1.0, 1.0];
        let candidates = vec![[10usize, 10, 10], [10, 10, 14], [10, 10, 6]];
        let w = candidate_weights(
            &mask,
            &candidates,
            spacing,
            ProbScheme::Gaussian,
            Some(3.0),
            "kidney",
        )
        .unwrap();
        assert!(w[0] > w[1]);
        assert!(w[0] > w[2]);
        assert!((w[1] - w[2]).abs() < 1e-9);
    }

    #[test]
    fn anisotropic_spacing_respected_in_rasterization() {
        // thin slab in z; with 2 mm z-spacing a 3 mm sphere spans only one
        // neighbour slice each way
        let mask = Array3::from_elem((9, 21, 21), true);
        let centers = vec![[4usize, 10, 10]];
        let labels = build_lesion_labelmap(&mask, &centers, &[3.0], [2.0, 1.0, 1.0]);
        assert!(labels[[4, 10, 10]] > 0);
        assert!(labels[[5, 10, 10]] > 0); // 2 mm away
        assert_eq!(labels[[6, 10, 10]], 0); // 4 mm away
        assert!(labels[[4, 13, 10]] > 0); // 3 mm away in y
        assert_eq!(labels[[4, 14, 10]], 0);
    }
}
