//! Shared mutable state threaded through the pipeline stages.
//!
//! Every field starts absent and is populated by exactly one stage; later
//! stages declare their inputs through [`Context::require`] at entry, which
//! fails with [`PipelineError::MissingContextField`] naming every missing
//! field. Assignments go through [`assign`], which logs a summary of the
//! value (shape and sample type instead of a full dump) so state
//! transitions stay auditable without log bloat.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ndarray::Array3;
use tdt_common::grid::SimGrid;
use tdt_common::labels::TdtRoi;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Execution plan derived from the user's ROI subset: which external
/// segmentation tasks run and with which expanded class names.
#[derive(Clone, Debug, PartialEq)]
pub struct SegPlan {
    pub run_body: bool,
    pub run_total: bool,
    pub run_head_glands_cavities: bool,
    /// Expanded class names for the `total` task (segmenter vocabulary).
    pub total_roi_subset: Vec<String>,
    /// Expanded class names for the `head_glands_cavities` task.
    pub head_roi_subset: Vec<String>,
    /// The validated user request in canonical ROI terms.
    pub tdt_roi_subset: Vec<TdtRoi>,
}

macro_rules! context_fields {
    ($($(#[$meta:meta])* $field:ident: $ty:ty,)+) => {
        #[derive(Default)]
        pub struct Context {
            $($(#[$meta])* pub $field: Option<$ty>,)+
        }

        impl Context {
            fn has(&self, name: &str) -> bool {
                match name {
                    $(stringify!($field) => self.$field.is_some(),)+
                    _ => false,
                }
            }
        }
    };
}

context_fields! {
    // ----- segmentation stage -----
    /// Standardized CT volume (always NIfTI, regardless of the input kind).
    ct_nii_path: PathBuf,
    body_ml_path: PathBuf,
    total_ml_path: PathBuf,
    head_glands_cavities_ml_path: PathBuf,
    totseg_plan: SegPlan,

    // ----- ROI unification stage -----
    /// Unified multilabel segmentation in canonical TDT label space.
    /// Overwritten in place by the synthetic lesions stage when enabled.
    tdt_roi_seg_path: PathBuf,
    /// Effective ROI subset for downstream stages; gains `synthetic_lesion`
    /// after lesion insertion.
    roi_subset: Vec<TdtRoi>,

    // ----- synthetic lesions stage -----
    lesions_outdir: PathBuf,

    // ----- preprocessing stage -----
    ct_arr: Array3<f32>,
    body_seg_arr: Array3<u8>,
    roi_body_seg_arr: Array3<u8>,
    /// Label id -> binary mask on the simulation grid.
    mask_roi_body: BTreeMap<u8, Array3<bool>>,
    /// Canonical ROI -> label id for every label present on the grid.
    class_seg: BTreeMap<TdtRoi, u8>,
    grid: SimGrid,
    atn_av_path: PathBuf,

    // ----- PBPK stage -----
    /// Per-frame total activity over the whole volume [MBq].
    activity_map_sum: Vec<f64>,
    /// Per-organ per-frame activity [MBq].
    activity_organ_sum: BTreeMap<TdtRoi, Vec<f64>>,
    /// First-frame activity map blob per organ, in `class_seg` order.
    activity_map_paths_by_organ: Vec<(TdtRoi, PathBuf)>,

    // ----- SIMIND stage -----
    spect_sim_output_dir: PathBuf,
    simind_work_dir: PathBuf,

    // ----- reconstruction stage -----
    recon_paths: Vec<PathBuf>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with a structured error naming every missing field.
    pub fn require(&self, names: &[&str]) -> Result<()> {
        let missing: Vec<&str> = names.iter().copied().filter(|n| !self.has(n)).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::MissingContextField(missing.join(", ")))
        }
    }
}

/// Borrow a context field that an earlier stage must have populated.
pub fn need<'a, T>(slot: &'a Option<T>, name: &str) -> Result<&'a T> {
    slot.as_ref()
        .ok_or_else(|| PipelineError::MissingContextField(name.to_string()))
}

/// Store a context field, logging a summary of the assigned value.
pub fn assign<T: Summarize>(slot: &mut Option<T>, name: &str, value: T) {
    debug!("context.{name} = {}", value.summarize());
    *slot = Some(value);
}

/// Compact, log-friendly description of a context value.
pub trait Summarize {
    fn summarize(&self) -> String;
}

impl Summarize for PathBuf {
    fn summarize(&self) -> String {
        self.display().to_string()
    }
}

impl<T> Summarize for Array3<T> {
    fn summarize(&self) -> String {
        let (z, y, x) = self.dim();
        let dtype = std::any::type_name::<T>();
        format!("{dtype} array (Z,Y,X)=({z}, {y}, {x})")
    }
}

impl Summarize for Vec<f64> {
    fn summarize(&self) -> String {
        format!("f64 vec (len {})", self.len())
    }
}

impl Summarize for Vec<PathBuf> {
    fn summarize(&self) -> String {
        format!("{} path(s)", self.len())
    }
}

impl Summarize for Vec<(TdtRoi, PathBuf)> {
    fn summarize(&self) -> String {
        let names: Vec<&str> = self.iter().map(|(r, _)| r.name()).collect();
        format!("per-organ paths [{}]", names.join(", "))
    }
}

impl Summarize for Vec<TdtRoi> {
    fn summarize(&self) -> String {
        let names: Vec<&str> = self.iter().map(|r| r.name()).collect();
        format!("[{}]", names.join(", "))
    }
}

impl Summarize for BTreeMap<u8, Array3<bool>> {
    fn summarize(&self) -> String {
        let labels: Vec<String> = self.keys().map(|k| k.to_string()).collect();
        format!("masks for labels [{}]", labels.join(", "))
    }
}

impl Summarize for BTreeMap<TdtRoi, u8> {
    fn summarize(&self) -> String {
        let entries: Vec<String> = self.iter().map(|(r, id)| format!("{r}={id}")).collect();
        format!("{{{}}}", entries.join(", "))
    }
}

impl Summarize for BTreeMap<TdtRoi, Vec<f64>> {
    fn summarize(&self) -> String {
        let names: Vec<&str> = self.keys().map(|r| r.name()).collect();
        format!("per-frame activity for [{}]", names.join(", "))
    }
}

impl Summarize for SimGrid {
    fn summarize(&self) -> String {
        format!(
            "shape (Z,Y,X)={:?}, spacing {:.4?} cm",
            self.shape_zyx, self.spacing_cm_zyx
        )
    }
}

impl Summarize for SegPlan {
    fn summarize(&self) -> String {
        format!(
            "body={}, total={} {:?}, head={} {:?}",
            self.run_body,
            self.run_total,
            self.total_roi_subset,
            self.run_head_glands_cavities,
            self.head_roi_subset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_names_every_missing_field() {
        let mut context = Context::new();
        let err = context
            .require(&["ct_nii_path", "grid", "activity_map_sum"])
            .unwrap_err();
        match err {
            PipelineError::MissingContextField(fields) => {
                assert_eq!(fields, "ct_nii_path, grid, activity_map_sum");
            }
            other => panic!("unexpected error: {other}"),
        }

        assign(&mut context.ct_nii_path, "ct_nii_path", PathBuf::from("/x"));
        let err = context
            .require(&["ct_nii_path", "grid"])
            .unwrap_err();
        match err {
            PipelineError::MissingContextField(fields) => assert_eq!(fields, "grid"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn require_passes_when_populated() {
        let mut context = Context::new();
        assign(
            &mut context.grid,
            "grid",
            SimGrid {
                shape_zyx: [2, 2, 2],
                spacing_cm_zyx: [0.1, 0.1, 0.1],
            },
        );
        context.require(&["grid"]).unwrap();
    }

    #[test]
    fn unknown_field_counts_as_missing() {
        let context = Context::new();
        assert!(context.require(&["no_such_field"]).is_err());
    }

    #[test]
    fn need_borrows_or_fails() {
        let mut context = Context::new();
        assert!(need(&context.ct_nii_path, "ct_nii_path").is_err());
        context.ct_nii_path = Some(PathBuf::from("/ct.nii.gz"));
        assert_eq!(
            need(&context.ct_nii_path, "ct_nii_path").unwrap(),
            &PathBuf::from("/ct.nii.gz")
        );
    }
}
