//! End-to-end scenarios over the stage chain with mock collaborators:
//! segmentation through PBPK on synthetic CTs, lesion insertion on the
//! unified segmentation, and batch isolation at the driver level.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ndarray::Array3;
use tdt_common::labels::{LabelMapRegistry, SegTask, TdtRoi};
use tdt_nifti::{NiftiHeader, NiftiImage, VoxelData};
use tdt_pipeline::config::Config;
use tdt_pipeline::context::Context;
use tdt_pipeline::driver::{CtInputKind, CtWorkspace};
use tdt_pipeline::error::{PipelineError, Result};
use tdt_pipeline::external::{
    Collaborators, OrganSegmenter, OsemSolver, ReconProblem, TacRequest, TacResult, TacSolver,
};
use tdt_pipeline::stages::pbpk::PbpkStage;
use tdt_pipeline::stages::preprocess::PreprocessStage;
use tdt_pipeline::stages::segmentation::SegmentationStage;
use tdt_pipeline::stages::unify::UnifyStage;
use tdt_pipeline::{Mode, RunOptions, TdtPipeline};

const LABEL_MAP: &str = r#"
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
    LabelMapRegistry::from_json_str(LABEL_MAP).unwrap()
}

fn config_json(roi_subset: &str, frames: &str, durations: &str) -> String {
    format!(
        r#"{{
        "output_folder": {{ "title": "TDT_Test" }},
        "subdir_names": {{
            "spect_preprocessing": "spect_preprocessing_outputs",
            "pbpk": "pbpk_outputs",
            "spect_simulation": "spect_simulation_outputs",
            "recon": "recon_outputs"
        }},
        "spect_preprocessing": {{
            "name": "spect_preprocessing",
            "roi_subset": {roi_subset}
        }},
        "pbpk": {{
            "name": "pbpk",
            "VOIs": ["Kidney", "Liver", "Rest"],
            "FrameStartTimes": {frames},
            "FrameDurations": {durations}
        }},
        "spect_simulation": {{
            "name": "spect_simulation",
            "Collimator": "me-legp",
            "Isotope": "lu177",
            "NumProjections": 16,
            "DetectorDistance": 15.0,
            "OutputImgSize": 16,
            "OutputPixelWidth": 0.48,
            "OutputSliceWidth": 0.48,
            "NumPhotons": 1e6,
            "SIMINDDirectory": "/nonexistent/simind",
            "EnergyWindowWidth": 20,
            "DetectorWidth": 40.0,
            "DetectorLength": 0,
            "NumCores": 1,
            "Iterations": 2,
            "Subsets": 4
        }}
    }}"#
    )
}

/// Writes a synthetic 12x12x12 CT (all soft tissue).
fn write_ct(path: &Path) {
    let ct = Array3::<f32>::from_elem((12, 12, 12), 20.0);
    let header = NiftiHeader::new([12, 12, 12], [2.0, 2.0, 2.0]);
    tdt_nifti::write(path, &header, VoxelData::F32(ct.view())).unwrap();
}

/// Mock segmenter: paints a body box for the body task, kidney and liver
/// cubes for the total task, and the four gland classes for the head task.
/// Records every invocation.
#[derive(Default)]
struct MockSegmenter {
    calls: Arc<Mutex<Vec<(SegTask, Vec<String>)>>>,
}

impl OrganSegmenter for MockSegmenter {
    fn segment(
        &self,
        ct_nii: &Path,
        output: &Path,
        task: SegTask,
        roi_subset: &[String],
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((task, roi_subset.to_vec()));

        let ct = NiftiImage::read(ct_nii)?;
        let [nz, ny, nx] = ct.shape_zyx();
        let mut seg = Array3::<u8>::zeros((nz, ny, nx));
        match task {
            SegTask::Body => {
                // body fills everything except a one-voxel air rim
                for z in 1..nz - 1 {
                    for y in 1..ny - 1 {
                        for x in 1..nx - 1 {
                            seg[[z, y, x]] = 1;
                        }
                    }
                }
            }
            SegTask::Total => {
                for z in 2..4 {
                    for y in 2..4 {
                        seg[[z, y, 2]] = 3; // kidney_left
                        seg[[z, y, 3]] = 2; // kidney_right
                        seg[[z, y, 5]] = 5; // liver
                    }
                }
            }
            SegTask::HeadGlandsCavities => {
                seg[[5, 5, 2]] = 5;
                seg[[5, 5, 3]] = 6;
                seg[[5, 5, 4]] = 9;
                seg[[5, 5, 5]] = 10;
            }
        }
        tdt_nifti::write(output, &ct.header, VoxelData::U8(seg.view()))?;
        Ok(())
    }
}

/// Solver with constant compartment activities.
struct FlatSolver;

impl TacSolver for FlatSolver {
    fn simulate(&self, request: &TacRequest) -> Result<TacResult> {
        let time_min: Vec<f64> = (0..=(request.stop_min as usize)).map(|t| t as f64).collect();
        let level = |voi: &str| match voi {
            "Kidney" => 10.0,
            "Liver" => 20.0,
            _ => 100.0,
        };
        let tacs_mbq = request
            .observables
            .iter()
            .map(|voi| vec![level(voi); time_min.len()])
            .collect();
        Ok(TacResult { time_min, tacs_mbq })
    }
}

struct UnusedOsem;

impl OsemSolver for UnusedOsem {
    fn reconstruct(&self, _work_dir: &Path, _problem: &ReconProblem<'_>) -> Result<Array3<f32>> {
        panic!("the OSEM solver must not be reached in these tests");
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: Config,
    workspace: CtWorkspace,
    segmenter: MockSegmenter,
}

fn fixture(roi_subset: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config =
        Config::from_json_str(&config_json(roi_subset, "[240.0]", "[600.0]")).unwrap();

    let ct_path = dir.path().join("ct.nii.gz");
    write_ct(&ct_path);

    let root = dir.path().join("TDT_Test_CT_0");
    std::fs::create_dir_all(&root).unwrap();
    let workspace = CtWorkspace {
        root,
        ct_index: 0,
        ct_input: ct_path,
        kind: CtInputKind::Nifti,
    };
    Fixture {
        _dir: dir,
        config,
        workspace,
        segmenter: MockSegmenter::default(),
    }
}

fn run_through_pbpk(f: &Fixture) -> Context {
    let registry = registry();
    let mut context = Context::new();
    SegmentationStage::new(&f.config, &f.workspace, &f.segmenter)
        .run(&mut context)
        .unwrap();
    UnifyStage::new(&f.config, &f.workspace, &registry)
        .run(&mut context)
        .unwrap();
    PreprocessStage::new(&f.config, &f.workspace, &registry)
        .run(&mut context)
        .unwrap();
    PbpkStage::new(&f.config, &f.workspace, &FlatSolver)
        .run(&mut context)
        .unwrap();
    context
}

#[test]
fn nifti_ct_body_only() {
    let f = fixture(r#"["body"]"#);
    let context = run_through_pbpk(&f);

    // only the body task ran
    let calls = f.segmenter.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, SegTask::Body);

    // unified seg carries only {0, body}
    let seg = NiftiImage::read(context.tdt_roi_seg_path.as_ref().unwrap()).unwrap();
    let labels: std::collections::BTreeSet<i32> =
        seg.data.iter().map(|v| v.round() as i32).collect();
    assert_eq!(labels, [0, 1].into_iter().collect());

    // one organ, one frame, positive activity
    let organ_sum = context.activity_organ_sum.as_ref().unwrap();
    assert_eq!(organ_sum.len(), 1);
    assert!(organ_sum.contains_key(&TdtRoi::Body));
    let map_sum = context.activity_map_sum.as_ref().unwrap();
    assert_eq!(map_sum.len(), 1);
    assert!(map_sum[0] > 0.0);
}

#[test]
fn kidney_liver_through_pbpk() {
    let f = fixture(r#"["body", "kidney", "liver"]"#);
    let context = run_through_pbpk(&f);

    // body + total tasks, with the expanded external subset
    let calls = f.segmenter.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, SegTask::Body);
    assert_eq!(calls[1].0, SegTask::Total);
    assert_eq!(calls[1].1, vec!["kidney_left", "kidney_right", "liver"]);

    // unified seg labels: background, body, kidney, liver
    let seg = NiftiImage::read(context.tdt_roi_seg_path.as_ref().unwrap()).unwrap();
    let labels: std::collections::BTreeSet<i32> =
        seg.data.iter().map(|v| v.round() as i32).collect();
    assert_eq!(labels, [0, 1, 2, 3].into_iter().collect());

    // grid consistency across context arrays
    let grid = context.grid.as_ref().unwrap();
    let ct_dim = context.ct_arr.as_ref().unwrap().dim();
    let body_dim = context.body_seg_arr.as_ref().unwrap().dim();
    let roi_dim = context.roi_body_seg_arr.as_ref().unwrap().dim();
    assert_eq!(ct_dim, body_dim);
    assert_eq!(ct_dim, roi_dim);
    assert_eq!([ct_dim.0, ct_dim.1, ct_dim.2], grid.shape_zyx);

    // per-organ binaries exist, kidney and liver mapped to their VOIs
    let paths = context.activity_map_paths_by_organ.as_ref().unwrap();
    assert_eq!(paths.len(), 3);
    for (_, path) in paths {
        assert!(path.exists(), "missing organ map {}", path.display());
    }
    let organ_sum = context.activity_organ_sum.as_ref().unwrap();
    assert!((organ_sum[&TdtRoi::Kidney][0] - 10.0).abs() / 10.0 < 1e-3);
    assert!((organ_sum[&TdtRoi::Liver][0] - 20.0).abs() / 20.0 < 1e-3);

    // mass balance over the whole volume
    let map_sum = context.activity_map_sum.as_ref().unwrap();
    let organs: f64 = organ_sum.values().map(|v| v[0]).sum();
    assert!((map_sum[0] - organs).abs() / organs < 1e-4);
}

#[test]
fn salivary_glands_unify_to_one_label() {
    let f = fixture(r#"["body", "salivary_glands"]"#);
    let registry = registry();
    let mut context = Context::new();
    SegmentationStage::new(&f.config, &f.workspace, &f.segmenter)
        .run(&mut context)
        .unwrap();
    UnifyStage::new(&f.config, &f.workspace, &registry)
        .run(&mut context)
        .unwrap();

    let calls = f.segmenter.calls.lock().unwrap().clone();
    assert!(calls.iter().any(|(t, _)| *t == SegTask::HeadGlandsCavities));

    let seg = NiftiImage::read(context.tdt_roi_seg_path.as_ref().unwrap()).unwrap();
    // the four gland classes collapsed onto the salivary_glands id
    let gland_voxels = seg.data.iter().filter(|v| v.round() as i32 == 7).count();
    assert_eq!(gland_voxels, 4);
}

#[test]
fn resume_skips_segmenter_invocations() {
    let f = fixture(r#"["body", "kidney"]"#);
    let registry = registry();

    let mut context = Context::new();
    SegmentationStage::new(&f.config, &f.workspace, &f.segmenter)
        .run(&mut context)
        .unwrap();
    let first_run = f.segmenter.calls.lock().unwrap().len();
    assert_eq!(first_run, 2);

    // second run: outputs exist, the segmenter is not touched
    let mut context = Context::new();
    SegmentationStage::new(&f.config, &f.workspace, &f.segmenter)
        .run(&mut context)
        .unwrap();
    assert_eq!(f.segmenter.calls.lock().unwrap().len(), first_run);
    UnifyStage::new(&f.config, &f.workspace, &registry)
        .run(&mut context)
        .unwrap();
    assert!(context.tdt_roi_seg_path.as_ref().unwrap().exists());
}

#[test]
fn lesion_insertion_into_prostate() {
    use tdt_pipeline::stages::lesions::LesionsStage;

    let dir = tempfile::tempdir().unwrap();
    let config_text = config_json(r#"["body", "prostate"]"#, "[240.0]", "[600.0]").replace(
        "\"spect_simulation\": {",
        r#""synthetic_lesions": {
            "name": "synthetic_lesions",
            "specs": {
                "prostate": {
                    "n_lesions": 3,
                    "radii_mm": [8.0, 6.0, 10.0],
                    "prob": "uniform",
                    "margin_mm": 2.0,
                    "seed": 7
                }
            }
        },
        "spect_simulation": {"#,
    );
    let config = Config::from_json_str(&config_text).unwrap();
    let lesions_cfg = config.synthetic_lesions.as_ref().unwrap();
    let registry = registry();

    // unified seg: body everywhere, prostate ball of radius 25 voxels at
    // the centre; with 2 mm voxels that is a 50 mm sphere, roomy enough
    // for the requested radii under any seed
    let n = 61usize;
    let c = (n / 2) as f64;
    let mut seg = Array3::<u8>::from_elem((n, n, n), 1);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let d = ((z as f64 - c).powi(2) + (y as f64 - c).powi(2)
                    + (x as f64 - c).powi(2))
                .sqrt();
                if d <= 25.0 {
                    seg[[z, y, x]] = 4;
                }
            }
        }
    }
    let prostate_before = seg.mapv(|l| l == 4);

    let root = dir.path().join("TDT_Test_CT_0");
    let preproc = root.join("spect_preprocessing_outputs");
    std::fs::create_dir_all(&preproc).unwrap();
    let seg_path = preproc.join("spect_preprocessing_tdt_roi_seg.nii.gz");
    let header = NiftiHeader::new([n, n, n], [2.0, 2.0, 2.0]);
    tdt_nifti::write(&seg_path, &header, VoxelData::U8(seg.view())).unwrap();

    let workspace = CtWorkspace {
        root,
        ct_index: 0,
        ct_input: dir.path().join("ct.nii.gz"),
        kind: CtInputKind::Nifti,
    };
    let mut context = Context::new();
    context.tdt_roi_seg_path = Some(seg_path.clone());
    context.roi_subset = Some(vec![TdtRoi::Body, TdtRoi::Prostate]);

    LesionsStage::new(&config, lesions_cfg, &workspace, &registry)
        .run(&mut context)
        .unwrap();

    // lesion label appears only inside the original prostate; everything
    // else is preserved bit-exact
    let modified = NiftiImage::read(&seg_path).unwrap();
    let mut lesion_voxels = 0usize;
    for ((z, y, x), v) in modified.data.indexed_iter() {
        let label = v.round() as i32;
        let was_prostate = prostate_before[[z, y, x]];
        if label == 8 {
            lesion_voxels += 1;
            assert!(was_prostate, "lesion voxel outside prostate at {z},{y},{x}");
        } else {
            let before = seg[[z, y, x]] as i32;
            assert_eq!(label, before, "non-lesion voxel changed at {z},{y},{x}");
        }
    }
    assert!(lesion_voxels > 0);

    // subset gained synthetic_lesion for the preprocessing filter
    assert!(context
        .roi_subset
        .as_ref()
        .unwrap()
        .contains(&TdtRoi::SyntheticLesion));

    // backup of the pre-lesion seg
    let backup = workspace
        .subdir(&config, "spect_preprocessing")
        .join("synthetic_lesions_outputs/tdt_roi_seg_pre_lesions.nii.gz");
    assert!(backup.exists());
}

#[test]
fn lesion_boundary_violation_leaves_seg_untouched() {
    use tdt_pipeline::stages::lesions::LesionsStage;

    let dir = tempfile::tempdir().unwrap();
    let config_text = config_json(r#"["body", "prostate"]"#, "[240.0]", "[600.0]").replace(
        "\"spect_simulation\": {",
        r#""synthetic_lesions": {
            "name": "synthetic_lesions",
            "specs": {
                "prostate": {
                    "n_lesions": 1,
                    "radii_mm": [6.0],
                    "prob": "user_defined",
                    "seed": 0,
                    "user_centers_zyx": [[15, 15, 26]]
                }
            }
        },
        "spect_simulation": {"#,
    );
    let config = Config::from_json_str(&config_text).unwrap();
    let lesions_cfg = config.synthetic_lesions.as_ref().unwrap();
    let registry = registry();

    // prostate ball radius 12 at the centre of a 31^3 volume; the user
    // center sits just inside the surface
    let n = 31usize;
    let c = (n / 2) as f64;
    let seg = Array3::<u8>::from_shape_fn((n, n, n), |(z, y, x)| {
        let d =
            ((z as f64 - c).powi(2) + (y as f64 - c).powi(2) + (x as f64 - c).powi(2)).sqrt();
        if d <= 12.0 { 4 } else { 1 }
    });

    let root = dir.path().join("TDT_Test_CT_0");
    let preproc = root.join("spect_preprocessing_outputs");
    std::fs::create_dir_all(&preproc).unwrap();
    let seg_path = preproc.join("spect_preprocessing_tdt_roi_seg.nii.gz");
    let header = NiftiHeader::new([n, n, n], [1.0, 1.0, 1.0]);
    tdt_nifti::write(&seg_path, &header, VoxelData::U8(seg.view())).unwrap();
    let bytes_before = std::fs::read(&seg_path).unwrap();

    let workspace = CtWorkspace {
        root,
        ct_index: 0,
        ct_input: dir.path().join("ct.nii.gz"),
        kind: CtInputKind::Nifti,
    };
    let mut context = Context::new();
    context.tdt_roi_seg_path = Some(seg_path.clone());
    context.roi_subset = Some(vec![TdtRoi::Body, TdtRoi::Prostate]);

    let err = LesionsStage::new(&config, lesions_cfg, &workspace, &registry)
        .run(&mut context)
        .unwrap_err();
    assert!(matches!(err, PipelineError::LesionPlacementFailed { .. }));

    // original seg untouched on disk
    assert_eq!(std::fs::read(&seg_path).unwrap(), bytes_before);
    // the subset was not extended
    assert!(!context
        .roi_subset
        .as_ref()
        .unwrap()
        .contains(&TdtRoi::SyntheticLesion));
}

fn batch_pipeline(dir: &Path, roi_subset: &str) -> (PathBuf, TdtPipeline) {
    let config_path = dir.join("config.json");
    std::fs::write(&config_path, config_json(roi_subset, "[240.0]", "[600.0]")).unwrap();

    let options = RunOptions {
        mode: Mode::Debug,
        logging_on: true,
        save_ct_scan: false,
        save_config: true,
        synthetic_lesions: false,
    };
    let pipeline = TdtPipeline::new(&config_path, options)
        .unwrap()
        .with_base_dir(dir)
        .with_collaborators(Collaborators {
            segmenter: Box::new(MockSegmenter::default()),
            tac_solver: Box::new(FlatSolver),
            osem_solver: Box::new(UnusedOsem),
        });
    (config_path, pipeline)
}

#[test]
fn batch_of_two_cts_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("cts");
    std::fs::create_dir_all(&inputs).unwrap();
    write_ct(&inputs.join("patient_a.nii.gz"));
    write_ct(&inputs.join("patient_b.nii.gz"));

    let (_config_path, pipeline) = batch_pipeline(dir.path(), r#"["body"]"#);

    // both CTs fail at the SIMIND stage (no simulator installed), but the
    // batch itself completes and both output roots exist independently
    let failures = pipeline.run_batch(&inputs).unwrap();
    assert_eq!(failures, 2);

    for idx in 0..2 {
        let root = dir.path().join(format!("TDT_Test_CT_{idx}"));
        assert!(root.is_dir(), "missing output root for CT {idx}");
        assert!(root.join(format!("logging_file_CT_{idx}.log")).exists());
        assert!(root.join("config.json").exists());
        // earlier stages ran: unified seg and attenuation map exist per CT
        let preproc = root.join("spect_preprocessing_outputs");
        assert!(preproc.join("spect_preprocessing_tdt_roi_seg.nii.gz").exists());
        assert!(preproc.join("spect_preprocessing_atn_av.bin").exists());
    }
}

#[test]
fn production_mode_skips_completed_ct() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("cts");
    std::fs::create_dir_all(&inputs).unwrap();
    let ct = inputs.join("patient.nii.gz");
    write_ct(&ct);

    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, config_json(r#"["body"]"#, "[240.0]", "[600.0]")).unwrap();

    // pre-create the reconstructed frame
    let recon_dir = dir.path().join("TDT_Test_CT_0/recon_outputs");
    std::fs::create_dir_all(&recon_dir).unwrap();
    std::fs::write(recon_dir.join("spect_simulation_240min.nii"), b"done").unwrap();

    let options = RunOptions {
        mode: Mode::Production,
        logging_on: false,
        save_ct_scan: false,
        save_config: false,
        synthetic_lesions: false,
    };
    let pipeline = TdtPipeline::new(&config_path, options)
        .unwrap()
        .with_base_dir(dir.path())
        .with_collaborators(Collaborators {
            segmenter: Box::new(MockSegmenter::default()),
            tac_solver: Box::new(FlatSolver),
            osem_solver: Box::new(UnusedOsem),
        });

    // the CT is skipped outright, so nothing fails and no new artifacts
    // appear
    let failures = pipeline.run_batch(&inputs).unwrap();
    assert_eq!(failures, 0);
    assert!(!dir
        .path()
        .join("TDT_Test_CT_0/spect_preprocessing_outputs/spect_preprocessing_ct.nii.gz")
        .exists());
}
