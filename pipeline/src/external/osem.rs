use std::path::PathBuf;
use std::process::Command;

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tdt_common::blob;

use crate::error::{PipelineError, Result};

/// Projection-space metadata shared by the three energy windows.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjMeta {
    pub dim1: usize,
    pub dim2: usize,
    pub num_proj: usize,
    /// Energy window widths in keV: photopeak, lower and upper scatter.
    pub ww_peak: f64,
    pub ww_lower: f64,
    pub ww_upper: f64,
}

/// Collimator/detector response metadata parsed from the simulator header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PsfMeta {
    pub hole_diameter_cm: f64,
    pub hole_length_cm: f64,
    pub intrinsic_fwhm_cm: f64,
}

/// One frame's reconstruction problem: the Poisson realization of the
/// photopeak window, the additive scatter estimate, and the object-space
/// transforms (attenuation volume + PSF metadata).
pub struct ReconProblem<'a> {
    /// Photopeak counts, shape (num_proj, dim1, dim2).
    pub photopeak: &'a Array3<f32>,
    /// Additive scatter term, same shape as `photopeak`.
    pub scatter: &'a Array3<f32>,
    /// Attenuation map on the object grid (Z, Y, X).
    pub attenuation: &'a Array3<f32>,
    /// Center-of-rotation offsets, one per projection.
    pub cor: &'a [f64],
    pub proj: ProjMeta,
    pub psf: PsfMeta,
    pub iterations: u32,
    pub subsets: u32,
}

/// Opaque ordered-subsets expectation-maximization solver.
pub trait OsemSolver {
    /// Returns the reconstructed object in counts, shaped like the
    /// attenuation volume.
    fn reconstruct(&self, work_dir: &std::path::Path, problem: &ReconProblem<'_>)
    -> Result<Array3<f32>>;
}

#[derive(Serialize)]
struct ProblemManifest<'a> {
    proj: &'a ProjMeta,
    psf: &'a PsfMeta,
    object_shape_zyx: [usize; 3],
    iterations: u32,
    subsets: u32,
    photopeak: &'a str,
    scatter: &'a str,
    attenuation: &'a str,
    cor: &'a str,
}

/// Spawns the configured solver executable on a problem directory.
///
/// The directory receives `photopeak.bin`, `scatter.bin`,
/// `attenuation.bin` (raw little-endian f32), `cor.txt` and
/// `problem.json`; the solver is expected to write `recon.bin` shaped
/// like the attenuation volume.
pub struct CommandOsemSolver {
    pub executable: PathBuf,
}

impl OsemSolver for CommandOsemSolver {
    fn reconstruct(
        &self,
        work_dir: &std::path::Path,
        problem: &ReconProblem<'_>,
    ) -> Result<Array3<f32>> {
        std::fs::create_dir_all(work_dir)?;

        blob::write_f32_volume(work_dir.join("photopeak.bin"), problem.photopeak.view())?;
        blob::write_f32_volume(work_dir.join("scatter.bin"), problem.scatter.view())?;
        blob::write_f32_volume(work_dir.join("attenuation.bin"), problem.attenuation.view())?;

        let cor_text: String = problem
            .cor
            .iter()
            .map(|v| format!("{v}\n"))
            .collect();
        std::fs::write(work_dir.join("cor.txt"), cor_text)?;

        let (z, y, x) = problem.attenuation.dim();
        let manifest = ProblemManifest {
            proj: &problem.proj,
            psf: &problem.psf,
            object_shape_zyx: [z, y, x],
            iterations: problem.iterations,
            subsets: problem.subsets,
            photopeak: "photopeak.bin",
            scatter: "scatter.bin",
            attenuation: "attenuation.bin",
            cor: "cor.txt",
        };
        std::fs::write(
            work_dir.join("problem.json"),
            serde_json::to_vec_pretty(&manifest)?,
        )?;

        let status = Command::new(&self.executable).arg(work_dir).status()?;
        if !status.success() {
            return Err(PipelineError::ToolFailed {
                tool: self.executable.display().to_string(),
                detail: format!("exited with {status}"),
            });
        }

        let recon = blob::read_f32_volume(work_dir.join("recon.bin"), [z, y, x])?;
        Ok(recon)
    }
}
