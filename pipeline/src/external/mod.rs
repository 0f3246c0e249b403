//! Seams to the external collaborators of the pipeline.
//!
//! The organ segmenter, the physiological TAC solver and the OSEM
//! reconstruction solver are opaque tools: the pipeline owns only their
//! interfaces. Production implementations spawn the configured
//! executables; tests substitute in-process mocks.

pub mod osem;
pub mod segmenter;
pub mod tac;

pub use osem::{CommandOsemSolver, OsemSolver, ProjMeta, PsfMeta, ReconProblem};
pub use segmenter::{OrganSegmenter, TotalSegmentatorCli};
pub use tac::{CommandTacSolver, TacRequest, TacResult, TacSolver};

use std::path::PathBuf;

use crate::config::Config;

/// The set of external tools a pipeline run works with.
pub struct Collaborators {
    pub segmenter: Box<dyn OrganSegmenter>,
    pub tac_solver: Box<dyn TacSolver>,
    pub osem_solver: Box<dyn OsemSolver>,
}

impl Collaborators {
    /// Builds the production (subprocess-backed) collaborators from the
    /// configured executable paths.
    pub fn from_config(config: &Config) -> Self {
        let segmenter = config
            .spect_preprocessing
            .segmenter_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("TotalSegmentator"));
        let tac = config
            .pbpk
            .solver_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("pbpk_solver"));
        let osem = config
            .spect_simulation
            .recon_solver_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("osem_solver"));

        Self {
            segmenter: Box::new(TotalSegmentatorCli { executable: segmenter }),
            tac_solver: Box::new(CommandTacSolver { executable: tac }),
            osem_solver: Box::new(CommandOsemSolver { executable: osem }),
        }
    }
}
