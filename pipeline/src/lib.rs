//! Theranostic digital twin pipeline.
//!
//! Transforms a patient CT (DICOM series or NIfTI) into a simulated
//! quantitative SPECT reconstruction: organ segmentation, ROI unification,
//! optional synthetic lesion insertion, simulation-grid preprocessing,
//! PBPK activity modelling, Monte Carlo projection simulation, and OSEM
//! reconstruction.

pub mod config;
pub mod context;
pub mod dicom_ct;
pub mod driver;
pub mod error;
pub mod external;
pub mod stages;

pub use config::{Config, Mode};
pub use context::Context;
pub use driver::{CtInputKind, CtWorkspace, RunOptions, TdtPipeline};
pub use error::{PipelineError, Result};
