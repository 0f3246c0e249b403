use std::path::PathBuf;

/// Pipeline-wide error type. Each stage failure maps onto one of these
/// kinds; the driver reports the error together with the CT index and
/// moves on to the next CT of the batch.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(
        "Unsupported CT input. Provide a DICOM directory or a NIfTI file (.nii/.nii.gz). Got: {0}"
    )]
    BadInput(PathBuf),
    #[error("Invalid ROI(s): {invalid:?}. Allowed: {allowed:?}")]
    InvalidRoi {
        invalid: Vec<String>,
        allowed: Vec<&'static str>,
    },
    #[error("Context missing required fields: [{0}]")]
    MissingContextField(String),
    #[error("Segmentation output not found for task '{task}': {path}")]
    SegmentationMissingOutput { task: &'static str, path: PathBuf },
    #[error("Shape mismatch ({what}): {a:?} vs {b:?}")]
    ShapeMismatch {
        what: String,
        a: Vec<usize>,
        b: Vec<usize>,
    },
    #[error("Lesion placement failed in ROI '{roi}': {detail}")]
    LesionPlacementFailed { roi: String, detail: String },
    #[error("Segmentation has no non-zero labels after ROI filtering.")]
    EmptySegmentation,
    #[error("No VOI mapping for ROI '{roi}' and no 'Rest' VOI among the PBPK observables {observables:?}.")]
    NoVoiMapping {
        roi: String,
        observables: Vec<String>,
    },
    #[error("Simulator process failed: {0}")]
    SimulatorProcessFailed(String),
    #[error("Unable to parse sensitivity from calibration file: {0}")]
    CalibrationParseFailed(PathBuf),
    #[error("{tool} failed: {detail}")]
    ToolFailed { tool: String, detail: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("DICOM error: {0}")]
    Dicom(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Nifti(#[from] tdt_nifti::NiftiError),
    #[error(transparent)]
    Label(#[from] tdt_common::labels::LabelError),
    #[error(transparent)]
    Blob(#[from] tdt_common::blob::BlobError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
