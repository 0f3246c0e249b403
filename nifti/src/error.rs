use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum NiftiError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0} is not a NIfTI-1 file (bad magic or header size).")]
    NotNifti(PathBuf),
    #[error("Big-endian NIfTI files are not supported: {0}")]
    BigEndian(PathBuf),
    #[error("Unsupported NIfTI datatype code {0}.")]
    UnsupportedDatatype(i16),
    #[error("Unsupported NIfTI dimensionality {0:?}; expected a 3-D volume.")]
    UnsupportedDimensions(Vec<usize>),
    #[error("NIfTI data truncated: expected {expected} bytes, found {got}.")]
    TruncatedData { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, NiftiError>;
