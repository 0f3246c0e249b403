//! Raw binary blobs exchanged with the Monte Carlo simulator.
//!
//! All blobs are little-endian `f32` in (Z, Y, X) C-order, with no header.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView3};

#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Blob {path} holds {got} f32 values, expected {expected}.")]
    SizeMismatch {
        path: PathBuf,
        expected: usize,
        got: usize,
    },
}

pub type Result<T> = std::result::Result<T, BlobError>;

/// Writes a flat slice of values as a raw little-endian `f32` blob.
///
/// # Arguments
///
/// * `path` - Destination file; created or truncated.
/// * `values` - The values, written in slice order.
///
/// # Returns
///
/// * `Ok(())` on success.
/// * `Err(BlobError)` if the file cannot be created or written.
///
/// # Examples
///
/// ```
/// use tdt_common::blob::{read_f32_vec, write_f32_slice};
///
/// let dir = std::env::temp_dir().join("tdt-common-blob-doctest");
/// std::fs::create_dir_all(&dir).unwrap();
/// let path = dir.join("values.bin");
///
/// write_f32_slice(&path, &[1.0, 2.5, -3.0]).unwrap();
/// assert_eq!(read_f32_vec(&path).unwrap(), vec![1.0, 2.5, -3.0]);
///
/// std::fs::remove_file(&path).unwrap();
/// ```
pub fn write_f32_slice<P: AsRef<Path>>(path: P, values: &[f32]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path.as_ref())?);
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

/// Writes a volume in logical (Z, Y, X) order, X varying fastest.
///
/// # Arguments
///
/// * `path` - Destination file; created or truncated.
/// * `arr` - The volume; iteration follows the logical axis order
///   regardless of the underlying memory layout.
///
/// # Returns
///
/// * `Ok(())` on success.
/// * `Err(BlobError)` if the file cannot be created or written.
pub fn write_f32_volume<P: AsRef<Path>>(path: P, arr: ArrayView3<'_, f32>) -> Result<()> {
    let mut w = BufWriter::new(File::create(path.as_ref())?);
    for v in arr.iter() {
        w.write_all(&v.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

/// Reads a raw little-endian `f32` blob into a vector.
///
/// # Arguments
///
/// * `path` - The blob file to read.
///
/// # Returns
///
/// * `Ok(Vec<f32>)` with one entry per 4-byte word.
/// * `Err(BlobError)` if the file cannot be read.
///
/// # Errors
///
/// Returns `BlobError::SizeMismatch` if the file size is not a multiple
/// of 4 bytes.
pub fn read_f32_vec<P: AsRef<Path>>(path: P) -> Result<Vec<f32>> {
    let mut bytes = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut bytes)?;
    if bytes.len() % 4 != 0 {
        return Err(BlobError::SizeMismatch {
            path: path.as_ref().to_path_buf(),
            expected: bytes.len() / 4 * 4,
            got: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Reads a raw `f32` blob into a (Z, Y, X) volume of the given shape.
///
/// # Arguments
///
/// * `path` - The blob file to read.
/// * `shape_zyx` - Expected voxel counts per axis, (Z, Y, X) order.
///
/// # Returns
///
/// * `Ok(Array3<f32>)` shaped `shape_zyx`.
/// * `Err(BlobError)` if the file cannot be read.
///
/// # Errors
///
/// Returns `BlobError::SizeMismatch` if the number of values in the file
/// does not equal the product of `shape_zyx`.
pub fn read_f32_volume<P: AsRef<Path>>(path: P, shape_zyx: [usize; 3]) -> Result<Array3<f32>> {
    let values = read_f32_vec(path.as_ref())?;
    let expected = shape_zyx.iter().product::<usize>();
    if values.len() != expected {
        return Err(BlobError::SizeMismatch {
            path: path.as_ref().to_path_buf(),
            expected,
            got: values.len(),
        });
    }
    let arr = Array3::from_shape_vec((shape_zyx[0], shape_zyx[1], shape_zyx[2]), values)
        .expect("shape product already checked");
    Ok(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn volume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.bin");

        let arr = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 100 + y * 10 + x) as f32);
        write_f32_volume(&path, arr.view()).unwrap();

        let bytes = std::fs::metadata(&path).unwrap().len();
        assert_eq!(bytes, 2 * 3 * 4 * 4);

        let back = read_f32_volume(&path, [2, 3, 4]).unwrap();
        assert_eq!(arr, back);
    }

    #[test]
    fn size_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        write_f32_slice(&path, &[1.0, 2.0, 3.0]).unwrap();

        let err = read_f32_volume(&path, [2, 2, 2]).unwrap_err();
        assert!(matches!(
            err,
            BlobError::SizeMismatch {
                expected: 8,
                got: 3,
                ..
            }
        ));
    }

    #[test]
    fn little_endian_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("le.bin");
        write_f32_slice(&path, &[1.0]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, 1.0f32.to_le_bytes());
    }
}
