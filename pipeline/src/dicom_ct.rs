//! DICOM CT series handling: conversion to the standardized NIfTI volume
//! and extraction of the patient metadata the PBPK model can use.

use std::path::Path;

use dicom_dictionary_std::tags::{
    IMAGE_POSITION_PATIENT, INSTANCE_NUMBER, PATIENT_SIZE, PATIENT_WEIGHT, PIXEL_DATA,
    PIXEL_SPACING, SLICE_THICKNESS,
};
use dicom_object::OpenFileOptions;
use dicom_pixeldata::PixelDecoder;
use ndarray::{Array2, Array3};
use tdt_nifti::{NiftiHeader, VoxelData};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

fn dicom_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Dicom(e.to_string())
}

struct CtSlice {
    z: f64,
    instance: i64,
    origin: [f64; 3],
    /// (row, column) spacing in mm.
    spacing_mm: [f64; 2],
    thickness_mm: Option<f64>,
    /// Hounsfield units, shape (rows, columns).
    pixels: Array2<f32>,
}

fn series_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn read_slice(path: &Path) -> Result<CtSlice> {
    let obj = dicom_object::open_file(path).map_err(dicom_err)?;

    let position = obj
        .element(IMAGE_POSITION_PATIENT)
        .map_err(dicom_err)?
        .to_multi_float64()
        .map_err(dicom_err)?;
    if position.len() != 3 {
        return Err(PipelineError::Dicom(format!(
            "ImagePositionPatient has {} components in {}",
            position.len(),
            path.display()
        )));
    }

    let instance = obj
        .element_opt(INSTANCE_NUMBER)
        .map_err(dicom_err)?
        .and_then(|e| e.to_int::<i64>().ok())
        .unwrap_or(0);

    let spacing = obj
        .element(PIXEL_SPACING)
        .map_err(dicom_err)?
        .to_multi_float64()
        .map_err(dicom_err)?;
    if spacing.len() != 2 {
        return Err(PipelineError::Dicom(format!(
            "PixelSpacing has {} components in {}",
            spacing.len(),
            path.display()
        )));
    }

    let thickness = obj
        .element_opt(SLICE_THICKNESS)
        .map_err(dicom_err)?
        .and_then(|e| e.to_float64().ok());

    // modality LUT (rescale slope/intercept) is applied by the float
    // conversion, so the values are already Hounsfield units
    let decoded = obj.decode_pixel_data().map_err(dicom_err)?;
    let (rows, cols) = (decoded.rows() as usize, decoded.columns() as usize);
    let values = decoded.to_vec::<f32>().map_err(dicom_err)?;
    if values.len() != rows * cols {
        return Err(PipelineError::Dicom(format!(
            "Unexpected pixel count {} for a {rows}x{cols} slice in {}",
            values.len(),
            path.display()
        )));
    }
    let pixels = Array2::from_shape_vec((rows, cols), values).map_err(dicom_err)?;

    Ok(CtSlice {
        z: position[2],
        instance,
        origin: [position[0], position[1], position[2]],
        spacing_mm: [spacing[0], spacing[1]],
        thickness_mm: thickness,
        pixels,
    })
}

/// Converts a DICOM CT series directory into a single NIfTI volume.
///
/// Slices are ordered by their axial position (instance number breaking
/// ties); voxel values are Hounsfield units. The affine is diagonal with
/// the origin at the first slice position. Unreadable files in the
/// directory are skipped with a warning.
///
/// # Arguments
///
/// * `dir` - Directory holding the DICOM slice files of one series.
/// * `output` - Destination NIfTI path (`.nii` or `.nii.gz`).
///
/// # Returns
///
/// * `Ok(())` once the volume has been written.
/// * `Err(PipelineError)` if the directory holds no readable CT slices,
///   the slices disagree on matrix size, or the output cannot be
///   written.
pub fn convert_series_to_nifti(dir: &Path, output: &Path) -> Result<()> {
    let files = series_files(dir)?;
    if files.is_empty() {
        return Err(PipelineError::Dicom(format!(
            "No DICOM files found in {}",
            dir.display()
        )));
    }

    let mut slices = Vec::with_capacity(files.len());
    for file in &files {
        match read_slice(file) {
            Ok(slice) => slices.push(slice),
            Err(e) => {
                warn!("Skipping {}: {e}", file.display());
            }
        }
    }
    if slices.is_empty() {
        return Err(PipelineError::Dicom(format!(
            "No readable CT slices in {}",
            dir.display()
        )));
    }

    slices.sort_by(|a, b| {
        a.z.partial_cmp(&b.z)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.instance.cmp(&b.instance))
    });

    let (rows, cols) = slices[0].pixels.dim();
    for s in &slices[1..] {
        if s.pixels.dim() != (rows, cols) {
            return Err(PipelineError::Dicom(
                "CT slices disagree on matrix size".into(),
            ));
        }
    }

    let dz = if slices.len() > 1 {
        (slices[1].z - slices[0].z).abs()
    } else {
        slices[0].thickness_mm.unwrap_or(1.0)
    };
    let dz = if dz > 0.0 {
        dz
    } else {
        slices[0].thickness_mm.unwrap_or(1.0)
    };

    let nz = slices.len();
    let mut volume = Array3::<f32>::zeros((nz, rows, cols));
    for (z, slice) in slices.iter().enumerate() {
        volume
            .index_axis_mut(ndarray::Axis(0), z)
            .assign(&slice.pixels);
    }

    // (row, col) spacing maps to (y, x)
    let pixdim_mm = [
        slices[0].spacing_mm[1] as f32,
        slices[0].spacing_mm[0] as f32,
        dz as f32,
    ];
    let mut header = NiftiHeader::new([cols, rows, nz], pixdim_mm);
    for (axis, row) in header.srow.iter_mut().enumerate() {
        row[3] = slices[0].origin[axis] as f32;
    }

    debug!(
        "Converted {} slices ({rows}x{cols}) with spacing {pixdim_mm:?} mm",
        nz
    );
    tdt_nifti::write(output, &header, VoxelData::F32(volume.view()))?;
    Ok(())
}

/// Best-effort extraction of `PatientSize` (m) and `PatientWeight` (kg)
/// from a DICOM directory.
///
/// Files are read without their pixel data to keep the scan cheap, in
/// the same way the series conversion reads metadata.
///
/// # Arguments
///
/// * `dir` - Directory holding the DICOM slice files of one series.
///
/// # Returns
///
/// `(height_m, weight_kg)` from the first of (at most) 50 files carrying
/// at least one positive value; either entry may be `None`. Never fails:
/// unreadable files and missing tags simply yield `(None, None)`.
pub fn extract_height_weight(dir: &Path) -> (Option<f64>, Option<f64>) {
    let Ok(files) = series_files(dir) else {
        return (None, None);
    };

    for path in files.iter().take(50) {
        let Ok(obj) = OpenFileOptions::new()
            .read_until(PIXEL_DATA)
            .open_file(path)
        else {
            continue;
        };

        let positive = |v: f64| if v > 0.0 { Some(v) } else { None };
        let height = obj
            .element_opt(PATIENT_SIZE)
            .ok()
            .flatten()
            .and_then(|e| e.to_float64().ok())
            .and_then(positive);
        let weight = obj
            .element_opt(PATIENT_WEIGHT)
            .ok()
            .flatten()
            .and_then(|e| e.to_float64().ok())
            .and_then(positive);

        if height.is_some() || weight.is_some() {
            return (height, weight);
        }
    }
    (None, None)
}
