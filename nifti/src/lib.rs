//! Minimal NIfTI-1 support for the TDT pipeline.
//!
//! Only what the pipeline needs: single-file `.nii` / `.nii.gz` volumes,
//! little-endian, 3-D (trailing singleton dimensions tolerated). Sample
//! values are exposed as `f32` with the scaling slope/intercept applied;
//! volumes are indexed `[z][y][x]`, matching the on-disk order where X
//! varies fastest.

mod error;

pub use error::{NiftiError, Result};

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array3, ArrayView3};

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;
const MAGIC: &[u8; 4] = b"n+1\0";

/// NIfTI-1 sample types the pipeline reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Datatype {
    Uint8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl Datatype {
    pub fn code(&self) -> i16 {
        match self {
            Datatype::Uint8 => 2,
            Datatype::Int16 => 4,
            Datatype::Int32 => 8,
            Datatype::Float32 => 16,
            Datatype::Float64 => 64,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            2 => Some(Datatype::Uint8),
            4 => Some(Datatype::Int16),
            8 => Some(Datatype::Int32),
            16 => Some(Datatype::Float32),
            64 => Some(Datatype::Float64),
            _ => None,
        }
    }

    pub fn bitpix(&self) -> i16 {
        match self {
            Datatype::Uint8 => 8,
            Datatype::Int16 => 16,
            Datatype::Int32 | Datatype::Float32 => 32,
            Datatype::Float64 => 64,
        }
    }

    fn bytes(&self) -> usize {
        (self.bitpix() / 8) as usize
    }
}

/// The header fields the pipeline actually uses. Everything else is
/// zero-filled on write and ignored on read.
#[derive(Clone, Debug, PartialEq)]
pub struct NiftiHeader {
    /// Voxel counts in (X, Y, Z) order, as stored in `dim[1..=3]`.
    pub dim: [usize; 3],
    /// Voxel sizes in millimetres, (X, Y, Z) order, from `pixdim[1..=3]`.
    pub pixdim_mm: [f32; 3],
    pub datatype: Datatype,
    pub scl_slope: f32,
    pub scl_inter: f32,
    /// Affine rows (`srow_x`, `srow_y`, `srow_z`).
    pub srow: [[f32; 4]; 3],
}

impl NiftiHeader {
    /// A header with a diagonal affine built from the voxel spacing.
    pub fn new(dim: [usize; 3], pixdim_mm: [f32; 3]) -> Self {
        let mut srow = [[0.0f32; 4]; 3];
        for i in 0..3 {
            srow[i][i] = pixdim_mm[i];
        }
        Self {
            dim,
            pixdim_mm,
            datatype: Datatype::Float32,
            scl_slope: 1.0,
            scl_inter: 0.0,
            srow,
        }
    }

    /// Voxel spacing reordered to the pipeline's (Z, Y, X) convention.
    pub fn zooms_zyx_mm(&self) -> [f64; 3] {
        [
            self.pixdim_mm[2] as f64,
            self.pixdim_mm[1] as f64,
            self.pixdim_mm[0] as f64,
        ]
    }
}

/// A 3-D volume with its header. `data[[z, y, x]]` holds the sample at
/// voxel (x, y, z) with the scaling slope/intercept already applied.
#[derive(Clone, Debug)]
pub struct NiftiImage {
    pub header: NiftiHeader,
    pub data: Array3<f32>,
}

impl NiftiImage {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        read(path)
    }

    pub fn shape_zyx(&self) -> [usize; 3] {
        let (z, y, x) = self.data.dim();
        [z, y, x]
    }
}

/// Voxel payload for [`write`]; the datatype written to disk follows the
/// variant, not `header.datatype`.
pub enum VoxelData<'a> {
    U8(ArrayView3<'a, u8>),
    I16(ArrayView3<'a, i16>),
    F32(ArrayView3<'a, f32>),
}

impl VoxelData<'_> {
    fn datatype(&self) -> Datatype {
        match self {
            VoxelData::U8(_) => Datatype::Uint8,
            VoxelData::I16(_) => Datatype::Int16,
            VoxelData::F32(_) => Datatype::Float32,
        }
    }

    fn dim_xyz(&self) -> [usize; 3] {
        let (z, y, x) = match self {
            VoxelData::U8(a) => a.dim(),
            VoxelData::I16(a) => a.dim(),
            VoxelData::F32(a) => a.dim(),
        };
        [x, y, z]
    }
}

/// Reads a single-file NIfTI-1 volume, gzip-compressed or plain.
///
/// Compression is detected from the gzip magic bytes, not the file
/// extension. The scaling slope/intercept are applied during the
/// conversion to `f32` (a zero slope is treated as 1, as the format
/// prescribes).
///
/// # Arguments
///
/// * `path` - The `.nii` or `.nii.gz` file to read.
///
/// # Returns
///
/// * `Ok(NiftiImage)` with the parsed header and the volume indexed
///   `[z][y][x]`.
/// * `Err(NiftiError)` if the file cannot be read or decoded.
///
/// # Errors
///
/// * `NiftiError::NotNifti` - bad magic or header size.
/// * `NiftiError::BigEndian` - byte-swapped (big-endian) file.
/// * `NiftiError::UnsupportedDatatype` - sample type outside
///   u8/i16/i32/f32/f64.
/// * `NiftiError::UnsupportedDimensions` - not a 3-D volume (trailing
///   singleton dimensions are tolerated).
/// * `NiftiError::TruncatedData` - file shorter than the header
///   announces.
pub fn read<P: AsRef<Path>>(path: P) -> Result<NiftiImage> {
    let path = path.as_ref();
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;

    // gzip magic
    let bytes = if raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        out
    } else {
        raw
    };

    if bytes.len() < HEADER_SIZE {
        return Err(NiftiError::NotNifti(path.to_path_buf()));
    }

    let sizeof_hdr = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if sizeof_hdr != HEADER_SIZE as i32 {
        // 348 byte-swapped is 1_543_569_408
        if sizeof_hdr.swap_bytes() == HEADER_SIZE as i32 {
            return Err(NiftiError::BigEndian(path.to_path_buf()));
        }
        return Err(NiftiError::NotNifti(path.to_path_buf()));
    }
    if &bytes[344..348] != MAGIC {
        return Err(NiftiError::NotNifti(path.to_path_buf()));
    }

    let i16_at = |o: usize| i16::from_le_bytes(bytes[o..o + 2].try_into().unwrap());
    let f32_at = |o: usize| f32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());

    let ndim = i16_at(40) as usize;
    let mut dims = Vec::with_capacity(ndim);
    for k in 0..ndim.min(7) {
        dims.push(i16_at(42 + 2 * k).max(1) as usize);
    }
    if dims.len() < 3 || dims[3..].iter().any(|&d| d != 1) {
        return Err(NiftiError::UnsupportedDimensions(dims));
    }
    let (nx, ny, nz) = (dims[0], dims[1], dims[2]);

    let datatype = Datatype::from_code(i16_at(70))
        .ok_or_else(|| NiftiError::UnsupportedDatatype(i16_at(70)))?;
    let pixdim_mm = [f32_at(80), f32_at(84), f32_at(88)];
    let vox_offset = (f32_at(108) as usize).max(HEADER_SIZE);
    let scl_slope = f32_at(112);
    let scl_inter = f32_at(116);

    let mut srow = [[0.0f32; 4]; 3];
    for (r, row) in srow.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = f32_at(280 + 16 * r + 4 * c);
        }
    }

    let n = nx * ny * nz;
    let expected = n * datatype.bytes();
    if bytes.len() < vox_offset + expected {
        return Err(NiftiError::TruncatedData {
            expected: vox_offset + expected,
            got: bytes.len(),
        });
    }
    let payload = &bytes[vox_offset..vox_offset + expected];

    let slope = if scl_slope == 0.0 { 1.0 } else { scl_slope };
    let mut values = Vec::with_capacity(n);
    match datatype {
        Datatype::Uint8 => {
            values.extend(payload.iter().map(|&b| b as f32 * slope + scl_inter));
        }
        Datatype::Int16 => {
            values.extend(payload.chunks_exact(2).map(|c| {
                i16::from_le_bytes([c[0], c[1]]) as f32 * slope + scl_inter
            }));
        }
        Datatype::Int32 => {
            values.extend(payload.chunks_exact(4).map(|c| {
                i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 * slope + scl_inter
            }));
        }
        Datatype::Float32 => {
            values.extend(payload.chunks_exact(4).map(|c| {
                f32::from_le_bytes([c[0], c[1], c[2], c[3]]) * slope + scl_inter
            }));
        }
        Datatype::Float64 => {
            values.extend(payload.chunks_exact(8).map(|c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                    * slope
                    + scl_inter
            }));
        }
    }

    // on disk X varies fastest, so the flat buffer is already C-order (Z, Y, X)
    let data = Array3::from_shape_vec((nz, ny, nx), values).expect("length checked above");

    Ok(NiftiImage {
        header: NiftiHeader {
            dim: [nx, ny, nz],
            pixdim_mm,
            datatype,
            scl_slope,
            scl_inter,
            srow,
        },
        data,
    })
}

/// Writes a single-file NIfTI-1 volume; gzip-compressed when the path ends
/// in `.gz`.
///
/// The scaling slope/intercept are written as 1/0 because raw values are
/// stored.
///
/// # Arguments
///
/// * `path` - Destination file; a `.gz` extension selects gzip.
/// * `header` - Supplies the voxel spacing and the affine rows; its
///   datatype field is ignored.
/// * `data` - The voxels; the on-disk datatype and the `dim` fields
///   follow the payload variant and its shape.
///
/// # Returns
///
/// * `Ok(())` once the file has been written.
/// * `Err(NiftiError)` if the file cannot be created or written.
pub fn write<P: AsRef<Path>>(path: P, header: &NiftiHeader, data: VoxelData<'_>) -> Result<()> {
    let path = path.as_ref();
    let mut bytes = encode_header(header, &data);
    encode_payload(&mut bytes, &data);

    let gz = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"));
    let mut file = File::create(path)?;
    if gz {
        let mut enc = GzEncoder::new(&mut file, Compression::default());
        enc.write_all(&bytes)?;
        enc.finish()?;
    } else {
        file.write_all(&bytes)?;
    }
    Ok(())
}

fn encode_header(header: &NiftiHeader, data: &VoxelData<'_>) -> Vec<u8> {
    let mut h = vec![0u8; VOX_OFFSET];
    let put_i16 = |h: &mut [u8], o: usize, v: i16| h[o..o + 2].copy_from_slice(&v.to_le_bytes());
    let put_i32 = |h: &mut [u8], o: usize, v: i32| h[o..o + 4].copy_from_slice(&v.to_le_bytes());
    let put_f32 = |h: &mut [u8], o: usize, v: f32| h[o..o + 4].copy_from_slice(&v.to_le_bytes());

    let datatype = data.datatype();
    let dim = data.dim_xyz();

    put_i32(&mut h, 0, HEADER_SIZE as i32);
    // dim[0] = 3, dim[1..=3] = (x, y, z), remainder 1
    put_i16(&mut h, 40, 3);
    for k in 0..3 {
        put_i16(&mut h, 42 + 2 * k, dim[k] as i16);
    }
    for k in 3..7 {
        put_i16(&mut h, 42 + 2 * k, 1);
    }
    put_i16(&mut h, 70, datatype.code());
    put_i16(&mut h, 72, datatype.bitpix());
    put_f32(&mut h, 76, 1.0); // pixdim[0] (qfac)
    for k in 0..3 {
        put_f32(&mut h, 80 + 4 * k, header.pixdim_mm[k]);
    }
    put_f32(&mut h, 108, VOX_OFFSET as f32);
    put_f32(&mut h, 112, 1.0); // scl_slope
    put_f32(&mut h, 116, 0.0); // scl_inter
    put_i16(&mut h, 254, 1); // sform_code: scanner anatomical
    for (r, row) in header.srow.iter().enumerate() {
        for (c, v) in row.iter().enumerate() {
            put_f32(&mut h, 280 + 16 * r + 4 * c, *v);
        }
    }
    h[344..348].copy_from_slice(MAGIC);
    h
}

fn encode_payload(bytes: &mut Vec<u8>, data: &VoxelData<'_>) {
    match data {
        VoxelData::U8(a) => bytes.extend(a.iter()),
        VoxelData::I16(a) => {
            for v in a.iter() {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        VoxelData::F32(a) => {
            for v in a.iter() {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}
