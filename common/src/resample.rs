//! Isotropic volume resampling used to bring CT and mask arrays onto the
//! simulation grid. Masks use nearest-neighbour sampling so labels never
//! blend; CT intensities use trilinear sampling.

use ndarray::{Array3, ArrayView3};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoomOrder {
    /// Order-0: nearest neighbour, for label and mask volumes.
    Nearest,
    /// Order-1: trilinear, for intensity volumes.
    Linear,
}

/// Scales a volume by a single factor on all three axes.
///
/// Output dimensions are `round(dim * scale)` (at least 1). Sample positions
/// are centre-aligned: output voxel `i` reads from source coordinate
/// `(i + 0.5) / scale - 0.5`, clamped to the volume.
///
/// # Arguments
///
/// * `arr` - Source volume in (Z, Y, X) order.
/// * `scale` - Zoom factor applied to every axis.
/// * `order` - Sampling order: nearest neighbour for masks, trilinear
///   for intensities.
///
/// # Returns
///
/// The resampled volume with dimensions `round(dim * scale)` per axis.
///
/// # Example
///
/// ```
/// use ndarray::Array3;
/// use tdt_common::resample::{ZoomOrder, zoom3};
///
/// let arr = Array3::<f32>::zeros((2, 4, 4));
/// let out = zoom3(arr.view(), 2.0, ZoomOrder::Nearest);
/// assert_eq!(out.dim(), (4, 8, 8));
/// ```
pub fn zoom3(arr: ArrayView3<'_, f32>, scale: f64, order: ZoomOrder) -> Array3<f32> {
    let (nz, ny, nx) = arr.dim();
    let out_dim = |n: usize| ((n as f64 * scale).round() as usize).max(1);
    let (oz, oy, ox) = (out_dim(nz), out_dim(ny), out_dim(nx));

    let src = |i: usize, n: usize| -> f64 {
        let c = (i as f64 + 0.5) / scale - 0.5;
        c.clamp(0.0, (n - 1) as f64)
    };

    match order {
        ZoomOrder::Nearest => Array3::from_shape_fn((oz, oy, ox), |(z, y, x)| {
            arr[[
                src(z, nz).round() as usize,
                src(y, ny).round() as usize,
                src(x, nx).round() as usize,
            ]]
        }),
        ZoomOrder::Linear => Array3::from_shape_fn((oz, oy, ox), |(z, y, x)| {
            trilinear(&arr, src(z, nz), src(y, ny), src(x, nx))
        }),
    }
}

fn trilinear(arr: &ArrayView3<'_, f32>, z: f64, y: f64, x: f64) -> f32 {
    let (nz, ny, nx) = arr.dim();
    let lo = |c: f64| c.floor() as usize;
    let hi = |c: f64, n: usize| (lo(c) + 1).min(n - 1);

    let (z0, y0, x0) = (lo(z), lo(y), lo(x));
    let (z1, y1, x1) = (hi(z, nz), hi(y, ny), hi(x, nx));
    let (fz, fy, fx) = (z - z0 as f64, y - y0 as f64, x - x0 as f64);

    let at = |z: usize, y: usize, x: usize| arr[[z, y, x]] as f64;

    let c00 = at(z0, y0, x0) * (1.0 - fx) + at(z0, y0, x1) * fx;
    let c01 = at(z0, y1, x0) * (1.0 - fx) + at(z0, y1, x1) * fx;
    let c10 = at(z1, y0, x0) * (1.0 - fx) + at(z1, y0, x1) * fx;
    let c11 = at(z1, y1, x0) * (1.0 - fx) + at(z1, y1, x1) * fx;

    let c0 = c00 * (1.0 - fy) + c01 * fy;
    let c1 = c10 * (1.0 - fy) + c11 * fy;
    (c0 * (1.0 - fz) + c1 * fz) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn identity_scale() {
        let arr = Array3::from_shape_fn((3, 4, 4), |(z, y, x)| (z * 16 + y * 4 + x) as f32);
        assert_eq!(zoom3(arr.view(), 1.0, ZoomOrder::Nearest), arr);
        assert_eq!(zoom3(arr.view(), 1.0, ZoomOrder::Linear), arr);
    }

    #[test]
    fn nearest_upsample_preserves_labels() {
        let mut arr = Array3::zeros((2, 2, 2));
        arr[[1, 1, 1]] = 7.0;
        let out = zoom3(arr.view(), 2.0, ZoomOrder::Nearest);
        assert_eq!(out.dim(), (4, 4, 4));
        // every output value is one of the input labels
        assert!(out.iter().all(|&v| v == 0.0 || v == 7.0));
        assert_eq!(out[[3, 3, 3]], 7.0);
        assert_eq!(out[[0, 0, 0]], 0.0);
    }

    #[test]
    fn linear_downsample_averages() {
        let arr = Array3::from_shape_fn((2, 2, 2), |(_, _, x)| if x == 0 { 0.0 } else { 8.0 });
        let out = zoom3(arr.view(), 0.5, ZoomOrder::Linear);
        assert_eq!(out.dim(), (1, 1, 1));
        assert!((out[[0, 0, 0]] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn output_dims_rounded() {
        let arr = Array3::<f32>::zeros((3, 5, 5));
        let out = zoom3(arr.view(), 1.6, ZoomOrder::Nearest);
        assert_eq!(out.dim(), (5, 8, 8));
    }
}
