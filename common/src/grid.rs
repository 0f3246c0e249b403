/// Geometry of the canonical simulation grid.
///
/// Every volume handed to the simulator (CT, body mask, ROI labels,
/// attenuation and activity maps) shares this shape and spacing. Axes are
/// ordered (Z, Y, X); spacing is in centimetres.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimGrid {
    pub shape_zyx: [usize; 3],
    pub spacing_cm_zyx: [f64; 3],
}

impl SimGrid {
    /// Voxel volume in millilitres (1 cm^3 == 1 mL).
    pub fn voxel_volume_ml(&self) -> f64 {
        self.spacing_cm_zyx.iter().product()
    }

    /// Scalar in-plane pixel size (cm), the mean of the Y and X spacings.
    pub fn in_plane_pixel_cm(&self) -> f64 {
        (self.spacing_cm_zyx[1] + self.spacing_cm_zyx[2]) / 2.0
    }

    pub fn num_voxels(&self) -> usize {
        self.shape_zyx.iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::SimGrid;

    #[test]
    fn voxel_volume() {
        let grid = SimGrid {
            shape_zyx: [4, 8, 8],
            spacing_cm_zyx: [0.3, 0.1, 0.2],
        };
        assert!((grid.voxel_volume_ml() - 0.006).abs() < 1e-12);
        assert!((grid.in_plane_pixel_cm() - 0.15).abs() < 1e-12);
        assert_eq!(grid.num_voxels(), 256);
    }
}
