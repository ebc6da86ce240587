//! Geometric primitives shared by the camera models.
//!
//! Batched per-pixel fields are stored one nalgebra matrix per batch element:
//! depth as an H×W plane, 3D points and pixel coordinates as one column per
//! pixel in row-major pixel order (column index `v * width + u`).

use nalgebra::{DMatrix, Isometry3, Matrix2xX, Matrix3xX, Vector2, Vector3};

/// Generate the homogeneous pixel grid for an image of the given size.
///
/// Each column holds `(u, v, 1)` for one pixel, in row-major pixel order.
/// The grid is a deterministic function of the image size and is recomputed
/// per call; callers performing per-pixel work dominate its cost.
pub fn pixel_grid(height: usize, width: usize) -> Matrix3xX<f64> {
    let mut grid = Matrix3xX::zeros(height * width);
    for v in 0..height {
        for u in 0..width {
            let c = v * width + u;
            grid[(0, c)] = u as f64;
            grid[(1, c)] = v as f64;
            grid[(2, c)] = 1.0;
        }
    }
    grid
}

/// Apply a rigid transform to every column of a 3×N point matrix.
pub fn transform_points(pose: &Isometry3<f64>, points: &Matrix3xX<f64>) -> Matrix3xX<f64> {
    let rotation = pose.rotation.to_rotation_matrix();
    let mut transformed = rotation.matrix() * points;
    let translation = pose.translation.vector;
    for mut column in transformed.column_iter_mut() {
        column += translation;
    }
    transformed
}

/// A batch of per-pixel depth planes, the Rust shape of a `[B,1,H,W]` tensor.
#[derive(Debug, Clone)]
pub struct DepthMap {
    planes: Vec<DMatrix<f64>>,
}

impl DepthMap {
    /// Builds a depth map from per-batch H×W planes. All planes must share
    /// one resolution and the batch must be non-empty.
    pub fn new(planes: Vec<DMatrix<f64>>) -> Self {
        assert!(!planes.is_empty(), "depth map batch must be non-empty");
        let (h, w) = planes[0].shape();
        assert!(
            planes.iter().all(|p| p.shape() == (h, w)),
            "all depth planes must share one resolution"
        );
        DepthMap { planes }
    }

    /// Builds a depth map from a flat `[B,C,H,W]`-ordered buffer.
    /// The channel count must be 1; anything else is a contract violation.
    pub fn from_flat(batch: usize, channels: usize, height: usize, width: usize, data: &[f64]) -> Self {
        assert_eq!(channels, 1, "depth maps carry exactly one channel");
        assert_eq!(data.len(), batch * height * width, "buffer length mismatch");
        let planes = (0..batch)
            .map(|b| {
                let plane = &data[b * height * width..(b + 1) * height * width];
                DMatrix::from_row_iterator(height, width, plane.iter().copied())
            })
            .collect();
        DepthMap::new(planes)
    }

    /// A depth map with every pixel at the same value.
    pub fn constant(batch: usize, height: usize, width: usize, value: f64) -> Self {
        DepthMap::new(vec![DMatrix::from_element(height, width, value); batch])
    }

    pub fn batch_size(&self) -> usize {
        self.planes.len()
    }

    pub fn height(&self) -> usize {
        self.planes[0].nrows()
    }

    pub fn width(&self) -> usize {
        self.planes[0].ncols()
    }

    pub fn plane(&self, b: usize) -> &DMatrix<f64> {
        &self.planes[b]
    }

    /// Depth at pixel (u, v) of batch element `b`.
    pub fn depth(&self, b: usize, v: usize, u: usize) -> f64 {
        self.planes[b][(v, u)]
    }
}

/// A batch of per-pixel 3D point grids, the Rust shape of a `[B,3,H,W]` tensor.
#[derive(Debug, Clone)]
pub struct PointField {
    points: Vec<Matrix3xX<f64>>,
    height: usize,
    width: usize,
}

impl PointField {
    pub fn new(points: Vec<Matrix3xX<f64>>, height: usize, width: usize) -> Self {
        assert!(!points.is_empty(), "point field batch must be non-empty");
        assert!(
            points.iter().all(|p| p.ncols() == height * width),
            "every batch element must hold one column per pixel"
        );
        PointField {
            points,
            height,
            width,
        }
    }

    /// Builds a point field from a flat `[B,C,H,W]`-ordered buffer.
    /// The channel count must be 3; anything else is a contract violation.
    pub fn from_flat(batch: usize, channels: usize, height: usize, width: usize, data: &[f64]) -> Self {
        assert_eq!(channels, 3, "point fields carry exactly three channels");
        let pixels = height * width;
        assert_eq!(data.len(), batch * 3 * pixels, "buffer length mismatch");
        let points = (0..batch)
            .map(|b| {
                let base = b * 3 * pixels;
                Matrix3xX::from_fn(pixels, |ch, c| data[base + ch * pixels + c])
            })
            .collect();
        PointField::new(points, height, width)
    }

    pub fn batch_size(&self) -> usize {
        self.points.len()
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn columns(&self, b: usize) -> &Matrix3xX<f64> {
        &self.points[b]
    }

    /// 3D point at pixel (u, v) of batch element `b`.
    pub fn point(&self, b: usize, v: usize, u: usize) -> Vector3<f64> {
        self.points[b].column(v * self.width + u).into_owned()
    }

    /// Applies `pose` to every point of every batch element.
    pub fn transformed(&self, poses: &[Isometry3<f64>]) -> PointField {
        assert_eq!(poses.len(), self.points.len(), "one pose per batch element");
        let points = self
            .points
            .iter()
            .zip(poses)
            .map(|(pts, pose)| transform_points(pose, pts))
            .collect();
        PointField::new(points, self.height, self.width)
    }
}

/// A batch of per-pixel 2D coordinates normalized to [-1, 1], the Rust shape
/// of a `[B,H,W,2]` sampling grid. Out-of-bounds coordinates are kept as-is;
/// masking is the sampler's job.
#[derive(Debug, Clone)]
pub struct PixelField {
    coords: Vec<Matrix2xX<f64>>,
    height: usize,
    width: usize,
}

impl PixelField {
    pub fn new(coords: Vec<Matrix2xX<f64>>, height: usize, width: usize) -> Self {
        assert!(!coords.is_empty(), "pixel field batch must be non-empty");
        assert!(
            coords.iter().all(|c| c.ncols() == height * width),
            "every batch element must hold one column per pixel"
        );
        PixelField {
            coords,
            height,
            width,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.coords.len()
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn columns(&self, b: usize) -> &Matrix2xX<f64> {
        &self.coords[b]
    }

    /// Normalized coordinates at pixel (u, v) of batch element `b`.
    pub fn pixel(&self, b: usize, v: usize, u: usize) -> Vector2<f64> {
        self.coords[b].column(v * self.width + u).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    #[test]
    fn test_pixel_grid_layout() {
        let grid = pixel_grid(2, 3);
        assert_eq!(grid.ncols(), 6);
        // pixel (u=2, v=1) lives at column 1*3+2
        let c = grid.column(5);
        assert_relative_eq!(c[0], 2.0);
        assert_relative_eq!(c[1], 1.0);
        assert_relative_eq!(c[2], 1.0);
    }

    #[test]
    fn test_transform_points_round_trip() {
        let pose = Isometry3::from_parts(
            Translation3::new(0.3, -1.2, 2.0),
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.4),
        );
        let points = pixel_grid(4, 5);
        let there = transform_points(&pose, &points);
        let back = transform_points(&pose.inverse(), &there);
        for c in 0..points.ncols() {
            assert_relative_eq!(points[(0, c)], back[(0, c)], epsilon = 1e-12);
            assert_relative_eq!(points[(1, c)], back[(1, c)], epsilon = 1e-12);
            assert_relative_eq!(points[(2, c)], back[(2, c)], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_depth_map_from_flat() {
        let data: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let depth = DepthMap::from_flat(2, 1, 2, 3, &data);
        assert_eq!(depth.batch_size(), 2);
        assert_eq!(depth.height(), 2);
        assert_eq!(depth.width(), 3);
        assert_relative_eq!(depth.depth(0, 0, 0), 0.0);
        assert_relative_eq!(depth.depth(0, 1, 2), 5.0);
        assert_relative_eq!(depth.depth(1, 0, 1), 7.0);
    }

    #[test]
    #[should_panic(expected = "exactly one channel")]
    fn test_depth_map_rejects_multichannel() {
        let data = vec![0.0; 2 * 3 * 4];
        let _ = DepthMap::from_flat(1, 2, 3, 4, &data);
    }

    #[test]
    fn test_point_field_from_flat() {
        // one batch element, 1x2 image, channels-first layout
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let field = PointField::from_flat(1, 3, 1, 2, &data);
        let p = field.point(0, 0, 1);
        assert_relative_eq!(p.x, 2.0);
        assert_relative_eq!(p.y, 4.0);
        assert_relative_eq!(p.z, 6.0);
    }

    #[test]
    #[should_panic(expected = "exactly three channels")]
    fn test_point_field_rejects_wrong_channels() {
        let data = vec![0.0; 4];
        let _ = PointField::from_flat(1, 1, 2, 2, &data);
    }
}
