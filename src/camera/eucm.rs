//! Extended Unified Camera Model (EUCM).
//!
//! Implements the generalized wide-FOV projection used by the
//! structure-from-motion pipeline: per-pixel reconstruction of 3D points from
//! a depth map and reprojection of 3D points into normalized sampling
//! coordinates. Both directions run over whole per-batch pixel fields so the
//! same routine serves every element of a training batch.
//!
//! # References
//!
//! The Extended Unified Camera Model is based on:
//! "An Enhanced Unified Camera Model" by Bogdan Khomutenko, Gaëtan Garcia,
//! and Philippe Martinet.

use crate::camera::{validation, CameraModelError, Frame, Intrinsics, Resolution};
use crate::geometry::{pixel_grid, transform_points, DepthMap, PixelField, PointField};
use log::info;
use nalgebra::{DVector, Isometry3, Matrix2xX, Matrix3, Matrix3xX};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::fmt;
use std::fs;
use std::io::Write;
use yaml_rust::YamlLoader;

/// Floor applied to ray/point z-components before they are used as divisors.
/// Near-grazing rays would otherwise blow up the division.
const Z_FLOOR: f64 = 1e-5;

/// EUCM intrinsic parameters for one camera.
///
/// Extends the pinhole [`Intrinsics`] with the two shape parameters of the
/// generalized projection curve: `alpha` controls the blend between the
/// perspective and spherical projections and must lie in `[0, 1]`; `beta`
/// stretches the projection sphere and must be positive.
///
/// # Examples
///
/// ```rust
/// use nalgebra::DVector;
/// use sfm_tools::camera::eucm::EucmIntrinsics;
///
/// // Parameters: fx, fy, cx, cy, alpha, beta
/// let params = DVector::from_vec(vec![460.0, 460.0, 376.0, 240.0, 0.6, 1.05]);
/// let eucm = EucmIntrinsics::new(&params).unwrap();
/// assert_eq!(eucm.intrinsics.fx, 460.0);
/// assert_eq!(eucm.alpha, 0.6);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct EucmIntrinsics {
    /// Camera intrinsic parameters: `fx`, `fy`, `cx`, `cy`.
    pub intrinsics: Intrinsics,
    /// Image resolution as width and height in pixels.
    pub resolution: Resolution,
    /// Projection blend parameter, must lie in `[0, 1]`.
    pub alpha: f64,
    /// Sphere stretch parameter, must be positive.
    pub beta: f64,
}

impl EucmIntrinsics {
    /// Creates EUCM intrinsics from a `[fx, fy, cx, cy, alpha, beta]` vector.
    ///
    /// The resolution is initialized to 0x0 and should be set manually or by
    /// loading from YAML.
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() != 6 {
            return Err(CameraModelError::InvalidParams(format!(
                "EUCM expects 6 parameters, got {}",
                parameters.len()
            )));
        }

        let model = EucmIntrinsics {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            alpha: parameters[4],
            beta: parameters[5],
        };

        info!("new EUCM intrinsics: {:?}", model);
        Ok(model)
    }

    /// Returns the parameters as a `[fx, fy, cx, cy, alpha, beta]` vector.
    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.alpha,
            self.beta,
        ])
    }

    /// Validates the intrinsics and the EUCM shape parameters.
    pub fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_eucm_shape(self.alpha, self.beta)
    }

    /// Loads EUCM intrinsics from a Kalibr-style YAML file.
    ///
    /// Parameters are expected under `cam0` with an `intrinsics` array
    /// `[fx, fy, cx, cy, alpha, beta]` and a `resolution` array `[w, h]`.
    pub fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;

        if docs.is_empty() {
            return Err(CameraModelError::InvalidParams(
                "Empty YAML document".to_string(),
            ));
        }
        let doc = &docs[0];

        let intrinsics_yaml = doc["cam0"]["intrinsics"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams(
                "YAML missing 'intrinsics' array under 'cam0'".to_string(),
            )
        })?;
        let resolution_yaml = doc["cam0"]["resolution"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams(
                "YAML missing 'resolution' array under 'cam0'".to_string(),
            )
        })?;

        if intrinsics_yaml.len() < 6 {
            return Err(CameraModelError::InvalidParams(
                "Intrinsics array in YAML must have at least 6 elements (fx, fy, cx, cy, alpha, beta)"
                    .to_string(),
            ));
        }
        if resolution_yaml.len() < 2 {
            return Err(CameraModelError::InvalidParams(
                "Resolution array in YAML must have at least 2 elements (width, height)".to_string(),
            ));
        }

        let scalar = |i: usize, name: &str| {
            intrinsics_yaml[i].as_f64().ok_or_else(|| {
                CameraModelError::InvalidParams(format!("Invalid {name} in YAML: not a float"))
            })
        };

        let model = EucmIntrinsics {
            intrinsics: Intrinsics {
                fx: scalar(0, "fx")?,
                fy: scalar(1, "fy")?,
                cx: scalar(2, "cx")?,
                cy: scalar(3, "cy")?,
            },
            resolution: Resolution {
                width: resolution_yaml[0].as_i64().ok_or_else(|| {
                    CameraModelError::InvalidParams(
                        "Invalid width in YAML: not an integer".to_string(),
                    )
                })? as u32,
                height: resolution_yaml[1].as_i64().ok_or_else(|| {
                    CameraModelError::InvalidParams(
                        "Invalid height in YAML: not an integer".to_string(),
                    )
                })? as u32,
            },
            alpha: scalar(4, "alpha")?,
            beta: scalar(5, "beta")?,
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Saves the intrinsics to a Kalibr-style YAML file, under `cam0` with
    /// the same array layout accepted by [`EucmIntrinsics::load_from_yaml`].
    pub fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let yaml = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::to_value(serde_yaml::Mapping::from_iter([
                (
                    serde_yaml::Value::String("camera_model".to_string()),
                    serde_yaml::Value::String("eucm".to_string()),
                ),
                (
                    serde_yaml::Value::String("intrinsics".to_string()),
                    serde_yaml::to_value(vec![
                        self.intrinsics.fx,
                        self.intrinsics.fy,
                        self.intrinsics.cx,
                        self.intrinsics.cy,
                        self.alpha,
                        self.beta,
                    ])
                    .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
                ),
                (
                    serde_yaml::Value::String("resolution".to_string()),
                    serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])
                        .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
                ),
            ]))
            .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
        )]))
        .map_err(|e| CameraModelError::YamlError(e.to_string()))?;

        let yaml_string =
            serde_yaml::to_string(&yaml).map_err(|e| CameraModelError::YamlError(e.to_string()))?;

        let mut file =
            fs::File::create(path).map_err(|e| CameraModelError::IOError(e.to_string()))?;
        file.write_all(yaml_string.as_bytes())
            .map_err(|e| CameraModelError::IOError(e.to_string()))?;

        Ok(())
    }
}

impl fmt::Debug for EucmIntrinsics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EUCM [fx: {} fy: {} cx: {} cy: {} alpha: {} beta: {}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.alpha,
            self.beta
        )
    }
}

/// Placeholder calibration for images without metadata: unit-scale focal
/// lengths of 1000 px and the principal point at the image center.
pub fn dummy_calibration(width: u32, height: u32) -> Matrix3<f64> {
    let cx = width as f64 / 2.0 - 0.5;
    let cy = height as f64 / 2.0 - 0.5;
    Matrix3::new(1000.0, 0.0, cx, 0.0, 1000.0, cy, 0.0, 0.0, 1.0)
}

/// Batched EUCM camera: one set of intrinsics and one camera←world pose per
/// batch element. Immutable after construction; one instance serves exactly
/// one forward pass.
pub struct EucmCamera {
    intrinsics: Vec<EucmIntrinsics>,
    /// Camera ← world transforms, one per batch element.
    tcw: Vec<Isometry3<f64>>,
    /// World ← camera transforms, inverted from `tcw` at most once.
    twc: OnceCell<Vec<Isometry3<f64>>>,
}

impl EucmCamera {
    /// Creates a batched camera with identity extrinsics.
    pub fn new(intrinsics: Vec<EucmIntrinsics>) -> Result<Self, CameraModelError> {
        let batch = intrinsics.len();
        Self::with_pose(intrinsics, vec![Isometry3::identity(); batch])
    }

    /// Creates a batched camera with one camera←world pose per batch element.
    pub fn with_pose(
        intrinsics: Vec<EucmIntrinsics>,
        tcw: Vec<Isometry3<f64>>,
    ) -> Result<Self, CameraModelError> {
        if intrinsics.is_empty() {
            return Err(CameraModelError::InvalidParams(
                "camera batch must be non-empty".to_string(),
            ));
        }
        if intrinsics.len() != tcw.len() {
            return Err(CameraModelError::BatchSizeMismatch {
                camera: intrinsics.len(),
                input: tcw.len(),
            });
        }
        Ok(EucmCamera {
            intrinsics,
            tcw,
            twc: OnceCell::new(),
        })
    }

    /// Batch size of the camera intrinsics.
    pub fn batch_size(&self) -> usize {
        self.intrinsics.len()
    }

    pub fn intrinsics(&self) -> &[EucmIntrinsics] {
        &self.intrinsics
    }

    /// Camera ← world poses.
    pub fn tcw(&self) -> &[Isometry3<f64>] {
        &self.tcw
    }

    /// World ← camera poses, memoized inverse of [`EucmCamera::tcw`].
    pub fn twc(&self) -> &[Isometry3<f64>] {
        self.twc
            .get_or_init(|| self.tcw.iter().map(|t| t.inverse()).collect())
    }

    fn check_batch(&self, input: usize) -> Result<(), CameraModelError> {
        if input != self.batch_size() {
            return Err(CameraModelError::BatchSizeMismatch {
                camera: self.batch_size(),
                input,
            });
        }
        Ok(())
    }

    /// Reconstructs pixel-wise 3D points from a depth map.
    ///
    /// Every pixel is unprojected to a unit ray through the EUCM inverse
    /// model, rescaled to unit z, and multiplied by its depth. With
    /// `Frame::World` the points are additionally moved through the
    /// world←camera pose.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if any batch element's `alpha`
    ///   is NaN — a degenerated upstream prediction must surface here rather
    ///   than leak NaN into the loss.
    /// * [`CameraModelError::BatchSizeMismatch`] if the depth batch differs
    ///   from the camera batch.
    pub fn reconstruct(
        &self,
        depth: &DepthMap,
        frame: Frame,
    ) -> Result<PointField, CameraModelError> {
        self.check_batch(depth.batch_size())?;

        if self.intrinsics.iter().any(|i| i.alpha.is_nan()) {
            return Err(CameraModelError::InvalidParams("alpha is NaN".to_string()));
        }

        let height = depth.height();
        let width = depth.width();
        let grid = pixel_grid(height, width);

        let mut batch_points = Vec::with_capacity(self.batch_size());
        for (b, eucm) in self.intrinsics.iter().enumerate() {
            let Intrinsics { fx, fy, cx, cy } = eucm.intrinsics.clone();
            let (alpha, beta) = (eucm.alpha, eucm.beta);
            let plane = depth.plane(b);

            let mut points = Matrix3xX::zeros(height * width);
            for c in 0..grid.ncols() {
                let u = grid[(0, c)];
                let v = grid[(1, c)];

                let mx = (u - cx) / fx;
                let my = (v - cy) / fy;
                let r_squared = mx * mx + my * my;
                // Discriminant clamped at zero so degenerate rays fall into
                // the z-floor path instead of producing NaN.
                let det = (1.0 - (2.0 * alpha - 1.0) * beta * r_squared).max(0.0);
                let mz = (1.0 - beta * alpha * alpha * r_squared)
                    / (alpha * det.sqrt() + (1.0 - alpha));

                let norm = (mx * mx + my * my + mz * mz).sqrt();
                let z = (mz / norm).max(Z_FLOOR);
                let x_norm = (mx / norm) / z;
                let y_norm = (my / norm) / z;

                let d = plane[(v as usize, u as usize)];
                points[(0, c)] = x_norm * d;
                points[(1, c)] = y_norm * d;
                points[(2, c)] = d;
            }

            match frame {
                Frame::Camera => batch_points.push(points),
                Frame::World => batch_points.push(transform_points(&self.twc()[b], &points)),
            }
        }

        Ok(PointField::new(batch_points, height, width))
    }

    /// Projects 3D points onto the image plane.
    ///
    /// Returns per-pixel coordinates normalized to `[-1, 1]` in both axes,
    /// the convention expected by a grid sampler. Out-of-bounds coordinates
    /// are not clipped; masking is the sampler's responsibility. With
    /// `Frame::World` the points are first moved through the camera←world
    /// pose.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::BatchSizeMismatch`] if the point batch differs
    ///   from the camera batch.
    pub fn project(&self, points: &PointField, frame: Frame) -> Result<PixelField, CameraModelError> {
        self.check_batch(points.batch_size())?;

        let camera_points;
        let points = match frame {
            Frame::Camera => points,
            Frame::World => {
                camera_points = points.transformed(&self.tcw);
                &camera_points
            }
        };

        let height = points.height();
        let width = points.width();
        let (w, h) = (width as f64, height as f64);

        let mut batch_coords = Vec::with_capacity(self.batch_size());
        for (b, eucm) in self.intrinsics.iter().enumerate() {
            let Intrinsics { fx, fy, cx, cy } = eucm.intrinsics.clone();
            let (alpha, beta) = (eucm.alpha, eucm.beta);
            let columns = points.columns(b);

            let mut coords = Matrix2xX::zeros(height * width);
            for c in 0..columns.ncols() {
                let x = columns[(0, c)];
                let y = columns[(1, c)];
                let z = columns[(2, c)];

                let d = (beta * (x * x + y * y) + z * z).sqrt();
                let z = z.max(Z_FLOOR);
                let denom = alpha * d + (1.0 - alpha) * z;

                let u = fx * x / denom + cx;
                let v = fy * y / denom + cy;
                coords[(0, c)] = 2.0 * u / w - 1.0;
                coords[(1, c)] = 2.0 * v / h - 1.0;
            }
            batch_coords.push(coords);
        }

        Ok(PixelField::new(batch_coords, height, width))
    }
}
