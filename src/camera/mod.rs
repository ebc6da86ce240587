//! Camera models and shared camera types.
//!
//! This module defines the intrinsic parameter types, the reference-frame
//! selector used by reconstruction/projection, and the error type shared by
//! all camera code. The Extended Unified Camera Model lives in the
//! [`eucm`] submodule ([`crate::camera::eucm`]).

pub mod eucm;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub use eucm::{EucmCamera, EucmIntrinsics};

/// Core pinhole intrinsic parameters: focal lengths and principal point,
/// all in pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Image resolution in pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Unknown reference frame: {0}")]
    UnknownReferenceFrame(String),
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Batch size mismatch: camera has {camera} elements, input has {input}")]
    BatchSizeMismatch { camera: usize, input: usize },
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Reference frame for reconstructed or projected points.
///
/// `Camera` keeps points in the camera frame; `World` routes them through the
/// camera's extrinsic pose. Parsing from the short string tags used in
/// configuration (`"c"` / `"camera"`, `"w"` / `"world"`) fails with
/// [`CameraModelError::UnknownReferenceFrame`] on anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Camera,
    World,
}

impl FromStr for Frame {
    type Err = CameraModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" | "camera" => Ok(Frame::Camera),
            "w" | "world" => Ok(Frame::World),
            other => Err(CameraModelError::UnknownReferenceFrame(other.to_string())),
        }
    }
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    /// Validates the EUCM shape parameters. Values outside the model's domain
    /// (alpha outside [0,1], beta not positive) produce NaN geometry downstream.
    pub fn validate_eucm_shape(alpha: f64, beta: f64) -> Result<(), CameraModelError> {
        if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
            return Err(CameraModelError::InvalidParams(
                "alpha must be finite and within [0, 1]".to_string(),
            ));
        }
        if !beta.is_finite() || beta <= 0.0 {
            return Err(CameraModelError::InvalidParams(
                "beta must be finite and positive".to_string(),
            ));
        }
        Ok(())
    }
}
