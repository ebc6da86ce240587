//! SfM Tools Library
//!
//! Components of a self-supervised structure-from-motion pipeline:
//! - Differentiable Extended Unified Camera Model (EUCM) geometry:
//!   depth-map reconstruction to 3D points and reprojection to normalized
//!   sampling coordinates
//! - EuRoC-style session dataset with temporal-context indexing and optional
//!   ground-truth depth attachment
//! - A composed training model pairing a depth/pose network with a
//!   multi-view photometric loss strategy

pub mod camera;
pub mod dataset;
pub mod geometry;
pub mod model;

// Re-export commonly used types
pub use camera::{
    CameraModelError, EucmCamera, EucmIntrinsics, Frame, Intrinsics, Resolution,
};

pub use dataset::{DatasetConfig, DatasetError, DepthLoaderRegistry, EurocDataset, Sample};

pub use geometry::{pixel_grid, DepthMap, PixelField, PointField};

pub use model::{
    Batch, DepthPoseNetwork, LossMetrics, LossOutput, ModelError, ModelOutput, PhotometricLoss,
    Predictions, SelfSupModel,
};
