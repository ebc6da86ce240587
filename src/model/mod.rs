//! Training-model composition.
//!
//! The original pipeline wired depth/pose prediction and the self-supervised
//! loss through an inheritance chain; here they are explicit collaborators: a
//! [`DepthPoseNetwork`] produces inverse depth, relative poses, and
//! intrinsics from a batch, and a [`PhotometricLoss`] strategy consumes them.
//! [`SelfSupModel`] composes the two and gates loss computation on its
//! training flag.

use image::RgbImage;
use log::debug;
use nalgebra::{DVector, Isometry3};

use crate::geometry::DepthMap;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("Training batch has no context images")]
    MissingContext,
    #[error("Depth/pose network failure: {0}")]
    Network(String),
    #[error("Photometric loss failure: {0}")]
    Loss(String),
}

/// One training batch: reference images and, when temporal context is
/// configured, the context images grouped per offset.
pub struct Batch {
    /// Reference image per batch element.
    pub rgb: Vec<RgbImage>,
    /// Context images, outer index per context offset, inner per batch
    /// element.
    pub rgb_context: Option<Vec<Vec<RgbImage>>>,
}

/// Output of the depth/pose network for one batch.
pub struct Predictions {
    /// Inverse depth maps, one per prediction scale.
    pub inv_depths: Vec<DepthMap>,
    /// Relative pose reference→context, outer index per context offset,
    /// inner per batch element.
    pub poses: Vec<Vec<Isometry3<f64>>>,
    /// Predicted or calibrated `[fx, fy, cx, cy, alpha, beta]` per batch
    /// element.
    pub intrinsics: Vec<DVector<f64>>,
    /// Metrics reported by the prediction stage itself (e.g. a supervised
    /// term), merged with the loss metrics downstream.
    pub metrics: LossMetrics,
}

/// The fixed set of optional metric fields flowing out of a forward pass.
///
/// Replaces the original free-form metric dictionaries: merging is
/// field-by-field, so a collision is visible at the type level instead of one
/// value silently shadowing the other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossMetrics {
    pub photometric_loss: Option<f64>,
    pub smoothness_loss: Option<f64>,
    pub supervised_loss: Option<f64>,
    pub supervised_num_valid: Option<f64>,
}

impl LossMetrics {
    /// Field-by-field merge. When both sides carry a value the right-hand
    /// side wins; in debug builds that collision trips an assertion.
    pub fn merged_with(self, other: LossMetrics) -> LossMetrics {
        fn merge(name: &str, a: Option<f64>, b: Option<f64>) -> Option<f64> {
            debug_assert!(
                a.is_none() || b.is_none(),
                "metric {name} set by both sides of a merge"
            );
            b.or(a)
        }
        LossMetrics {
            photometric_loss: merge(
                "photometric_loss",
                self.photometric_loss,
                other.photometric_loss,
            ),
            smoothness_loss: merge("smoothness_loss", self.smoothness_loss, other.smoothness_loss),
            supervised_loss: merge("supervised_loss", self.supervised_loss, other.supervised_loss),
            supervised_num_valid: merge(
                "supervised_num_valid",
                self.supervised_num_valid,
                other.supervised_num_valid,
            ),
        }
    }
}

/// Loss value plus its metrics and optional per-step log scalars.
pub struct LossOutput {
    pub loss: f64,
    pub metrics: LossMetrics,
    pub logs: Vec<(String, f64)>,
}

/// Everything a forward pass produces. `loss` is `None` in eval mode.
pub struct ModelOutput {
    pub predictions: Predictions,
    pub loss: Option<f64>,
    pub metrics: LossMetrics,
    pub logs: Vec<(String, f64)>,
}

/// Opaque depth/pose predictor: image → inverse depth, image pair → relative
/// pose, plus the intrinsics used downstream.
pub trait DepthPoseNetwork {
    fn predict(&self, batch: &Batch) -> Result<Predictions, ModelError>;
}

/// Multi-view photometric loss collaborator. Reconstruction/reprojection
/// through the camera model happens behind this seam.
pub trait PhotometricLoss {
    #[allow(clippy::too_many_arguments)]
    fn compute(
        &self,
        image: &[RgbImage],
        ref_images: &[Vec<RgbImage>],
        inv_depths: &[DepthMap],
        intrinsics_ref: &[DVector<f64>],
        intrinsics_ctx: &[DVector<f64>],
        poses: &[Vec<Isometry3<f64>>],
        return_logs: bool,
        progress: f64,
    ) -> Result<LossOutput, ModelError>;
}

/// Self-supervised SfM model: prediction plus an injected photometric loss.
///
/// In eval mode only the predictions are produced; in training mode the loss
/// is computed against the batch's context images, with the same intrinsics
/// used for the reference and context cameras.
pub struct SelfSupModel<N, L> {
    network: N,
    loss: L,
    training: bool,
}

impl<N: DepthPoseNetwork, L: PhotometricLoss> SelfSupModel<N, L> {
    pub fn new(network: N, loss: L) -> Self {
        SelfSupModel {
            network,
            loss,
            training: true,
        }
    }

    pub fn set_train(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Processes one batch.
    pub fn forward(
        &self,
        batch: &Batch,
        return_logs: bool,
        progress: f64,
    ) -> Result<ModelOutput, ModelError> {
        let predictions = self.network.predict(batch)?;

        if let Some(first) = predictions.intrinsics.first() {
            if first.len() >= 6 {
                debug!(
                    "predicted intrinsics: fx={} fy={} cx={} cy={} alpha={} beta={}",
                    first[0], first[1], first[2], first[3], first[4], first[5]
                );
            }
        }

        if !self.training {
            let metrics = predictions.metrics.clone();
            return Ok(ModelOutput {
                predictions,
                loss: None,
                metrics,
                logs: Vec::new(),
            });
        }

        let ref_images = batch
            .rgb_context
            .as_ref()
            .filter(|ctx| !ctx.is_empty())
            .ok_or(ModelError::MissingContext)?;

        let loss_output = self.loss.compute(
            &batch.rgb,
            ref_images,
            &predictions.inv_depths,
            &predictions.intrinsics,
            &predictions.intrinsics,
            &predictions.poses,
            return_logs,
            progress,
        )?;

        let metrics = predictions
            .metrics
            .clone()
            .merged_with(loss_output.metrics);
        Ok(ModelOutput {
            predictions,
            loss: Some(loss_output.loss),
            metrics,
            logs: loss_output.logs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn test_batch(with_context: bool) -> Batch {
        let image = RgbImage::from_pixel(8, 6, image::Rgb([128, 128, 128]));
        Batch {
            rgb: vec![image.clone()],
            rgb_context: with_context.then(|| vec![vec![image.clone()], vec![image]]),
        }
    }

    struct StubNetwork;

    impl DepthPoseNetwork for StubNetwork {
        fn predict(&self, batch: &Batch) -> Result<Predictions, ModelError> {
            let contexts = batch.rgb_context.as_ref().map_or(0, Vec::len);
            Ok(Predictions {
                inv_depths: vec![DepthMap::constant(batch.rgb.len(), 6, 8, 0.5)],
                poses: vec![vec![Isometry3::identity(); batch.rgb.len()]; contexts],
                intrinsics: vec![DVector::from_vec(vec![
                    460.0, 460.0, 376.0, 240.0, 0.6, 1.05,
                ])],
                metrics: LossMetrics::default(),
            })
        }
    }

    struct StubLoss {
        calls: Cell<usize>,
    }

    impl StubLoss {
        fn new() -> Self {
            StubLoss {
                calls: Cell::new(0),
            }
        }
    }

    impl PhotometricLoss for StubLoss {
        fn compute(
            &self,
            image: &[RgbImage],
            ref_images: &[Vec<RgbImage>],
            _inv_depths: &[DepthMap],
            intrinsics_ref: &[DVector<f64>],
            intrinsics_ctx: &[DVector<f64>],
            poses: &[Vec<Isometry3<f64>>],
            return_logs: bool,
            _progress: f64,
        ) -> Result<LossOutput, ModelError> {
            self.calls.set(self.calls.get() + 1);
            assert_eq!(image.len(), 1);
            assert_eq!(ref_images.len(), poses.len());
            // Self-supervision reuses the reference intrinsics for context.
            assert_eq!(intrinsics_ref, intrinsics_ctx);
            Ok(LossOutput {
                loss: 0.125,
                metrics: LossMetrics {
                    photometric_loss: Some(0.125),
                    smoothness_loss: Some(0.01),
                    ..LossMetrics::default()
                },
                logs: if return_logs {
                    vec![("photometric_loss".to_string(), 0.125)]
                } else {
                    Vec::new()
                },
            })
        }
    }

    #[test]
    fn test_training_forward_computes_loss() {
        let model = SelfSupModel::new(StubNetwork, StubLoss::new());
        let output = model.forward(&test_batch(true), true, 0.0).unwrap();

        assert_eq!(output.loss, Some(0.125));
        assert_eq!(output.metrics.photometric_loss, Some(0.125));
        assert_eq!(output.metrics.smoothness_loss, Some(0.01));
        assert_eq!(output.logs.len(), 1);
        assert_eq!(model.loss.calls.get(), 1);
    }

    #[test]
    fn test_eval_forward_skips_loss() {
        let mut model = SelfSupModel::new(StubNetwork, StubLoss::new());
        model.set_train(false);
        let output = model.forward(&test_batch(true), false, 0.0).unwrap();

        assert!(output.loss.is_none());
        assert_eq!(output.metrics, LossMetrics::default());
        assert_eq!(model.loss.calls.get(), 0);
        assert_eq!(output.predictions.inv_depths.len(), 1);
    }

    #[test]
    fn test_training_without_context_fails() {
        let model = SelfSupModel::new(StubNetwork, StubLoss::new());
        let result = model.forward(&test_batch(false), false, 0.0);
        assert!(matches!(result, Err(ModelError::MissingContext)));
    }

    #[test]
    fn test_metrics_merge_is_field_wise() {
        let left = LossMetrics {
            supervised_loss: Some(1.0),
            ..LossMetrics::default()
        };
        let right = LossMetrics {
            photometric_loss: Some(0.2),
            ..LossMetrics::default()
        };
        let merged = left.merged_with(right);
        assert_eq!(merged.supervised_loss, Some(1.0));
        assert_eq!(merged.photometric_loss, Some(0.2));
        assert_eq!(merged.smoothness_loss, None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "set by both sides")]
    fn test_metrics_merge_collision_asserts() {
        let a = LossMetrics {
            photometric_loss: Some(0.1),
            ..LossMetrics::default()
        };
        let b = LossMetrics {
            photometric_loss: Some(0.2),
            ..LossMetrics::default()
        };
        let _ = a.merged_with(b);
    }
}
