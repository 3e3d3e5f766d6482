// error.rs — Validation and backend errors for a sweep call.
//
// Every variant except `Backend` is raised before the image buffer is
// touched. Once validation passes, the CPU sweep is pure arithmetic over
// fixed-size slices and cannot fail.

use thiserror::Error;

use crate::image::{DType, Shape};
use crate::tensor::Device;

/// Errors returned by [`crate::step`], [`crate::sweep::sweep_step`] and the
/// dispatch layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    /// Image and gradient dimensions differ.
    #[error("shape mismatch: img is {img}, grad is {grad}")]
    ShapeMismatch { img: Shape, grad: Shape },

    /// Buffer layout does not match the addressing scheme the kernel assumes
    /// (unit column stride, non-overlapping rows and channels, enough data).
    #[error("{buffer} is not contiguous: {reason}")]
    NotContiguous { buffer: &'static str, reason: String },

    /// The buffers live on different devices, or on an accelerator no
    /// registered backend serves.
    #[error("device mismatch (img on {img}, grad on {grad}): {reason}")]
    DeviceMismatch { img: Device, grad: Device, reason: String },

    /// Element type is not a floating-point type the backend supports.
    #[error("element type {dtype} is not supported by the {backend} backend")]
    UnsupportedElementType { dtype: DType, backend: &'static str },

    /// Image and gradient use different (individually supported) element types.
    #[error("element type mismatch: img is {img}, grad is {grad}")]
    ElementTypeMismatch { img: DType, grad: DType },

    /// Accelerator runtime failure after validation (e.g. a failed readback).
    #[error("backend failure: {0}")]
    Backend(String),
}

impl StepError {
    /// Shorthand used by layout validation.
    pub(crate) fn not_contiguous(buffer: &'static str, reason: impl Into<String>) -> Self {
        StepError::NotContiguous { buffer, reason: reason.into() }
    }

    pub(crate) fn device_mismatch(img: Device, grad: Device, reason: impl Into<String>) -> Self {
        StepError::DeviceMismatch { img, grad, reason: reason.into() }
    }
}
