// dispatch.rs — Route a sweep to the backend that owns the buffers.
//
// The host-facing entry point is `step(step, img, grad)`. It validates the
// pair of tensors in a fixed order, then hands them to exactly one backend:
//
//   1. residency   both tensors on the same Device          → DeviceMismatch
//   2. backend     a registered backend serves that Device   → DeviceMismatch
//   3. dtype       supported by that backend, and equal      → UnsupportedElementType
//                                                               / ElementTypeMismatch
//   4. shape       identical [C, H, W]                       → ShapeMismatch
//   5. layout      unit column stride, no aliasing, in range → NotContiguous
//
// All five run before any write. The CPU backend is always present and is
// the reference every accelerator is validated against. Accelerators are
// registered at runtime; a build without one simply has none registered, so
// any device-resident tensor is rejected at step 2.

use log::{debug, info};

use crate::direction::Direction;
use crate::error::StepError;
use crate::image::{validate_layout, DType, Float, ImageView, ImageViewMut, Shape, Strides};
use crate::sweep::{sweep_with, SweepConfig};
use crate::tensor::{Device, HostData, Storage, Tensor};

/// One capability: apply one directional sweep to a dense strided
/// floating-point buffer resident on `self.device()`.
pub trait SweepBackend: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Residency this backend serves.
    fn device(&self) -> Device;

    fn supports(&self, dtype: DType) -> bool;

    /// Run one sweep. The dispatcher has already validated residency, dtype,
    /// shape and layout of both tensors.
    fn sweep(&self, direction: Direction, img: &mut Tensor, grad: &Tensor) -> Result<(), StepError>;
}

// ---------------------------------------------------------------------------
// CPU reference backend
// ---------------------------------------------------------------------------

/// The reference backend: host memory, f32 and f64.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend {
    pub config: SweepConfig,
}

impl CpuBackend {
    pub fn new(config: SweepConfig) -> Self {
        CpuBackend { config }
    }

    fn run<T: Float>(
        &self,
        direction: Direction,
        img: &mut [T],
        img_layout: (Shape, Strides),
        grad: &[T],
        grad_layout: (Shape, Strides),
    ) -> Result<(), StepError> {
        let mut img = ImageViewMut::labelled("img", img, img_layout.0, img_layout.1)?;
        let grad = ImageView::labelled("grad", grad, grad_layout.0, grad_layout.1)?;
        sweep_with(&self.config, direction, &mut img, &grad)
    }
}

impl SweepBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn supports(&self, dtype: DType) -> bool {
        dtype.is_float()
    }

    fn sweep(&self, direction: Direction, img: &mut Tensor, grad: &Tensor) -> Result<(), StepError> {
        let img_layout = (img.shape(), img.strides());
        let grad_layout = (grad.shape(), grad.strides());
        match (img.storage_mut(), grad.storage()) {
            (Storage::Host(HostData::F32(i)), Storage::Host(HostData::F32(g))) => {
                self.run(direction, i, img_layout, g, grad_layout)
            }
            (Storage::Host(HostData::F64(i)), Storage::Host(HostData::F64(g))) => {
                self.run(direction, i, img_layout, g, grad_layout)
            }
            (i, _) => Err(StepError::UnsupportedElementType {
                dtype: i.dtype(),
                backend: self.name(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Backend registry plus the validation front door.
pub struct Dispatcher {
    cpu: CpuBackend,
    accelerators: Vec<Box<dyn SweepBackend>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// CPU-only dispatcher with the default (sequential) kernel.
    pub fn new() -> Self {
        Self::with_cpu(CpuBackend::default())
    }

    pub fn with_cpu(cpu: CpuBackend) -> Self {
        Dispatcher { cpu, accelerators: Vec::new() }
    }

    /// Register an accelerator backend. A later registration for the same
    /// device replaces the earlier one.
    pub fn register(&mut self, backend: Box<dyn SweepBackend>) {
        let device = backend.device();
        info!("registering {} sweep backend for {device}", backend.name());
        self.accelerators.retain(|b| b.device() != device);
        self.accelerators.push(backend);
    }

    /// Devices this dispatcher can run on, CPU first.
    pub fn devices(&self) -> Vec<Device> {
        std::iter::once(Device::Cpu)
            .chain(self.accelerators.iter().map(|b| b.device()))
            .collect()
    }

    pub fn backend_for(&self, device: Device) -> Option<&dyn SweepBackend> {
        match device {
            Device::Cpu => Some(&self.cpu as &dyn SweepBackend),
            other => self
                .accelerators
                .iter()
                .find(|b| b.device() == other)
                .map(|b| &**b),
        }
    }

    /// Check `img`/`grad` against every precondition and return the backend
    /// that would run them.
    pub fn validate(&self, img: &Tensor, grad: &Tensor) -> Result<&dyn SweepBackend, StepError> {
        let device = img.device();
        if device != grad.device() {
            return Err(StepError::device_mismatch(device, grad.device(), "buffers on different devices"));
        }

        let backend = self.backend_for(device).ok_or_else(|| {
            StepError::device_mismatch(device, device, format!("no backend registered for {device}"))
        })?;

        for dtype in [img.dtype(), grad.dtype()] {
            if !backend.supports(dtype) {
                return Err(StepError::UnsupportedElementType { dtype, backend: backend.name() });
            }
        }
        if img.dtype() != grad.dtype() {
            return Err(StepError::ElementTypeMismatch { img: img.dtype(), grad: grad.dtype() });
        }

        if img.shape() != grad.shape() {
            return Err(StepError::ShapeMismatch { img: img.shape(), grad: grad.shape() });
        }

        validate_layout("img", img.shape(), img.strides(), img.storage().len())?;
        validate_layout("grad", grad.shape(), grad.strides(), grad.storage().len())?;

        Ok(backend)
    }

    /// Run the sweep selected by `step` (floor modulo 4) on whichever backend
    /// owns the tensors. Mutates `img` in place.
    pub fn step(&self, step: i64, img: &mut Tensor, grad: &Tensor) -> Result<(), StepError> {
        let backend = self.validate(img, grad)?;
        let direction = Direction::from_step(step);
        debug!(
            "step {step} → {direction} on {} ({} {})",
            backend.name(),
            img.dtype(),
            img.shape()
        );
        backend.sweep(direction, img, grad)
    }
}

/// Host entry point: one sweep on the CPU reference backend.
///
/// Device-resident tensors are rejected with `DeviceMismatch`; build a
/// [`Dispatcher`] and register an accelerator to run on one.
pub fn step(step: i64, img: &mut Tensor, grad: &Tensor) -> Result<(), StepError> {
    Dispatcher::new().step(step, img, grad)
}
