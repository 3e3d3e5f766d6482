// tensor.rs — Dynamically typed CHW buffers as a host environment hands them over.
//
// `Image<T>` and the views know their element type at compile time. A host
// binding does not: it passes a buffer with a runtime dtype, a shape, a pair
// of strides and a residency. `Tensor` is that descriptor. Nothing is
// validated on construction; the dispatcher checks everything before a
// backend sees the data, so a bad tensor is reported instead of corrupting
// memory.
//
// Residency:
//   Storage::Host   — plain Vec in CPU memory, one variant per dtype.
//   Storage::Device — an allocation owned by some accelerator runtime, behind
//                     the `DeviceStorage` trait. Backends downcast it to
//                     their own concrete type.

use std::any::Any;
use std::fmt;

use crate::image::{DType, Float, Image, Shape, Strides};

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    /// Accelerator with the given ordinal.
    Gpu(u32),
}

impl Device {
    pub fn is_accelerator(self) -> bool {
        matches!(self, Device::Gpu(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(n) => write!(f, "gpu:{n}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Host-resident element data.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    U8(Vec<u8>),
}

impl HostData {
    pub fn dtype(&self) -> DType {
        match self {
            HostData::F32(_) => DType::F32,
            HostData::F64(_) => DType::F64,
            HostData::I32(_) => DType::I32,
            HostData::U8(_) => DType::U8,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            HostData::F32(v) => v.len(),
            HostData::F64(v) => v.len(),
            HostData::I32(v) => v.len(),
            HostData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An allocation owned by an accelerator runtime.
///
/// Implementors report their residency and element type; the backend that
/// created them recovers the concrete type through `as_any`.
pub trait DeviceStorage: Send + Sync + 'static {
    fn device(&self) -> Device;
    fn dtype(&self) -> DType;
    /// Number of elements.
    fn len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Backing memory of a [`Tensor`].
pub enum Storage {
    Host(HostData),
    Device(Box<dyn DeviceStorage>),
}

impl Storage {
    pub fn device(&self) -> Device {
        match self {
            Storage::Host(_) => Device::Cpu,
            Storage::Device(d) => d.device(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::Host(h) => h.dtype(),
            Storage::Device(d) => d.dtype(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::Host(h) => h.len(),
            Storage::Device(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage {{ {} {} × {} }}", self.device(), self.dtype(), self.len())
    }
}

// ---------------------------------------------------------------------------
// Tensor
// ---------------------------------------------------------------------------

/// A [channel, row, column] buffer with runtime dtype, strides and residency.
#[derive(Debug)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: Strides,
}

impl Tensor {
    /// Host tensor with caller-declared strides.
    pub fn from_host(data: HostData, shape: Shape, strides: Strides) -> Self {
        Tensor { storage: Storage::Host(data), shape, strides }
    }

    /// Densely packed host tensor.
    pub fn contiguous(data: HostData, shape: Shape) -> Self {
        Self::from_host(data, shape, Strides::contiguous(shape))
    }

    /// Tensor over an accelerator allocation.
    pub fn from_device(storage: Box<dyn DeviceStorage>, shape: Shape, strides: Strides) -> Self {
        Tensor { storage: Storage::Device(storage), shape, strides }
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn strides(&self) -> Strides {
        self.strides
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Host f32 data, if that is what this tensor holds.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.storage {
            Storage::Host(HostData::F32(v)) => Some(v),
            _ => None,
        }
    }

    /// Host f64 data, if that is what this tensor holds.
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.storage {
            Storage::Host(HostData::F64(v)) => Some(v),
            _ => None,
        }
    }
}

impl From<Image<f32>> for Tensor {
    fn from(img: Image<f32>) -> Self {
        let (shape, strides) = (img.shape(), img.strides());
        Tensor::from_host(HostData::F32(img.into_vec()), shape, strides)
    }
}

impl From<Image<f64>> for Tensor {
    fn from(img: Image<f64>) -> Self {
        let (shape, strides) = (img.shape(), img.strides());
        Tensor::from_host(HostData::F64(img.into_vec()), shape, strides)
    }
}

/// Element types that can be pulled back out of a host tensor.
pub trait HostElement: Float {
    fn host_slice(data: &HostData) -> Option<&[Self]>;
}

impl HostElement for f32 {
    fn host_slice(data: &HostData) -> Option<&[f32]> {
        match data {
            HostData::F32(v) => Some(v),
            _ => None,
        }
    }
}

impl HostElement for f64 {
    fn host_slice(data: &HostData) -> Option<&[f64]> {
        match data {
            HostData::F64(v) => Some(v),
            _ => None,
        }
    }
}

impl Tensor {
    /// Copy a host tensor back into an owned image of the same layout.
    /// `None` if the tensor is device-resident, has another dtype, or its
    /// layout is not addressable.
    pub fn to_image<T: HostElement>(&self) -> Option<Image<T>> {
        let Storage::Host(data) = &self.storage else {
            return None;
        };
        let slice = T::host_slice(data)?;
        Image::from_vec_with_strides(self.shape, self.strides, slice.to_vec()).ok()
    }
}
