// gradmap: gradient-domain image reconstruction by directional sweeps
//
// One call relaxes every interior pixel of a [channel, row, column] image
// toward its neighbour plus (or minus) a gradient sample, Gauss-Seidel style,
// in one of four scan directions selected by a step counter. Repeated calls
// rebuild an image whose finite differences match the supplied gradient
// field, with the image border held fixed as the boundary condition.

pub mod image;
pub mod direction;
pub mod error;
pub mod sweep;
pub mod tensor;
pub mod dispatch;
pub mod gradient_map;
pub mod convert;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use direction::Direction;
pub use dispatch::{step, CpuBackend, Dispatcher, SweepBackend};
pub use error::StepError;
pub use gradient_map::{reconstruct_tensors, GradientMap, ReconstructOptions};
pub use image::{DType, Float, Image, ImageView, ImageViewMut, Shape, Strides};
pub use sweep::{sweep, sweep_step, sweep_with, Parallelism, SweepConfig};
pub use tensor::{Device, DeviceStorage, HostData, Storage, Tensor};
