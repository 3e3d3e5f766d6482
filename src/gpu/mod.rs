// gpu/mod.rs — wgpu acceleration layer (cargo feature `gpu`).
//
// Provides a `SweepBackend` for f32 tensors resident on a GPU. The CPU
// kernel in `crate::sweep` remains the reference; every GPU result is
// validated against it.
//
// Usage:
//   let gpu = Arc::new(GpuDevice::new()?);
//   dispatcher.register(Box::new(GpuSweepBackend::new(gpu.clone())));
//   let mut img = upload_image(&gpu, &host_img)?;
//   dispatcher.step(step, &mut img, &grad)?;
//   let host_img = download(&gpu, &img)?;

pub mod device;
pub mod sweep;

pub use device::{GpuDevice, GpuError};
pub use sweep::{download, upload_image, GpuStorage, GpuSweepBackend};
