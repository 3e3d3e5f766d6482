// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate adapters and select a real (non-CPU) GPU when one exists.
//   - Own the device/queue pair every GPU sweep runs on.
//   - Compute dispatch sizes for the 1-D sweep kernel.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe (a software renderer that presents as a valid
// adapter). We enumerate explicitly and prefer hardware:
//   1. DiscreteGpu / IntegratedGpu / VirtualGpu / Other
//   2. anything else, with a warning, so CI machines still get a device
//
// `pollster::block_on` drives wgpu's async adapter/device requests to
// completion on the calling thread; the sweep API is synchronous.

use std::fmt;

use log::{debug, info, warn};
use thiserror::Error;

/// Invocations per workgroup for the sweep kernel. Each invocation walks one
/// whole row or column, so the kernel is 1-D.
pub const WORKGROUP_SIZE: u32 = 64;

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The GPU context: device, queue, and the adapter it came from.
///
/// Create once and share (`Arc<GpuDevice>`); device creation is expensive.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. `_instance` is declared
/// last so the `wgpu::Instance` outlives `device` and `queue`; some layered
/// drivers crash when the instance goes first.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    /// Ordinal reported as `Device::Gpu(ordinal)` for tensors on this device.
    pub ordinal: u32,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a device on the first suitable adapter of the primary
    /// backends (Vulkan, Metal, DX12).
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_backends(wgpu::Backends::PRIMARY)
    }

    pub fn new_with_backends(backends: wgpu::Backends) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(backends))
    }

    async fn init_async(backends: wgpu::Backends) -> Result<Self, GpuError> {
        let flags = if cfg!(debug_assertions) {
            // Validation layer in debug builds for shader error feedback.
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            flags,
            ..Default::default()
        });

        let mut chosen = None;
        let mut fallback = None;
        for a in instance.enumerate_adapters(backends) {
            let info = a.get_info();
            debug!("adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
            if chosen.is_none() && is_hardware(info.device_type) {
                chosen = Some(a);
            } else if fallback.is_none() {
                fallback = Some(a);
            }
        }
        let adapter = match (chosen, fallback) {
            (Some(a), _) => a,
            (None, Some(a)) => {
                warn!("no hardware GPU adapter, falling back to {}", a.get_info().name);
                a
            }
            (None, None) => return Err(GpuError::NoSuitableAdapter),
        };

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        // wgpu 22: request_device returns (Device, Queue) directly; the tuple
        // type must be spelled out to help the type inferencer.
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gradmap"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        info!("using adapter {adapter_info}");
        Ok(GpuDevice {
            device,
            queue,
            adapter_info,
            ordinal: 0,
            _instance: instance,
        })
    }

    /// Largest storage buffer this device can bind, in bytes.
    pub fn max_binding_size(&self) -> u64 {
        self.device.limits().max_storage_buffer_binding_size as u64
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ adapter: {}, ordinal: {} }}", self.adapter_info, self.ordinal)
    }
}

fn is_hardware(device_type: wgpu::DeviceType) -> bool {
    matches!(
        device_type,
        wgpu::DeviceType::DiscreteGpu
            | wgpu::DeviceType::IntegratedGpu
            | wgpu::DeviceType::VirtualGpu
            | wgpu::DeviceType::Other
    )
}

/// Number of workgroups needed to give each of `lanes` rows/columns one
/// invocation. Ceiling division; the shader guards the overshoot.
pub fn workgroups_for(lanes: u32) -> u32 {
    lanes.div_ceil(WORKGROUP_SIZE)
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialization and transfers.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No adapter found on the requested backends.
    #[error("no GPU adapter found")]
    NoSuitableAdapter,
    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),
    /// Buffer is larger than the device can bind as storage.
    #[error("buffer of {bytes} bytes exceeds the device binding limit of {max}")]
    BufferTooLarge { bytes: u64, max: u64 },
    /// Mapping a readback buffer failed.
    #[error("readback failed: {0}")]
    Readback(String),
}
