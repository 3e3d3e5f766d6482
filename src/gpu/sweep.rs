// gpu/sweep.rs — Directional sweep as a wgpu compute kernel.
//
// Buffers live in plain storage buffers with exactly the host layout
// (channel stride, row stride, unit column stride), so upload and readback
// are single copies and the dispatcher's layout checks apply unchanged.
//
// PARALLEL DECOMPOSITION
// ──────────────────────
// A sweep is sequential along its direction and independent across the
// perpendicular axis and across channels:
//
//   LR / RL: one invocation per (interior row, channel), walking columns
//   TB / BT: one invocation per (interior column, channel), walking rows
//
// One dispatch covers the whole image: (workgroups_for(lanes), channels, 1).
// Each invocation does exactly the reads and writes the CPU kernel does for
// its lane, in the same order, so the result equals the CPU reference.
//
// Element type: f32 only. WGSL has no portable f64.

use std::any::Any;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::debug;
use wgpu::util::DeviceExt;

use crate::direction::Direction;
use crate::dispatch::SweepBackend;
use crate::error::StepError;
use crate::gpu::device::{workgroups_for, GpuDevice, GpuError, WORKGROUP_SIZE};
use crate::image::{DType, Image, Shape, Strides};
use crate::tensor::{Device, DeviceStorage, Storage, Tensor};

// ---------------------------------------------------------------------------
// Device-resident storage
// ---------------------------------------------------------------------------

/// An f32 buffer resident on a [`GpuDevice`].
pub struct GpuStorage {
    buffer: wgpu::Buffer,
    len: usize,
    device: Device,
}

impl GpuStorage {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    fn byte_len(&self) -> u64 {
        (self.len * std::mem::size_of::<f32>()) as u64
    }
}

impl DeviceStorage for GpuStorage {
    fn device(&self) -> Device {
        self.device
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Copy `img` (with its strides and padding) into a new device buffer.
pub fn upload_image(gpu: &GpuDevice, img: &Image<f32>) -> Result<Tensor, GpuError> {
    let bytes: &[u8] = bytemuck::cast_slice(img.as_slice());
    let max = gpu.max_binding_size();
    if bytes.len() as u64 > max {
        return Err(GpuError::BufferTooLarge { bytes: bytes.len() as u64, max });
    }

    // Zero-sized buffers cannot be bound.
    let contents: &[u8] = if bytes.is_empty() { &[0u8; 4] } else { bytes };
    let buffer = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("gradmap tensor"),
        contents,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
    });

    let storage = GpuStorage {
        buffer,
        len: img.as_slice().len(),
        device: Device::Gpu(gpu.ordinal),
    };
    Ok(Tensor::from_device(Box::new(storage), img.shape(), img.strides()))
}

/// Read a device tensor back into a host image with the same layout.
pub fn download(gpu: &GpuDevice, tensor: &Tensor) -> Result<Image<f32>, GpuError> {
    let storage = gpu_storage(tensor.storage())
        .ok_or_else(|| GpuError::Readback(format!("{:?} is not a GPU f32 buffer", tensor.storage())))?;

    let size = storage.byte_len();
    let mut data = Vec::with_capacity(storage.len);
    if size > 0 {
        let rb = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gradmap readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("gradmap readback") });
        encoder.copy_buffer_to_buffer(&storage.buffer, 0, &rb, 0, size);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = rb.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            // The receiver only goes away if this function already returned.
            let _ = tx.send(r);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| GpuError::Readback(e.to_string()))?
            .map_err(|e| GpuError::Readback(e.to_string()))?;

        {
            let mapped = slice.get_mapped_range();
            data.extend_from_slice(bytemuck::cast_slice::<u8, f32>(&mapped));
        }
        rb.unmap();
    }

    Image::from_vec_with_strides(tensor.shape(), tensor.strides(), data)
        .map_err(|e| GpuError::Readback(e.to_string()))
}

fn gpu_storage(storage: &Storage) -> Option<&GpuStorage> {
    match storage {
        Storage::Device(d) => d.as_any().downcast_ref::<GpuStorage>(),
        Storage::Host(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Kernel parameters
// ---------------------------------------------------------------------------

/// Uniform block matching `Params` in sweep.wgsl. Strides are in elements.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct SweepParams {
    channels: u32,
    height: u32,
    width: u32,
    direction: u32,
    img_channel: u32,
    img_row: u32,
    grad_channel: u32,
    grad_row: u32,
}

impl SweepParams {
    /// `max_workgroups` is the device's per-dimension dispatch limit; both
    /// the lane and channel dimensions must fit under it.
    fn new(
        direction: Direction,
        shape: Shape,
        img: Strides,
        grad: Strides,
        max_workgroups: u32,
    ) -> Result<Self, StepError> {
        let narrow = |v: usize| {
            u32::try_from(v).map_err(|_| StepError::Backend(format!("{v} does not fit a 32-bit shader index")))
        };
        let params = SweepParams {
            channels: narrow(shape.channels)?,
            height: narrow(shape.height)?,
            width: narrow(shape.width)?,
            direction: direction.index(),
            img_channel: narrow(img.channel)?,
            img_row: narrow(img.row)?,
            grad_channel: narrow(grad.channel)?,
            grad_row: narrow(grad.row)?,
        };

        let wg_x = workgroups_for(params.lanes());
        if wg_x > max_workgroups || params.channels > max_workgroups {
            return Err(StepError::Backend(format!(
                "sweep {direction} on {shape} needs {wg_x}×{} workgroups, device allows {max_workgroups} per dimension",
                params.channels
            )));
        }
        Ok(params)
    }

    /// Invocations along x: interior rows for horizontal sweeps, interior
    /// columns for vertical ones.
    fn lanes(&self) -> u32 {
        match self.direction {
            0 | 2 => self.height.saturating_sub(2),
            _ => self.width.saturating_sub(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// [`SweepBackend`] for f32 tensors resident on one [`GpuDevice`].
///
/// Create once per device; the pipeline is compiled in [`new`](Self::new).
pub struct GpuSweepBackend {
    gpu: Arc<GpuDevice>,
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl GpuSweepBackend {
    pub fn new(gpu: Arc<GpuDevice>) -> Self {
        let shader_src = include_str!("../shaders/sweep.wgsl").replace("{{WG_X}}", &WORKGROUP_SIZE.to_string());
        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("sweep.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let storage_entry = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("GpuSweep BGL"),
            entries: &[
                // 0 — img (read_write)
                storage_entry(0, false),
                // 1 — grad (read)
                storage_entry(1, true),
                // 2 — params uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("GpuSweep pipeline layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });

        let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("sweep"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "sweep",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        GpuSweepBackend { gpu, pipeline, bgl }
    }

    pub fn gpu(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }
}

impl SweepBackend for GpuSweepBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn device(&self) -> Device {
        Device::Gpu(self.gpu.ordinal)
    }

    fn supports(&self, dtype: DType) -> bool {
        dtype == DType::F32
    }

    fn sweep(&self, direction: Direction, img: &mut Tensor, grad: &Tensor) -> Result<(), StepError> {
        let shape = img.shape();
        if !shape.has_interior() {
            return Ok(());
        }
        let max_workgroups = self.gpu.device.limits().max_compute_workgroups_per_dimension;
        let params = SweepParams::new(direction, shape, img.strides(), grad.strides(), max_workgroups)?;

        let foreign = |which: &str| StepError::Backend(format!("{which} is not a buffer of this GPU backend"));
        let grad_buf = gpu_storage(grad.storage()).ok_or_else(|| foreign("grad"))?;
        let img_buf = gpu_storage(img.storage()).ok_or_else(|| foreign("img"))?;

        let gpu = &self.gpu;
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("GpuSweep params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuSweep BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: img_buf.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: grad_buf.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
            ],
        });

        let wg_x = workgroups_for(params.lanes());
        debug!("gpu sweep {direction}: {wg_x}×{} workgroups", params.channels);

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("GpuSweep dispatch") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("sweep"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(wg_x, params.channels, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
        gpu.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::sweep::sweep;

    // GPU tests are `#[ignore]`d; run with
    //   cargo test --features gpu -- --include-ignored

    #[test]
    fn test_lanes_follow_direction() {
        let shape = Shape::new(3, 10, 7);
        let s = Strides::contiguous(shape);
        let lr = SweepParams::new(Direction::LeftToRight, shape, s, s, 65_535).unwrap();
        let bt = SweepParams::new(Direction::BottomToTop, shape, s, s, 65_535).unwrap();
        assert_eq!(lr.lanes(), 8);
        assert_eq!(bt.lanes(), 5);
        assert_eq!(bt.direction, 3);
    }

    #[test]
    fn test_dispatch_beyond_workgroup_limit_is_rejected() {
        let max = 65_535;

        let shape = Shape::new(70_000, 4, 4);
        let s = Strides::contiguous(shape);
        let err = SweepParams::new(Direction::LeftToRight, shape, s, s, max).unwrap_err();
        assert!(matches!(err, StepError::Backend(_)), "{err}");

        // 64 lanes per workgroup: width - 2 columns need more than `max`
        // groups for vertical sweeps but rows stay within it.
        let shape = Shape::new(1, 3, (max as usize + 1) * WORKGROUP_SIZE as usize + 2);
        let s = Strides::contiguous(shape);
        assert!(matches!(
            SweepParams::new(Direction::TopToBottom, shape, s, s, max),
            Err(StepError::Backend(_))
        ));
        assert!(SweepParams::new(Direction::LeftToRight, shape, s, s, max).is_ok());

        // Exactly at the limit is fine.
        let shape = Shape::new(max as usize, 4, 4);
        let s = Strides::contiguous(shape);
        assert!(SweepParams::new(Direction::BottomToTop, shape, s, s, max).is_ok());
    }

    #[test]
    fn test_params_layout_matches_wgsl() {
        assert_eq!(std::mem::size_of::<SweepParams>(), 32);
    }

    fn sample(shape: Shape, seed: f32) -> Image<f32> {
        Image::from_fn(shape.channels, shape.height, shape.width, |c, y, x| {
            ((c * 31 + y * 7 + x * 3) as f32 * seed).sin()
        })
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_gpu_matches_cpu_all_directions() {
        let gpu = Arc::new(GpuDevice::new().expect("GPU"));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Box::new(GpuSweepBackend::new(gpu.clone())));

        let shape = Shape::new(3, 37, 70);
        let grad = sample(shape, 0.37);
        let start = sample(shape, 0.11);

        for step in 0..4i64 {
            let mut cpu = start.clone();
            sweep(Direction::from_step(step), &mut cpu.view_mut(), &grad.view()).unwrap();

            let mut img_t = upload_image(&gpu, &start).unwrap();
            let grad_t = upload_image(&gpu, &grad).unwrap();
            dispatcher.step(step, &mut img_t, &grad_t).unwrap();
            let back = download(&gpu, &img_t).unwrap();

            for (a, b) in back.as_slice().iter().zip(cpu.as_slice()) {
                assert!((a - b).abs() <= 1e-6, "step {step}: gpu {a} vs cpu {b}");
            }
        }
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_gpu_respects_row_padding() {
        let gpu = Arc::new(GpuDevice::new().expect("GPU"));
        let backend = GpuSweepBackend::new(gpu.clone());

        let shape = Shape::new(1, 5, 6);
        let strides = Strides::with_row_stride(shape, 9);
        let mut img = Image::filled(shape, strides, f32::NAN);
        let grad = Image::filled(shape, strides, 1.0f32);
        for y in 0..5 {
            for x in 0..6 {
                img.set(0, y, x, 0.0);
            }
        }

        let mut img_t = upload_image(&gpu, &img).unwrap();
        let grad_t = upload_image(&gpu, &grad).unwrap();
        backend.sweep(Direction::LeftToRight, &mut img_t, &grad_t).unwrap();
        let back = download(&gpu, &img_t).unwrap();

        assert_eq!(back.get(0, 1, 1), 0.5);
        assert!(back.as_slice()[6..9].iter().all(|v| v.is_nan()));
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_gpu_backend_rejects_f64() {
        let gpu = Arc::new(GpuDevice::new().expect("GPU"));
        let backend = GpuSweepBackend::new(gpu);
        assert!(backend.supports(DType::F32));
        assert!(!backend.supports(DType::F64));
    }
}
