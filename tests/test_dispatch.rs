// tests/test_dispatch.rs — Integration tests for residency-based dispatch.
//
// Run with `cargo test --test test_dispatch`.
//
// Accelerator residency is simulated with a host-memory `DeviceStorage`
// that claims to live on `Device::Gpu(n)`, plus a backend that serves it by
// running the CPU kernel. That exercises routing and validation without a
// real GPU.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gradmap::dispatch::step as host_step;
use gradmap::{
    sweep, DType, Device, DeviceStorage, Direction, Dispatcher, HostData, Image, Shape, StepError,
    Storage, Strides, SweepBackend, Tensor,
};

// ============================================================
// Fake accelerator
// ============================================================

struct FakeStorage {
    data: Vec<f32>,
    device: Device,
}

impl DeviceStorage for FakeStorage {
    fn device(&self) -> Device {
        self.device
    }
    fn dtype(&self) -> DType {
        DType::F32
    }
    fn len(&self) -> usize {
        self.data.len()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn fake_tensor(img: &Image<f32>, ordinal: u32) -> Tensor {
    let storage = FakeStorage { data: img.as_slice().to_vec(), device: Device::Gpu(ordinal) };
    Tensor::from_device(Box::new(storage), img.shape(), img.strides())
}

fn fake_data(t: &Tensor) -> &[f32] {
    match t.storage() {
        Storage::Device(d) => &d.as_any().downcast_ref::<FakeStorage>().unwrap().data,
        Storage::Host(_) => panic!("expected device storage"),
    }
}

struct FakeBackend {
    ordinal: u32,
    calls: Arc<AtomicUsize>,
}

impl SweepBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn device(&self) -> Device {
        Device::Gpu(self.ordinal)
    }

    fn supports(&self, dtype: DType) -> bool {
        dtype == DType::F32
    }

    fn sweep(&self, direction: Direction, img: &mut Tensor, grad: &Tensor) -> Result<(), StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (shape, img_strides, grad_strides) = (img.shape(), img.strides(), grad.strides());
        let grad_data = fake_data(grad).to_vec();
        let Storage::Device(d) = img.storage_mut() else {
            return Err(StepError::Backend("host tensor".into()));
        };
        let fake = d
            .as_any_mut()
            .downcast_mut::<FakeStorage>()
            .ok_or_else(|| StepError::Backend("foreign storage".into()))?;
        let mut view = gradmap::ImageViewMut::new(&mut fake.data, shape, img_strides)?;
        let grad_view = gradmap::ImageView::new(&grad_data, shape, grad_strides)?;
        sweep(direction, &mut view, &grad_view)
    }
}

fn dispatcher_with_fake(ordinal: u32) -> (Dispatcher, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut d = Dispatcher::new();
    d.register(Box::new(FakeBackend { ordinal, calls: calls.clone() }));
    (d, calls)
}

fn ramp(shape: Shape) -> Image<f32> {
    Image::from_fn(shape.channels, shape.height, shape.width, |c, y, x| {
        (c as f32 + 1.0) * 0.1 + y as f32 * 0.05 - x as f32 * 0.02
    })
}

// ============================================================
// Routing
// ============================================================

#[test]
fn host_tensors_run_on_cpu() {
    let shape = Shape::new(2, 5, 6);
    let img = ramp(shape);
    let grad = Image::<f32>::filled(shape, Strides::contiguous(shape), 0.25);

    let mut expected = img.clone();
    sweep(Direction::TopToBottom, &mut expected.view_mut(), &grad.view()).unwrap();

    let mut t = Tensor::from(img);
    host_step(1, &mut t, &Tensor::from(grad)).unwrap();
    assert_eq!(t.as_f32().unwrap(), expected.as_slice());
}

#[test]
fn device_tensors_route_to_registered_backend() {
    let (dispatcher, calls) = dispatcher_with_fake(0);
    let shape = Shape::new(1, 6, 6);
    let img = ramp(shape);
    let grad = ramp(shape);

    let mut expected = img.clone();
    sweep(Direction::RightToLeft, &mut expected.view_mut(), &grad.view()).unwrap();

    let mut t = fake_tensor(&img, 0);
    dispatcher.step(6, &mut t, &fake_tensor(&grad, 0)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fake_data(&t), expected.as_slice());

    // Host tensors still go to the CPU, not the accelerator.
    let mut host = Tensor::from(img);
    dispatcher.step(6, &mut host, &Tensor::from(grad)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.as_f32().unwrap(), expected.as_slice());
}

#[test]
fn register_replaces_backend_for_same_device() {
    let (mut dispatcher, first) = dispatcher_with_fake(3);
    let second = Arc::new(AtomicUsize::new(0));
    dispatcher.register(Box::new(FakeBackend { ordinal: 3, calls: second.clone() }));
    assert_eq!(dispatcher.devices(), vec![Device::Cpu, Device::Gpu(3)]);

    let img = ramp(Shape::new(1, 4, 4));
    let mut t = fake_tensor(&img, 3);
    dispatcher.step(0, &mut t, &fake_tensor(&img, 3)).unwrap();
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

// ============================================================
// Rejections
// ============================================================

#[test]
fn device_tensor_without_backend_is_rejected() {
    let img = ramp(Shape::new(1, 4, 4));
    let mut t = fake_tensor(&img, 0);
    let err = host_step(0, &mut t, &fake_tensor(&img, 0)).unwrap_err();
    assert!(
        matches!(err, StepError::DeviceMismatch { img: Device::Gpu(0), grad: Device::Gpu(0), .. }),
        "{err}"
    );
    assert_eq!(fake_data(&t), img.as_slice());
}

#[test]
fn mixed_residency_is_rejected() {
    let (dispatcher, calls) = dispatcher_with_fake(0);
    let img = ramp(Shape::new(1, 4, 4));
    let mut t = Tensor::from(img.clone());
    let err = dispatcher.step(0, &mut t, &fake_tensor(&img, 0)).unwrap_err();
    assert!(matches!(
        err,
        StepError::DeviceMismatch { img: Device::Cpu, grad: Device::Gpu(0), .. }
    ));

    let mut on_one = fake_tensor(&img, 1);
    let err = dispatcher.step(0, &mut on_one, &fake_tensor(&img, 0)).unwrap_err();
    assert!(matches!(err, StepError::DeviceMismatch { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn integer_element_types_are_rejected() {
    let shape = Shape::new(1, 3, 3);
    let mut img = Tensor::contiguous(HostData::I32(vec![0; 9]), shape);
    let grad = Tensor::contiguous(HostData::I32(vec![1; 9]), shape);
    let err = host_step(0, &mut img, &grad).unwrap_err();
    assert_eq!(err, StepError::UnsupportedElementType { dtype: DType::I32, backend: "cpu" });

    let mut img = Tensor::contiguous(HostData::U8(vec![0; 9]), shape);
    let grad = Tensor::contiguous(HostData::U8(vec![1; 9]), shape);
    assert!(matches!(
        host_step(0, &mut img, &grad),
        Err(StepError::UnsupportedElementType { dtype: DType::U8, .. })
    ));
}

#[test]
fn f64_is_rejected_by_f32_only_backend() {
    let (dispatcher, _) = dispatcher_with_fake(0);
    let backend = dispatcher.backend_for(Device::Gpu(0)).unwrap();
    assert!(!backend.supports(DType::F64));
    assert!(dispatcher.backend_for(Device::Cpu).unwrap().supports(DType::F64));
}

#[test]
fn shape_mismatch_is_rejected() {
    let mut img = Tensor::from(ramp(Shape::new(1, 4, 5)));
    let grad = Tensor::from(ramp(Shape::new(1, 5, 4)));
    let err = host_step(0, &mut img, &grad).unwrap_err();
    assert_eq!(
        err,
        StepError::ShapeMismatch { img: Shape::new(1, 4, 5), grad: Shape::new(1, 5, 4) }
    );
}

#[test]
fn non_contiguous_layouts_are_rejected() {
    let shape = Shape::new(1, 4, 4);
    let before = vec![0.5f32; 32];

    // Column stride 2.
    let mut img = Tensor::from_host(HostData::F32(before.clone()), shape, Strides::new(32, 8, 2));
    let grad = Tensor::from(ramp(shape));
    let err = host_step(0, &mut img, &grad).unwrap_err();
    assert!(matches!(err, StepError::NotContiguous { buffer: "img", .. }));
    assert_eq!(img.as_f32().unwrap(), &before[..]);

    // Overlapping rows.
    let mut img = Tensor::contiguous(HostData::F32(vec![0.0; 16]), shape);
    let grad = Tensor::from_host(HostData::F32(vec![0.0; 16]), shape, Strides::new(16, 3, 1));
    let err = host_step(0, &mut img, &grad).unwrap_err();
    assert!(matches!(err, StepError::NotContiguous { buffer: "grad", .. }));

    // Too short for the declared layout.
    let mut img = Tensor::from_host(HostData::F32(vec![0.0; 15]), shape, Strides::contiguous(shape));
    let grad = Tensor::from(ramp(shape));
    assert!(matches!(
        host_step(0, &mut img, &grad),
        Err(StepError::NotContiguous { buffer: "img", .. })
    ));
}

#[test]
fn overflowing_layouts_are_rejected_without_panicking() {
    // (H-1) * row_stride does not fit in usize.
    let shape = Shape::new(1, 3, 3);
    let mut img = Tensor::from_host(
        HostData::F32(vec![0.0; 9]),
        shape,
        Strides::new(0, usize::MAX / 2 + 1, 1),
    );
    let grad = Tensor::from(ramp(shape));
    let err = host_step(0, &mut img, &grad).unwrap_err();
    assert!(matches!(err, StepError::NotContiguous { buffer: "img", .. }), "{err}");
    assert_eq!(img.as_f32().unwrap(), &[0.0; 9][..]);

    // Channel count whose span does not fit in usize.
    let shape = Shape::new(usize::MAX, 4, 4);
    let mut img = Tensor::contiguous(HostData::F32(vec![0.0; 16]), shape);
    let grad = Tensor::contiguous(HostData::F32(vec![0.0; 16]), shape);
    for step in 0..4 {
        assert!(matches!(
            host_step(step, &mut img, &grad),
            Err(StepError::NotContiguous { buffer: "img", .. })
        ));
    }

    // Height whose contiguous strides saturate.
    let shape = Shape::new(1, usize::MAX, 4);
    let mut img = Tensor::contiguous(HostData::F64(vec![0.0; 16]), shape);
    let grad = Tensor::contiguous(HostData::F64(vec![0.0; 16]), shape);
    assert!(matches!(
        host_step(1, &mut img, &grad),
        Err(StepError::NotContiguous { .. })
    ));
}

#[test]
fn padded_host_layout_is_accepted() {
    let shape = Shape::new(2, 4, 5);
    let strides = Strides::new(40, 8, 1);
    let mut padded = Image::<f32>::filled(shape, strides, -7.0);
    let packed = ramp(shape);
    for (c, y, x, v) in packed.elements() {
        padded.set(c, y, x, v);
    }
    let grad = ramp(shape);

    let mut expected = packed.clone();
    sweep(Direction::LeftToRight, &mut expected.view_mut(), &grad.view()).unwrap();

    let mut t = Tensor::from(padded);
    host_step(4, &mut t, &Tensor::from(grad)).unwrap();
    let back: Image<f32> = t.to_image().unwrap();
    for (c, y, x, v) in expected.elements() {
        assert_eq!(back.get(c, y, x), v);
    }
    // Padding untouched.
    assert_eq!(back.as_slice()[5..8], [-7.0, -7.0, -7.0]);
}
