// demos/seamless_clone.rs — Paste one image's gradients into another and
// reconstruct.
//
//   ┌────────────┐   from_image    ┌──────────┐
//   │ background │ ──────────────▶ │ GradMap  │◀── paste_gradient(fg, x, y)
//   └────────────┘                 └──────────┘
//                                       │ reconstruct(iters)
//                                       ▼
//                              result.png (+ optional window)
//
// USAGE
// ─────
//   cargo run --release --example seamless_clone
//                                   # generated background and foreground
//   cargo run --release --example seamless_clone -- bg.jpeg fg.png -20 -20 1000
//   cargo run --release --example seamless_clone -- bg.jpeg fg.png -20 -20 1000 --show
//   cargo run --release --example seamless_clone --features gpu -- bg.jpeg fg.png -20 -20 1000 --gpu
//
// Set RUST_LOG=debug to see per-step dispatch logging.

use std::time::Instant;

use gradmap::convert::{interleaved_u8_from_planar, planar_from_interleaved_u8};
use gradmap::{GradientMap, Image, Parallelism, ReconstructOptions, SweepConfig};

fn main() {
    env_logger::init();

    // --- Parse arguments ---
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flags: Vec<&str> = args.iter().map(String::as_str).filter(|a| a.starts_with("--")).collect();
    let positional: Vec<&str> = args.iter().map(String::as_str).filter(|a| !a.starts_with("--")).collect();
    let show = flags.contains(&"--show");
    let use_gpu = flags.contains(&"--gpu");

    let offset_x: isize = positional.get(2).and_then(|s| s.parse().ok()).unwrap_or(-20);
    let offset_y: isize = positional.get(3).and_then(|s| s.parse().ok()).unwrap_or(-20);
    let iters: usize = positional.get(4).and_then(|s| s.parse().ok()).unwrap_or(1000);

    // --- Load images ---
    let (bg, fg) = match (positional.first(), positional.get(1)) {
        (Some(bg), Some(fg)) => (load_rgb(bg), load_rgb(fg)),
        _ => {
            eprintln!("[seamless_clone] no image paths given, using generated scenes");
            (sky(480, 320), disc(160, 160))
        }
    };
    eprintln!(
        "[seamless_clone] background {}×{}, foreground {}×{}, offset ({offset_x}, {offset_y}), {iters} iterations",
        bg.width(),
        bg.height(),
        fg.width(),
        fg.height(),
    );

    // --- Gradients ---
    let mut bg_map = GradientMap::from_image(&bg);
    let fg_map = GradientMap::from_image(&fg);
    let replaced = bg_map
        .paste_gradient(&fg_map, offset_x, offset_y, 1.0)
        .expect("foreground and background must have the same channel count");
    eprintln!("[seamless_clone] merged gradients: {replaced} elements replaced");

    // --- Reconstruct ---
    let start = Instant::now();
    let result = if use_gpu {
        reconstruct_gpu(bg_map, iters)
    } else {
        let options = ReconstructOptions {
            first_step: 0,
            sweep: SweepConfig { parallelism: Parallelism::rayon() },
        };
        bg_map.reconstruct_with(iters, &options).expect("CPU reconstruction failed");
        bg_map.clamped_image()
    };
    let secs = start.elapsed().as_secs_f64();
    eprintln!("[seamless_clone] speed: {:.2} iter/s", iters as f64 / secs);

    // --- Output ---
    let out_path = "result.png";
    let (w, h) = (result.width() as u32, result.height() as u32);
    let pixels = interleaved_u8_from_planar(&result);
    image::RgbImage::from_raw(w, h, pixels)
        .expect("buffer size matches dimensions")
        .save(out_path)
        .unwrap_or_else(|e| panic!("failed to write {out_path}: {e}"));
    eprintln!("[seamless_clone] wrote {out_path}");

    if show {
        display(&result);
    }
}

#[cfg(feature = "gpu")]
fn reconstruct_gpu(map: GradientMap<f32>, iters: usize) -> Image<f32> {
    use std::sync::Arc;

    use gradmap::gpu::{download, upload_image, GpuDevice, GpuSweepBackend};
    use gradmap::{reconstruct_tensors, Dispatcher};

    let gpu = Arc::new(GpuDevice::new().expect("failed to initialise a GPU"));
    eprintln!("[seamless_clone] GPU: {}", gpu.adapter_info);
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(Box::new(GpuSweepBackend::new(gpu.clone())));

    let (img, grad_x, grad_y) = map.into_parts();
    let mut img = upload_image(&gpu, &img).expect("upload image");
    let grad_x = upload_image(&gpu, &grad_x).expect("upload grad_x");
    let grad_y = upload_image(&gpu, &grad_y).expect("upload grad_y");
    reconstruct_tensors(&dispatcher, &mut img, &grad_x, &grad_y, 0, iters).expect("GPU reconstruction failed");

    // Written out through interleaved_u8_from_planar, which clamps.
    download(&gpu, &img).expect("readback")
}

#[cfg(not(feature = "gpu"))]
fn reconstruct_gpu(_: GradientMap<f32>, _: usize) -> Image<f32> {
    panic!("--gpu requires building with `--features gpu`");
}

// ============================================================
// Display
// ============================================================

fn display(img: &Image<f32>) {
    use minifb::{Key, Window, WindowOptions};

    let (w, h) = (img.width(), img.height());
    let rgb = interleaved_u8_from_planar(img);
    let fb: Vec<u32> = rgb
        .chunks_exact(3)
        .map(|p| ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | p[2] as u32)
        .collect();

    let mut window = Window::new(
        "gradmap — seamless clone (Esc to close)",
        w,
        h,
        WindowOptions { resize: false, ..WindowOptions::default() },
    )
    .expect("failed to create window");
    window.set_target_fps(30);

    while window.is_open() && !window.is_key_down(Key::Escape) {
        window.update_with_buffer(&fb, w, h).expect("window update failed");
    }
}

// ============================================================
// Inputs
// ============================================================

fn load_rgb(path: &str) -> Image<f32> {
    let img = image::open(path)
        .unwrap_or_else(|e| panic!("failed to open {path}: {e}"))
        .to_rgb8();
    let (w, h) = img.dimensions();
    planar_from_interleaved_u8(w as usize, h as usize, 3, img.as_raw(), &[0, 1, 2])
}

/// Vertical blue-to-white gradient.
fn sky(width: usize, height: usize) -> Image<f32> {
    Image::from_fn(3, height, width, |c, y, _| {
        let t = y as f32 / height as f32;
        [0.3 + 0.6 * t, 0.5 + 0.4 * t, 0.95][c]
    })
}

/// Orange disc with a hard edge on a black square.
fn disc(width: usize, height: usize) -> Image<f32> {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let r = cx.min(cy) * 0.8;
    Image::from_fn(3, height, width, |c, y, x| {
        let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
        if d < r {
            [1.0, 0.55, 0.1][c]
        } else {
            0.0
        }
    })
}
