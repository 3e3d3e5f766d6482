// sweep.rs — The directional Gauss-Seidel sweep (CPU reference).
//
// One call = one pass over every interior pixel of every channel:
//
//   LeftToRight  img[y][x] = (img[y][x] + img[y][x-1] + grad[y][x-1]) / 2   x ascending
//   TopToBottom  img[y][x] = (img[y][x] + img[y-1][x] + grad[y-1][x]) / 2   y ascending
//   RightToLeft  img[y][x] = (img[y][x] + img[y][x+1] - grad[y][x])   / 2   x descending
//   BottomToTop  img[y][x] = (img[y][x] + img[y+1][x] - grad[y][x])   / 2   y descending
//
// The neighbour is read from the buffer being written, so pixel x sees the
// value pixel x-1 received earlier in the same pass (Gauss-Seidel, not
// Jacobi). That fixes which axes may run in parallel:
//
//   ┌──────────────┬─────────────────────────┬──────────────────────────┐
//   │ direction    │ sequential axis         │ free axes                │
//   ├──────────────┼─────────────────────────┼──────────────────────────┤
//   │ LR / RL      │ columns within a row    │ rows, channels           │
//   │ TB / BT      │ rows within a channel   │ columns within a row     │
//   └──────────────┴─────────────────────────┴──────────────────────────┘
//
// `Parallelism::Rayon` splits along the free axes only. Each pixel still sees
// the same operands in the same order, so the parallel result is
// bit-identical to the sequential one.
//
// Border rows/columns and any stride padding are never written. Borders are
// read as neighbours; the caller seeds them.

use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::direction::Direction;
use crate::error::StepError;
use crate::image::{Float, ImageView, ImageViewMut, Shape};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the CPU kernel schedules work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parallelism {
    /// Single-threaded, in the documented scan order.
    #[default]
    Sequential,
    /// Rayon over rows/channels (horizontal) or column blocks (vertical).
    Rayon {
        /// Interior pixel count below which the call stays sequential.
        min_parallel_pixels: usize,
        /// Columns per task for vertical sweeps.
        column_block: usize,
    },
}

impl Parallelism {
    /// Rayon with thresholds that pay off on typical photo sizes.
    pub fn rayon() -> Self {
        Parallelism::Rayon {
            min_parallel_pixels: 64 * 1024,
            column_block: 1024,
        }
    }
}

/// Options for the CPU sweep kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub parallelism: Parallelism,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run the sweep selected by `step` (floor modulo 4) with the default,
/// sequential configuration.
pub fn sweep_step<T: Float>(
    step: i64,
    img: &mut ImageViewMut<'_, T>,
    grad: &ImageView<'_, T>,
) -> Result<(), StepError> {
    sweep_with(&SweepConfig::default(), Direction::from_step(step), img, grad)
}

/// Run one sweep in `direction` with the default configuration.
pub fn sweep<T: Float>(
    direction: Direction,
    img: &mut ImageViewMut<'_, T>,
    grad: &ImageView<'_, T>,
) -> Result<(), StepError> {
    sweep_with(&SweepConfig::default(), direction, img, grad)
}

/// Run one sweep in `direction`.
///
/// Both views were layout-checked when they were built; this only has to
/// check that their shapes agree. Nothing is written on error.
pub fn sweep_with<T: Float>(
    config: &SweepConfig,
    direction: Direction,
    img: &mut ImageViewMut<'_, T>,
    grad: &ImageView<'_, T>,
) -> Result<(), StepError> {
    let shape = img.shape();
    if shape != grad.shape() {
        return Err(StepError::ShapeMismatch { img: shape, grad: grad.shape() });
    }
    if !shape.has_interior() {
        debug!("sweep {direction}: shape {shape} has no interior, nothing to do");
        return Ok(());
    }

    match config.parallelism {
        Parallelism::Rayon { min_parallel_pixels, column_block }
            if shape.interior_len() >= min_parallel_pixels =>
        {
            debug!("sweep {direction}: shape {shape}, {}, rayon", T::DTYPE);
            if direction.is_horizontal() {
                sweep_rows_parallel(direction, img, grad);
            } else {
                sweep_columns_parallel(direction, img, grad, column_block.max(1));
            }
        }
        _ => {
            debug!("sweep {direction}: shape {shape}, {}, sequential", T::DTYPE);
            let geom = Geometry::of(img, grad);
            for c in direction.channels(shape.channels) {
                sweep_plane(direction, img.plane_mut(c), grad.plane(c), geom);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Plane geometry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Geometry {
    width: usize,
    height: usize,
    img_row: usize,
    grad_row: usize,
}

impl Geometry {
    fn of<T: Float>(img: &ImageViewMut<'_, T>, grad: &ImageView<'_, T>) -> Self {
        let Shape { height, width, .. } = img.shape();
        Geometry {
            width,
            height,
            img_row: img.strides().row,
            grad_row: grad.strides().row,
        }
    }
}

// ---------------------------------------------------------------------------
// Row kernels
// ---------------------------------------------------------------------------
// `row` and `grad` are exactly `width` long; slicing them to that length up
// front lets the compiler drop the per-element bounds checks.

/// LeftToRight on one row: each pixel chains on its already-updated left
/// neighbour.
#[inline]
fn relax_row_forward<T: Float>(row: &mut [T], grad: &[T]) {
    let w = row.len();
    let grad = &grad[..w];
    for x in 1..w - 1 {
        row[x] = (row[x] + row[x - 1] + grad[x - 1]) / T::TWO;
    }
}

/// RightToLeft on one row.
#[inline]
fn relax_row_backward<T: Float>(row: &mut [T], grad: &[T]) {
    let w = row.len();
    let grad = &grad[..w];
    for x in (1..w - 1).rev() {
        row[x] = (row[x] + row[x + 1] - grad[x]) / T::TWO;
    }
}

/// Vertical update of a run of columns against the neighbouring row.
/// Columns are independent here, so this vectorises.
#[inline]
fn relax_columns<T: Float>(cur: &mut [T], neighbour: &[T], grad: &[T], forward: bool) {
    let pairs = cur.iter_mut().zip(neighbour).zip(grad);
    if forward {
        for ((v, &n), &g) in pairs {
            *v = (*v + n + g) / T::TWO;
        }
    } else {
        for ((v, &n), &g) in pairs {
            *v = (*v + n - g) / T::TWO;
        }
    }
}

// ---------------------------------------------------------------------------
// Sequential plane sweep
// ---------------------------------------------------------------------------

/// Sweep one channel plane. `plane` and `grad` start at (y=0, x=0) of the
/// channel and span `(height-1) * row + width` elements.
fn sweep_plane<T: Float>(direction: Direction, plane: &mut [T], grad: &[T], g: Geometry) {
    let Geometry { width: w, height: h, img_row, grad_row } = g;
    let inner = 1..w - 1;

    match direction {
        Direction::LeftToRight => {
            for y in 1..h - 1 {
                relax_row_forward(&mut plane[y * img_row..][..w], &grad[y * grad_row..]);
            }
        }
        Direction::RightToLeft => {
            for y in 1..h - 1 {
                relax_row_backward(&mut plane[y * img_row..][..w], &grad[y * grad_row..]);
            }
        }
        Direction::TopToBottom => {
            for y in 1..h - 1 {
                let (head, tail) = plane.split_at_mut(y * img_row);
                let above = &head[(y - 1) * img_row..][..w];
                let cur = &mut tail[..w];
                let grad_above = &grad[(y - 1) * grad_row..][..w];
                relax_columns(
                    &mut cur[inner.clone()],
                    &above[inner.clone()],
                    &grad_above[inner.clone()],
                    true,
                );
            }
        }
        Direction::BottomToTop => {
            for y in (1..h - 1).rev() {
                let (head, tail) = plane.split_at_mut((y + 1) * img_row);
                let cur = &mut head[y * img_row..][..w];
                let below = &tail[..w];
                let grad_here = &grad[y * grad_row..][..w];
                relax_columns(
                    &mut cur[inner.clone()],
                    &below[inner.clone()],
                    &grad_here[inner.clone()],
                    false,
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel paths
// ---------------------------------------------------------------------------

/// Chunk size that yields exactly one chunk per channel of a span.
/// A single channel may declare any channel stride (even 0).
fn channel_chunk(channels: usize, channel_stride: usize, span_len: usize) -> usize {
    if channels == 1 {
        span_len.max(1)
    } else {
        channel_stride
    }
}

/// LR / RL: every (channel, row) pair is an independent task.
fn sweep_rows_parallel<T: Float>(
    direction: Direction,
    img: &mut ImageViewMut<'_, T>,
    grad: &ImageView<'_, T>,
) {
    let Geometry { width: w, height: h, img_row, grad_row } = Geometry::of(img, grad);
    let channels = img.shape().channels;
    let plane_len = (h - 1) * img_row + w;
    let grad_plane_len = (h - 1) * grad_row + w;
    let forward = direction == Direction::LeftToRight;

    let grad_span = grad.span();
    let grad_chunk = channel_chunk(channels, grad.strides().channel, grad_span.len());
    let img_chunk_stride = img.strides().channel;
    let img_span = img.span_mut();
    let img_chunk = channel_chunk(channels, img_chunk_stride, img_span.len());

    img_span
        .par_chunks_mut(img_chunk)
        .zip(grad_span.par_chunks(grad_chunk))
        .for_each(|(plane, gplane)| {
            plane[..plane_len]
                .par_chunks_mut(img_row)
                .zip(gplane[..grad_plane_len].par_chunks(grad_row))
                .skip(1)
                .take(h - 2)
                .for_each(|(row, grow)| {
                    if forward {
                        relax_row_forward(&mut row[..w], grow);
                    } else {
                        relax_row_backward(&mut row[..w], grow);
                    }
                });
        });
}

/// TB / BT: rows stay in order, the columns of each row are split into blocks.
fn sweep_columns_parallel<T: Float>(
    direction: Direction,
    img: &mut ImageViewMut<'_, T>,
    grad: &ImageView<'_, T>,
    block: usize,
) {
    let Geometry { width: w, height: h, img_row, grad_row } = Geometry::of(img, grad);
    let inner = 1..w - 1;
    let forward = direction == Direction::TopToBottom;

    for c in direction.channels(img.shape().channels) {
        let plane = img.plane_mut(c);
        let gplane = grad.plane(c);
        let rows: Box<dyn Iterator<Item = usize>> = if forward {
            Box::new(1..h - 1)
        } else {
            Box::new((1..h - 1).rev())
        };
        for y in rows {
            let (cur, neighbour, g) = if forward {
                let (head, tail) = plane.split_at_mut(y * img_row);
                (
                    &mut tail[..w],
                    &head[(y - 1) * img_row..][..w],
                    &gplane[(y - 1) * grad_row..][..w],
                )
            } else {
                let (head, tail) = plane.split_at_mut((y + 1) * img_row);
                (
                    &mut head[y * img_row..][..w],
                    &tail[..w],
                    &gplane[y * grad_row..][..w],
                )
            };
            cur[inner.clone()]
                .par_chunks_mut(block)
                .zip(neighbour[inner.clone()].par_chunks(block))
                .zip(g[inner.clone()].par_chunks(block))
                .for_each(|((cb, nb), gb)| relax_columns(cb, nb, gb, forward));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Image, Strides};

    fn ramp(channels: usize, height: usize, width: usize, seed: u64) -> Image<f64> {
        // Small deterministic LCG so tests need no rand dependency.
        let mut state = seed;
        Image::from_fn(channels, height, width, |_, _, _| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f64 / (1u64 << 31) as f64) - 0.5
        })
    }

    #[test]
    fn test_left_to_right_single_interior_pixel() {
        let mut img: Image<f32> = Image::new(1, 3, 3);
        let grad = Image::filled(img.shape(), img.strides(), 1.0f32);
        sweep_step(0, &mut img.view_mut(), &grad.view()).unwrap();
        for (_, y, x, v) in img.elements() {
            let expected = if (y, x) == (1, 1) { 0.5 } else { 0.0 };
            assert_eq!(v, expected, "pixel ({y},{x})");
        }
    }

    #[test]
    fn test_left_to_right_uses_updated_neighbour() {
        // Middle row of a 3×4 plane: img [0,0,0,0], grad [0,1,1,0].
        let mut img: Image<f64> = Image::new(1, 3, 4);
        let mut grad: Image<f64> = Image::new(1, 3, 4);
        grad.row_mut(0, 1).copy_from_slice(&[0.0, 1.0, 1.0, 0.0]);
        sweep(Direction::LeftToRight, &mut img.view_mut(), &grad.view()).unwrap();
        // x=1 reads grad[0] = 0 → 0; x=2 reads grad[1] = 1 and img[1] = 0 → 0.5.
        assert_eq!(img.row(0, 1), &[0.0, 0.0, 0.5, 0.0]);

        // Now shift the gradient so the chain is visible at both columns.
        let mut img: Image<f64> = Image::new(1, 3, 4);
        grad.row_mut(0, 1).copy_from_slice(&[1.0, 1.0, 0.0, 0.0]);
        sweep(Direction::LeftToRight, &mut img.view_mut(), &grad.view()).unwrap();
        // x=1: (0 + 0 + 1)/2 = 0.5 ; x=2: (0 + 0.5 + 1)/2 = 0.75
        assert_eq!(img.row(0, 1), &[0.0, 0.5, 0.75, 0.0]);
    }

    #[test]
    fn test_backward_sweeps_subtract() {
        let mut img: Image<f64> = Image::new(1, 3, 3);
        let grad = Image::filled(img.shape(), img.strides(), 1.0);
        sweep(Direction::RightToLeft, &mut img.view_mut(), &grad.view()).unwrap();
        assert_eq!(img.get(0, 1, 1), -0.5);

        let mut img: Image<f64> = Image::new(1, 3, 3);
        sweep(Direction::BottomToTop, &mut img.view_mut(), &grad.view()).unwrap();
        assert_eq!(img.get(0, 1, 1), -0.5);
    }

    #[test]
    fn test_top_to_bottom_chains_rows() {
        // Column 1 of a 4×3 plane, grad 1 everywhere.
        let mut img: Image<f64> = Image::new(1, 4, 3);
        let grad = Image::filled(img.shape(), img.strides(), 1.0);
        sweep(Direction::TopToBottom, &mut img.view_mut(), &grad.view()).unwrap();
        assert_eq!(img.get(0, 1, 1), 0.5);
        assert_eq!(img.get(0, 2, 1), 0.75);
        assert_eq!(img.get(0, 3, 1), 0.0);
    }

    #[test]
    fn test_bottom_to_top_chains_rows_upward() {
        let mut img: Image<f64> = Image::new(1, 4, 3);
        let grad = Image::filled(img.shape(), img.strides(), -1.0);
        sweep(Direction::BottomToTop, &mut img.view_mut(), &grad.view()).unwrap();
        assert_eq!(img.get(0, 2, 1), 0.5);
        assert_eq!(img.get(0, 1, 1), 0.75);
        assert_eq!(img.get(0, 0, 1), 0.0);
    }

    #[test]
    fn test_no_interior_is_noop() {
        for (h, w) in [(2, 5), (5, 2), (1, 1), (0, 4)] {
            let mut img = ramp(1, h, w, 3);
            let before = img.clone();
            let grad = ramp(1, h, w, 4);
            for d in Direction::ALL {
                sweep(d, &mut img.view_mut(), &grad.view()).unwrap();
            }
            assert_eq!(img.as_slice(), before.as_slice());
        }
    }

    #[test]
    fn test_shape_mismatch_leaves_image_untouched() {
        let mut img = ramp(2, 5, 5, 1);
        let before = img.clone();
        let grad = ramp(2, 5, 6, 2);
        let err = sweep_step(0, &mut img.view_mut(), &grad.view()).unwrap_err();
        assert!(matches!(err, StepError::ShapeMismatch { .. }));
        assert_eq!(img.as_slice(), before.as_slice());
    }

    #[test]
    fn test_padding_never_written() {
        let shape = Shape::new(2, 5, 4);
        let strides = Strides::new(40, 7, 1);
        let data = vec![f64::NAN; crate::image::required_len(shape, strides)];
        let mut img = Image::from_vec_with_strides(shape, strides, data).unwrap();
        for c in 0..2 {
            for y in 0..5 {
                img.row_mut(c, y).fill(0.0);
            }
        }
        let grad = Image::filled(shape, Strides::contiguous(shape), 1.0);
        for step in 0..8 {
            sweep_step(step, &mut img.view_mut(), &grad.view()).unwrap();
        }
        // Logical elements stay finite; padding keeps its NaN sentinel.
        assert!(img.elements().all(|(_, _, _, v)| v.is_finite()));
        let nan_count = img.as_slice().iter().filter(|v| v.is_nan()).count();
        assert_eq!(nan_count, img.as_slice().len() - shape.len());
    }

    #[test]
    fn test_parallel_matches_sequential_bitwise() {
        let par = SweepConfig {
            parallelism: Parallelism::Rayon { min_parallel_pixels: 0, column_block: 3 },
        };
        let grad = ramp(3, 17, 23, 11);
        let mut seq_img = ramp(3, 17, 23, 12);
        let mut par_img = seq_img.clone();
        for step in 0..12 {
            let d = Direction::from_step(step);
            sweep_with(&SweepConfig::default(), d, &mut seq_img.view_mut(), &grad.view()).unwrap();
            sweep_with(&par, d, &mut par_img.view_mut(), &grad.view()).unwrap();
            let same = seq_img
                .as_slice()
                .iter()
                .zip(par_img.as_slice())
                .all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same, "parallel diverged at step {step} ({d})");
        }
    }

    #[test]
    fn test_parallel_single_channel_with_zero_channel_stride() {
        let shape = Shape::new(1, 6, 5);
        let strides = Strides::new(0, 5, 1);
        let mut img = Image::from_vec_with_strides(shape, strides, ramp(1, 6, 5, 5).into_vec()).unwrap();
        let mut reference = img.clone();
        let grad = ramp(1, 6, 5, 6);
        let par = SweepConfig {
            parallelism: Parallelism::Rayon { min_parallel_pixels: 0, column_block: 2 },
        };
        for d in Direction::ALL {
            sweep_with(&par, d, &mut img.view_mut(), &grad.view()).unwrap();
            sweep(d, &mut reference.view_mut(), &grad.view()).unwrap();
        }
        assert_eq!(img.as_slice(), reference.as_slice());
    }
}
