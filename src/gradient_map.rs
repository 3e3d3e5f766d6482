// gradient_map.rs — An image together with its forward-difference gradients.
//
// This is the caller side of the sweep engine: it owns the buffers, seeds
// them, edits the gradient field, and drives the step counter.
//
// Gradient layout. Both gradients are stored at the image's full [C, H, W]
// shape so they can be handed to the engine unchanged:
//
//   grad_x[c][y][x] = img[c][y][x+1] - img[c][y][x]    for x < W-1,  0 at x = W-1
//   grad_y[c][y][x] = img[c][y+1][x] - img[c][y][x]    for y < H-1,  0 at y = H-1
//
// The padded last column / row is never read by the sweeps that consume it
// (LR reads grad[x-1], RL reads grad[x], both for x in 1..W-1).
//
// Reconstruction feeds grad_x to the horizontal sweeps (even steps) and grad_y
// to the vertical sweeps (odd steps), starting from whatever the image holds.
// The image border is never written, so it acts as the boundary condition.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::direction::Direction;
use crate::dispatch::Dispatcher;
use crate::error::StepError;
use crate::image::{Float, Image, Shape};
use crate::sweep::{sweep_with, SweepConfig};
use crate::tensor::Tensor;

/// Options for [`GradientMap::reconstruct_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructOptions {
    /// Step index of the first sweep. Continue an earlier run by passing the
    /// number of steps it already performed.
    pub first_step: i64,
    pub sweep: SweepConfig,
}

/// An image plus the horizontal and vertical gradient fields it is rebuilt from.
#[derive(Clone, Debug)]
pub struct GradientMap<T: Float> {
    img: Image<T>,
    grad_x: Image<T>,
    grad_y: Image<T>,
}

impl<T: Float> GradientMap<T> {
    /// Compute forward-difference gradients of `img`. The image is kept (as
    /// a densely packed copy) as the starting point for reconstruction.
    pub fn from_image(img: &Image<T>) -> Self {
        let img = img.to_contiguous();
        let Shape { channels, height, width } = img.shape();
        let mut grad_x = Image::new(channels, height, width);
        let mut grad_y = Image::new(channels, height, width);

        for c in 0..channels {
            for y in 0..height {
                let row = img.row(c, y);
                let gx = grad_x.row_mut(c, y);
                for x in 0..width.saturating_sub(1) {
                    gx[x] = row[x + 1] - row[x];
                }
                if y + 1 < height {
                    let below = img.row(c, y + 1);
                    for (g, (&b, &a)) in grad_y.row_mut(c, y).iter_mut().zip(below.iter().zip(row)) {
                        *g = b - a;
                    }
                }
            }
        }

        GradientMap { img, grad_x, grad_y }
    }

    /// Assemble a map from existing buffers. All three must share one shape.
    pub fn from_parts(img: Image<T>, grad_x: Image<T>, grad_y: Image<T>) -> Result<Self, StepError> {
        for grad in [&grad_x, &grad_y] {
            if grad.shape() != img.shape() {
                return Err(StepError::ShapeMismatch { img: img.shape(), grad: grad.shape() });
            }
        }
        Ok(GradientMap { img, grad_x, grad_y })
    }

    pub fn shape(&self) -> Shape {
        self.img.shape()
    }

    pub fn image(&self) -> &Image<T> {
        &self.img
    }

    /// Mutable access to the image, e.g. to reseed the interior before
    /// reconstructing. The border is the boundary condition.
    pub fn image_mut(&mut self) -> &mut Image<T> {
        &mut self.img
    }

    pub fn grad_x(&self) -> &Image<T> {
        &self.grad_x
    }

    pub fn grad_y(&self) -> &Image<T> {
        &self.grad_y
    }

    pub fn into_parts(self) -> (Image<T>, Image<T>, Image<T>) {
        (self.img, self.grad_x, self.grad_y)
    }

    /// Copy of the image with every value clamped to [0, 1].
    pub fn clamped_image(&self) -> Image<T> {
        let mut out = self.img.clone();
        for v in out.as_mut_slice() {
            *v = if *v < T::ZERO {
                T::ZERO
            } else if *v > T::ONE {
                T::ONE
            } else {
                *v
            };
        }
        out
    }

    /// Insert `other`'s gradient field with its top-left corner at (`x`, `y`)
    /// of this map, keeping whichever gradient is stronger per element.
    ///
    /// Both components of `other` are scaled by `boost` first. An element is
    /// replaced when `gx² + gy²` of the boosted source is strictly greater
    /// than that of the current value. Offsets may be negative or push the
    /// source past the right/bottom edge; the overlap is clipped on all
    /// sides. The last row and column of this map are never touched because
    /// one of their two components is padding.
    ///
    /// Returns the number of replaced elements (summed over channels).
    pub fn paste_gradient(
        &mut self,
        other: &GradientMap<T>,
        x: isize,
        y: isize,
        boost: T,
    ) -> Result<usize, StepError> {
        if other.shape().channels != self.shape().channels {
            return Err(StepError::ShapeMismatch { img: self.shape(), grad: other.shape() });
        }

        let (src_x, dst_x) = split_offset(x);
        let (src_y, dst_y) = split_offset(y);
        let dst = self.shape();
        let src = other.shape();
        let w = src
            .width
            .saturating_sub(src_x)
            .min(dst.width.saturating_sub(1).saturating_sub(dst_x));
        let h = src
            .height
            .saturating_sub(src_y)
            .min(dst.height.saturating_sub(1).saturating_sub(dst_y));
        if w == 0 || h == 0 {
            debug!("paste_gradient at ({x}, {y}): no overlap");
            return Ok(0);
        }

        let mut replaced = 0;
        for c in 0..dst.channels {
            for j in 0..h {
                let ox = &other.grad_x.row(c, src_y + j)[src_x..src_x + w];
                let oy = &other.grad_y.row(c, src_y + j)[src_x..src_x + w];
                let sx = &mut self.grad_x.row_mut(c, dst_y + j)[dst_x..dst_x + w];
                let sy = &mut self.grad_y.row_mut(c, dst_y + j)[dst_x..dst_x + w];
                for i in 0..w {
                    let (gx, gy) = (ox[i] * boost, oy[i] * boost);
                    if gx * gx + gy * gy > sx[i] * sx[i] + sy[i] * sy[i] {
                        sx[i] = gx;
                        sy[i] = gy;
                        replaced += 1;
                    }
                }
            }
        }
        debug!("paste_gradient at ({x}, {y}): {w}×{h} overlap, {replaced} elements replaced");
        Ok(replaced)
    }

    /// Run `steps` sweeps starting at step 0 on the CPU.
    pub fn reconstruct(&mut self, steps: usize) -> Result<(), StepError> {
        self.reconstruct_with(steps, &ReconstructOptions::default())
    }

    /// Run `steps` sweeps starting at `options.first_step`. The step counter
    /// wraps at `i64::MAX`, which keeps the direction cycle unbroken.
    pub fn reconstruct_with(&mut self, steps: usize, options: &ReconstructOptions) -> Result<(), StepError> {
        let grad_x = self.grad_x.view();
        let grad_y = self.grad_y.view();
        let mut img = self.img.view_mut();
        for i in 0..steps {
            let step = options.first_step.wrapping_add(i as i64);
            let direction = Direction::from_step(step);
            let grad = if direction.is_horizontal() { &grad_x } else { &grad_y };
            sweep_with(&options.sweep, direction, &mut img, grad)?;
        }
        Ok(())
    }
}

/// Split a signed paste offset into (source skip, destination start).
fn split_offset(offset: isize) -> (usize, usize) {
    if offset < 0 {
        (offset.unsigned_abs(), 0)
    } else {
        (0, offset as usize)
    }
}

/// Drive `steps` consecutive steps through a dispatcher, feeding `grad_x` to
/// horizontal sweeps and `grad_y` to vertical ones. Works for any residency
/// the dispatcher has a backend for.
pub fn reconstruct_tensors(
    dispatcher: &Dispatcher,
    img: &mut Tensor,
    grad_x: &Tensor,
    grad_y: &Tensor,
    first_step: i64,
    steps: usize,
) -> Result<(), StepError> {
    for i in 0..steps {
        let step = first_step.wrapping_add(i as i64);
        let grad = if Direction::from_step(step).is_horizontal() { grad_x } else { grad_y };
        dispatcher.step(step, img, grad)?;
    }
    Ok(())
}
