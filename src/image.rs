// image.rs — Planar multi-channel image buffers with explicit strides.
//
// Layout: [channel, row, column], column stride fixed at 1.
//
//   index(c, y, x) = c * strides.channel + y * strides.row + x
//
// Memory layout (channels = 2, height = 2, width = 3, row = 4, channel = 9):
//
//   data index:  0  1  2 [3]  4  5  6 [7] [8]  9 10 11 [12] 13 14 15
//   element:     ■  ■  ■  ·   ■  ■  ■  ·   ·   ■  ■  ■  ·   ■  ■  ■
//                |-- c0 y0 --| |-- c0 y1 --|     |-- c1 y0 --| |c1 y1|
//
//   Bracketed slots are padding. They are never read or written.
//
// Three types share this addressing scheme:
//   Image<T>            — owns its Vec<T>; used by the gradient map and tests.
//   ImageView<'a, T>    — borrowed read-only window (the gradient side).
//   ImageViewMut<'a, T> — borrowed exclusive window (the image side).
//
// Views are built from caller-declared layouts, so their constructors return
// `Result` and reject anything the sweep kernel could not address safely.
// `Image<T>` builds its own layouts and panics on programmer error instead.

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::error::StepError;

// ---------------------------------------------------------------------------
// Element types
// ---------------------------------------------------------------------------

/// Runtime tag for the element type of a buffer.
///
/// Only `F32` and `F64` are sweepable. The integer tags exist so the dynamic
/// dispatch layer can describe (and reject) what a host hands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    U8,
}

impl DType {
    /// True for the floating-point tags.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::U8 => "u8",
        };
        f.write_str(name)
    }
}

/// Floating-point element types the sweep kernel is generic over.
///
/// Implemented for `f32` and `f64`. `TWO` is the divisor of the update rule;
/// the kernel divides rather than multiplying by a half so every backend
/// performs the same IEEE operation.
pub trait Float:
    Copy
    + Default
    + Send
    + Sync
    + PartialOrd
    + fmt::Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + 'static
{
    const ZERO: Self;
    const ONE: Self;
    const TWO: Self;
    const DTYPE: DType;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Float for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const TWO: Self = 2.0;
    const DTYPE: DType = DType::F32;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Float for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const TWO: Self = 2.0;
    const DTYPE: DType = DType::F64;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

// ---------------------------------------------------------------------------
// Shape and strides
// ---------------------------------------------------------------------------

/// Logical dimensions of a planar buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub const fn new(channels: usize, height: usize, width: usize) -> Self {
        Shape { channels, height, width }
    }

    /// Number of logical elements (padding excluded).
    ///
    /// For shapes of buffers that exist in memory. Caller-declared shapes go
    /// through [`checked_len`](Self::checked_len).
    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// `None` if the element count does not fit in `usize`.
    pub fn checked_len(&self) -> Option<usize> {
        self.channels.checked_mul(self.height)?.checked_mul(self.width)
    }

    pub fn is_empty(&self) -> bool {
        self.channels == 0 || self.height == 0 || self.width == 0
    }

    /// True when at least one interior pixel exists (height and width >= 3).
    pub fn has_interior(&self) -> bool {
        self.channels > 0 && self.height >= 3 && self.width >= 3
    }

    /// Number of interior pixels across all channels.
    pub fn interior_len(&self) -> usize {
        if self.has_interior() {
            self.channels
                .saturating_mul(self.height - 2)
                .saturating_mul(self.width - 2)
        } else {
            0
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.channels, self.height, self.width)
    }
}

/// Element strides of a planar buffer. `column` is carried explicitly so a
/// non-unit value can be detected and rejected instead of silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Strides {
    pub channel: usize,
    pub row: usize,
    pub column: usize,
}

impl Strides {
    pub const fn new(channel: usize, row: usize, column: usize) -> Self {
        Strides { channel, row, column }
    }

    /// Densely packed strides for `shape`: (H*W, W, 1).
    ///
    /// Saturates instead of overflowing; a saturated layout never passes
    /// [`validate_layout`].
    pub fn contiguous(shape: Shape) -> Self {
        Strides {
            channel: shape.height.saturating_mul(shape.width),
            row: shape.width,
            column: 1,
        }
    }

    /// Strides for rows padded to `row` elements, channels packed back to back.
    pub fn with_row_stride(shape: Shape, row: usize) -> Self {
        Strides {
            channel: shape.height.saturating_mul(row),
            row,
            column: 1,
        }
    }
}

impl fmt::Display for Strides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.channel, self.row, self.column)
    }
}

/// Number of elements a buffer must hold to address every (c, y, x) of
/// `shape` through `strides`. Zero for an empty shape, `None` if the span
/// does not fit in `usize`.
pub fn checked_required_len(shape: Shape, strides: Strides) -> Option<usize> {
    if shape.is_empty() {
        return Some(0);
    }
    (shape.channels - 1)
        .checked_mul(strides.channel)?
        .checked_add(checked_plane_len(shape, strides)?)
}

/// Elements spanned by one channel plane: from (y=0, x=0) to (y=H-1, x=W-1).
pub(crate) fn checked_plane_len(shape: Shape, strides: Strides) -> Option<usize> {
    if shape.height == 0 || shape.width == 0 {
        return Some(0);
    }
    (shape.height - 1).checked_mul(strides.row)?.checked_add(shape.width)
}

/// [`checked_required_len`] for a layout that already passed
/// [`validate_layout`] or was built by `Image` itself.
pub fn required_len(shape: Shape, strides: Strides) -> usize {
    checked_required_len(shape, strides).unwrap_or(usize::MAX)
}

#[inline]
pub(crate) fn plane_len(shape: Shape, strides: Strides) -> usize {
    checked_plane_len(shape, strides).unwrap_or(usize::MAX)
}

/// Check that `strides` address `shape` without aliasing inside a slice of
/// `len` elements.
///
/// Rules (only for dimensions that actually step):
///   - column stride is exactly 1
///   - row stride >= width                 (rows do not overlap)
///   - channel stride >= one plane's span  (channels do not overlap)
///   - len >= required_len(shape, strides)
///   - every span above fits in `usize`
pub fn validate_layout(
    buffer: &'static str,
    shape: Shape,
    strides: Strides,
    len: usize,
) -> Result<(), StepError> {
    if shape.is_empty() {
        return Ok(());
    }
    if strides.column != 1 {
        return Err(StepError::not_contiguous(
            buffer,
            format!("column stride is {}, expected 1", strides.column),
        ));
    }
    if shape.height > 1 && strides.row < shape.width {
        return Err(StepError::not_contiguous(
            buffer,
            format!("row stride {} is smaller than width {}", strides.row, shape.width),
        ));
    }
    let overflow = || {
        StepError::not_contiguous(
            buffer,
            format!("shape {shape} with strides {strides} spans more than usize::MAX elements"),
        )
    };
    let span = checked_plane_len(shape, strides).ok_or_else(overflow)?;
    if shape.channels > 1 && strides.channel < span {
        return Err(StepError::not_contiguous(
            buffer,
            format!("channel stride {} overlaps a plane spanning {span} elements", strides.channel),
        ));
    }
    let needed = checked_required_len(shape, strides).ok_or_else(overflow)?;
    if len < needed {
        return Err(StepError::not_contiguous(
            buffer,
            format!("{len} elements cannot hold shape {shape} with strides {strides} ({needed} needed)"),
        ));
    }
    Ok(())
}

#[inline]
fn offset(strides: Strides, c: usize, y: usize, x: usize) -> usize {
    c * strides.channel + y * strides.row + x
}

#[inline]
fn bounds_check(shape: Shape, c: usize, y: usize, x: usize) {
    assert!(
        c < shape.channels && y < shape.height && x < shape.width,
        "element ({c},{y},{x}) out of bounds for shape {shape}",
    );
}

// ---------------------------------------------------------------------------
// Image<T> — owned planar buffer
// ---------------------------------------------------------------------------

/// An owned multi-channel image in planar [channel, row, column] layout.
pub struct Image<T: Float> {
    data: Vec<T>,
    shape: Shape,
    strides: Strides,
}

impl<T: Float> Clone for Image<T> {
    fn clone(&self) -> Self {
        Image {
            data: self.data.clone(),
            shape: self.shape,
            strides: self.strides,
        }
    }
}

impl<T: Float> Image<T> {
    /// Zero-initialized, densely packed image.
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        let shape = Shape::new(channels, height, width);
        Self::filled(shape, Strides::contiguous(shape), T::ZERO)
    }

    /// Zero-initialized image whose rows are padded to `row_stride` elements.
    ///
    /// # Panics
    /// Panics if `row_stride < width`.
    pub fn new_with_row_stride(
        channels: usize,
        height: usize,
        width: usize,
        row_stride: usize,
    ) -> Self {
        assert!(
            row_stride >= width,
            "row stride ({row_stride}) must be >= width ({width})"
        );
        let shape = Shape::new(channels, height, width);
        Self::filled(shape, Strides::with_row_stride(shape, row_stride), T::ZERO)
    }

    /// Image with every element (padding included) set to `value`.
    ///
    /// # Panics
    /// Panics if the layout spans more than `usize::MAX` elements.
    pub fn filled(shape: Shape, strides: Strides, value: T) -> Self {
        let len = checked_required_len(shape, strides)
            .unwrap_or_else(|| panic!("shape {shape} with strides {strides} overflows usize"));
        Image {
            data: vec![value; len],
            shape,
            strides,
        }
    }

    /// Wrap densely packed [C, H, W] data.
    ///
    /// # Panics
    /// Panics if `data.len() != channels * height * width`.
    pub fn from_vec(channels: usize, height: usize, width: usize, data: Vec<T>) -> Self {
        let shape = Shape::new(channels, height, width);
        assert_eq!(
            data.len(),
            shape.len(),
            "data length ({}) must equal channels * height * width ({})",
            data.len(),
            shape.len(),
        );
        Image {
            data,
            shape,
            strides: Strides::contiguous(shape),
        }
    }

    /// Wrap data with caller-declared strides, validating the layout.
    pub fn from_vec_with_strides(
        shape: Shape,
        strides: Strides,
        data: Vec<T>,
    ) -> Result<Self, StepError> {
        validate_layout("image", shape, strides, data.len())?;
        Ok(Image { data, shape, strides })
    }

    /// Build an image by evaluating `f(c, y, x)` for every element.
    pub fn from_fn(
        channels: usize,
        height: usize,
        width: usize,
        mut f: impl FnMut(usize, usize, usize) -> T,
    ) -> Self {
        let mut img = Self::new(channels, height, width);
        for c in 0..channels {
            for y in 0..height {
                for (x, v) in img.row_mut(c, y).iter_mut().enumerate() {
                    *v = f(c, y, x);
                }
            }
        }
        img
    }

    // --- Accessors ---

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn strides(&self) -> Strides {
        self.strides
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.shape.height
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.shape.width
    }

    /// Value at (channel, row, column).
    ///
    /// # Panics
    /// Panics if out of bounds.
    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> T {
        bounds_check(self.shape, c, y, x);
        self.data[offset(self.strides, c, y, x)]
    }

    /// # Panics
    /// Panics if out of bounds.
    #[inline]
    pub fn set(&mut self, c: usize, y: usize, x: usize, value: T) {
        bounds_check(self.shape, c, y, x);
        let idx = offset(self.strides, c, y, x);
        self.data[idx] = value;
    }

    /// One row of one channel, padding excluded.
    #[inline]
    pub fn row(&self, c: usize, y: usize) -> &[T] {
        bounds_check(self.shape, c, y, 0);
        let start = offset(self.strides, c, y, 0);
        &self.data[start..start + self.shape.width]
    }

    #[inline]
    pub fn row_mut(&mut self, c: usize, y: usize) -> &mut [T] {
        bounds_check(self.shape, c, y, 0);
        let start = offset(self.strides, c, y, 0);
        &mut self.data[start..start + self.shape.width]
    }

    /// Iterate over all elements as `(c, y, x, value)`, padding skipped.
    pub fn elements(&self) -> impl Iterator<Item = (usize, usize, usize, T)> + '_ {
        let Shape { channels, height, width } = self.shape;
        (0..channels).flat_map(move |c| {
            (0..height).flat_map(move |y| {
                (0..width).map(move |x| (c, y, x, self.data[offset(self.strides, c, y, x)]))
            })
        })
    }

    /// Borrow the whole image as a read-only view.
    pub fn view(&self) -> ImageView<'_, T> {
        ImageView {
            data: &self.data,
            shape: self.shape,
            strides: self.strides,
        }
    }

    /// Borrow the whole image as an exclusive view.
    pub fn view_mut(&mut self) -> ImageViewMut<'_, T> {
        ImageViewMut {
            data: &mut self.data,
            shape: self.shape,
            strides: self.strides,
        }
    }

    /// Underlying storage, padding included.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Copy into a densely packed image (drops any row padding).
    pub fn to_contiguous(&self) -> Image<T> {
        let mut out = Image::new(self.channels(), self.height(), self.width());
        for c in 0..self.channels() {
            for y in 0..self.height() {
                out.row_mut(c, y).copy_from_slice(self.row(c, y));
            }
        }
        out
    }
}

impl<T: Float> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ shape={}, strides={} }}",
            T::DTYPE,
            self.shape,
            self.strides,
        )?;
        for c in 0..self.channels().min(4) {
            for y in 0..self.height().min(8) {
                write!(f, "  c{c} row {y}: [")?;
                for x in 0..self.width().min(12) {
                    if x > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", self.get(c, y, x))?;
                }
                if self.width() > 12 {
                    write!(f, ", ...")?;
                }
                writeln!(f, "]")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ImageView<'a, T> — borrowed, read-only
// ---------------------------------------------------------------------------

/// A read-only strided window over caller-owned data.
#[derive(Clone, Copy)]
pub struct ImageView<'a, T: Float> {
    data: &'a [T],
    shape: Shape,
    strides: Strides,
}

impl<'a, T: Float> ImageView<'a, T> {
    /// Validate `strides` against `shape` and `data.len()` and build a view.
    pub fn new(data: &'a [T], shape: Shape, strides: Strides) -> Result<Self, StepError> {
        Self::labelled("view", data, shape, strides)
    }

    /// View over densely packed [C, H, W] data.
    pub fn contiguous(data: &'a [T], shape: Shape) -> Result<Self, StepError> {
        Self::new(data, shape, Strides::contiguous(shape))
    }

    pub(crate) fn labelled(
        buffer: &'static str,
        data: &'a [T],
        shape: Shape,
        strides: Strides,
    ) -> Result<Self, StepError> {
        validate_layout(buffer, shape, strides, data.len())?;
        Ok(ImageView { data, shape, strides })
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn strides(&self) -> Strides {
        self.strides
    }

    /// # Panics
    /// Panics if out of bounds.
    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> T {
        bounds_check(self.shape, c, y, x);
        self.data[offset(self.strides, c, y, x)]
    }

    #[inline]
    pub fn row(&self, c: usize, y: usize) -> &'a [T] {
        bounds_check(self.shape, c, y, 0);
        let start = offset(self.strides, c, y, 0);
        &self.data[start..start + self.shape.width]
    }

    /// Backing slice trimmed to the addressed span.
    #[inline]
    pub(crate) fn span(&self) -> &'a [T] {
        &self.data[..required_len(self.shape, self.strides)]
    }

    /// One channel plane as a slice of `plane_len` elements. Rows start at
    /// multiples of the row stride.
    #[inline]
    pub(crate) fn plane(&self, c: usize) -> &'a [T] {
        let start = c * self.strides.channel;
        &self.data[start..start + plane_len(self.shape, self.strides)]
    }
}

// ---------------------------------------------------------------------------
// ImageViewMut<'a, T> — borrowed, exclusive
// ---------------------------------------------------------------------------

/// An exclusive strided window over caller-owned data.
///
/// Holding the `&mut` borrow for the whole sweep is what rules out two
/// concurrent sweeps over the same image in safe code.
pub struct ImageViewMut<'a, T: Float> {
    data: &'a mut [T],
    shape: Shape,
    strides: Strides,
}

impl<'a, T: Float> ImageViewMut<'a, T> {
    pub fn new(data: &'a mut [T], shape: Shape, strides: Strides) -> Result<Self, StepError> {
        Self::labelled("view", data, shape, strides)
    }

    pub fn contiguous(data: &'a mut [T], shape: Shape) -> Result<Self, StepError> {
        Self::new(data, shape, Strides::contiguous(shape))
    }

    pub(crate) fn labelled(
        buffer: &'static str,
        data: &'a mut [T],
        shape: Shape,
        strides: Strides,
    ) -> Result<Self, StepError> {
        validate_layout(buffer, shape, strides, data.len())?;
        Ok(ImageViewMut { data, shape, strides })
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn strides(&self) -> Strides {
        self.strides
    }

    /// # Panics
    /// Panics if out of bounds.
    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> T {
        bounds_check(self.shape, c, y, x);
        self.data[offset(self.strides, c, y, x)]
    }

    /// # Panics
    /// Panics if out of bounds.
    #[inline]
    pub fn set(&mut self, c: usize, y: usize, x: usize, value: T) {
        bounds_check(self.shape, c, y, x);
        let idx = offset(self.strides, c, y, x);
        self.data[idx] = value;
    }

    /// Reborrow as a read-only view.
    pub fn as_view(&self) -> ImageView<'_, T> {
        ImageView {
            data: &*self.data,
            shape: self.shape,
            strides: self.strides,
        }
    }

    #[inline]
    pub(crate) fn span_mut(&mut self) -> &mut [T] {
        let len = required_len(self.shape, self.strides);
        &mut self.data[..len]
    }

    #[inline]
    pub(crate) fn plane_mut(&mut self, c: usize) -> &mut [T] {
        let start = c * self.strides.channel;
        let len = plane_len(self.shape, self.strides);
        &mut self.data[start..start + len]
    }
}
