// convert.rs — Conversions between interleaved 8-bit pixels and planar floats.
//
// Decoders hand out interleaved rows (RGBRGB… or RGBARGBA…, stride == width).
// The sweep engine wants planar [channel, row, column] floats in [0, 1]:
//
//   interleaved u8 ─ planar_from_interleaved_u8 ─▶ Image<T> (values / 255)
//   Image<T>       ─ interleaved_u8_from_planar ─▶ interleaved u8 (clamped, rounded)
//
// Channel selection happens on the way in, so an RGBA buffer can be
// reconstructed as RGB by selecting [0, 1, 2].

use crate::image::{Float, Image};

/// Split an interleaved 8-bit buffer into planar normalized channels.
///
/// `channels` is the number of interleaved channels in `data`; `select`
/// lists which of them to keep, in output order.
///
/// # Panics
/// Panics if `data.len() != width * height * channels` or a selected channel
/// index is `>= channels`.
pub fn planar_from_interleaved_u8<T: Float>(
    width: usize,
    height: usize,
    channels: usize,
    data: &[u8],
    select: &[usize],
) -> Image<T> {
    assert_eq!(
        data.len(),
        width * height * channels,
        "data length ({}) must equal width * height * channels ({})",
        data.len(),
        width * height * channels,
    );
    for &c in select {
        assert!(c < channels, "selected channel {c} out of range for {channels} channels");
    }

    let scale = T::from_f64(255.0);
    let mut out = Image::new(select.len(), height, width);
    for (dst_c, &src_c) in select.iter().enumerate() {
        for y in 0..height {
            let src_row = &data[y * width * channels..(y + 1) * width * channels];
            for (x, v) in out.row_mut(dst_c, y).iter_mut().enumerate() {
                *v = T::from_f64(src_row[x * channels + src_c] as f64) / scale;
            }
        }
    }
    out
}

/// Interleave a planar image back into 8-bit pixels.
/// Values are clamped to [0, 1], scaled to [0, 255] and rounded.
pub fn interleaved_u8_from_planar<T: Float>(img: &Image<T>) -> Vec<u8> {
    let channels = img.channels();
    let mut out = vec![0u8; img.shape().len()];
    for c in 0..channels {
        for y in 0..img.height() {
            for (x, &v) in img.row(c, y).iter().enumerate() {
                let scaled = (v.to_f64().clamp(0.0, 1.0) * 255.0).round() as u8;
                out[(y * img.width() + x) * channels + c] = scaled;
            }
        }
    }
    out
}

/// Change element precision, e.g. run an f64 reconstruction on f32 input.
pub fn convert_image<S: Float, D: Float>(src: &Image<S>) -> Image<D> {
    Image::from_fn(src.channels(), src.height(), src.width(), |c, y, x| {
        D::from_f64(src.get(c, y, x).to_f64())
    })
}
