// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Error, GridDescriptor, Result, ToUsize as _, TryVec};

/// Interpretation of the samples in a [`SampleBuffer`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    /// Not yet decoded.
    #[default]
    Undefined,
    /// Y, Cb, Cr; full-range 8-bit samples.
    YCbCr,
}

/// Interleaved 8-bit samples, `channels` per pixel, rows packed without padding.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    width: u32,
    height: u32,
    channels: u8,
    samples: std::vec::Vec<u8>,
}

impl SampleBuffer {
    /// Allocate a zeroed buffer, failing instead of aborting when memory runs out.
    pub fn new(width: u32, height: u32, channels: u8) -> Result<Self> {
        let len = width
            .to_usize()
            .checked_mul(height.to_usize())
            .and_then(|n| n.checked_mul(channels.to_usize()))
            .ok_or(Error::ResourceLimitExceeded("sample buffer too large"))?;
        let mut samples = std::vec::Vec::new();
        samples.try_reserve_exact(len).map_err(|_| Error::AllocationFailure)?;
        samples.resize(len, 0);
        Ok(Self { width, height, channels, samples })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    fn stride(&self) -> usize {
        self.width.to_usize() * self.channels.to_usize()
    }

    /// Samples of row `y`.
    ///
    /// # Panics
    ///
    /// If `y` is not below the height.
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.stride();
        let start = y.to_usize() * stride;
        &self.samples[start..start + stride]
    }

    /// Mutable samples of row `y`.
    ///
    /// # Panics
    ///
    /// If `y` is not below the height.
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let stride = self.stride();
        let start = y.to_usize() * stride;
        &mut self.samples[start..start + stride]
    }

    /// `width` pixels of row `y` starting at column `x`.
    pub(crate) fn span_mut(&mut self, x: u32, y: u32, width: u32) -> Option<&mut [u8]> {
        if x.checked_add(width)? > self.width || y >= self.height {
            return None;
        }
        let channels = self.channels.to_usize();
        let start = x.to_usize() * channels;
        self.row_mut(y).get_mut(start..start + width.to_usize() * channels)
    }

    /// Samples of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let channels = self.channels.to_usize();
        let start = x.to_usize() * channels;
        self.row(y).get(start..start + channels)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.samples
    }

    pub fn into_bytes(self) -> std::vec::Vec<u8> {
        self.samples
    }

    /// Resample into `dst` with a triangle (tent) filter, each channel independently.
    ///
    /// Pixel centers are aligned: destination pixel `i` samples the source at
    /// `(i + 0.5) * src / dst - 0.5`, clamped at the edges, so a constant
    /// image stays constant.
    pub fn resize_triangle_into(&self, dst: &mut SampleBuffer) -> Result<()> {
        if self.channels != dst.channels {
            return Err(Error::InvalidData("resize between buffers with different channel counts"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidData("resize from an empty buffer"));
        }
        let columns = taps(self.width, dst.width)?;
        let rows = taps(self.height, dst.height)?;
        let channels = self.channels.to_usize();

        for (y, row_tap) in (0..dst.height).zip(rows.iter()) {
            let top = self.row(row_tap.near);
            let bottom = self.row(row_tap.far);
            let out = dst.row_mut(y);
            for (out_px, col_tap) in out.chunks_exact_mut(channels).zip(columns.iter()) {
                let (x0, x1) = (col_tap.near.to_usize() * channels, col_tap.far.to_usize() * channels);
                for (c, sample) in out_px.iter_mut().enumerate() {
                    let upper = lerp(top[x0 + c], top[x1 + c], col_tap.weight);
                    let lower = lerp(bottom[x0 + c], bottom[x1 + c], col_tap.weight);
                    let value = upper * (1.0 - row_tap.weight) + lower * row_tap.weight;
                    *sample = (value + 0.5).clamp(0.0, 255.0) as u8;
                }
            }
        }
        Ok(())
    }
}

/// The two source positions contributing to one destination position.
#[derive(Debug, Clone, Copy)]
struct Tap {
    near: u32,
    far: u32,
    /// Weight of `far`.
    weight: f32,
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn taps(src_len: u32, dst_len: u32) -> Result<TryVec<Tap>> {
    let ratio = src_len as f32 / dst_len as f32;
    let last = src_len - 1;
    let mut taps = TryVec::with_capacity(dst_len.to_usize())?;
    for i in 0..dst_len {
        let center = ((i as f32 + 0.5) * ratio - 0.5).max(0.0);
        let near = (center.floor() as u32).min(last);
        let far = (near + 1).min(last);
        let weight = (center - near as f32).clamp(0.0, 1.0);
        taps.push(Tap { near, far, weight })?;
    }
    Ok(taps)
}

fn lerp(a: u8, b: u8, t: f32) -> f32 {
    f32::from(a) * (1.0 - t) + f32::from(b) * t
}

/// A decoded grid image.
#[derive(Debug)]
pub struct HeicImage {
    pub grid: GridDescriptor,
    /// Bits per sample; always 8.
    pub depth: u8,
    pub colorspace: Colorspace,
    /// `grid.width() × grid.height()` pixels of interleaved Y, Cb, Cr.
    pub pixels: SampleBuffer,
    pub exif: Option<TryVec<u8>>,
}

impl HeicImage {
    pub(crate) fn new(grid: GridDescriptor) -> Result<Self> {
        Ok(Self {
            grid,
            depth: 8,
            colorspace: Colorspace::Undefined,
            pixels: SampleBuffer::new(grid.width(), grid.height(), 3)?,
            exif: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Look up an attached metadata profile by name. Only `"exif"` is known.
    pub fn profile(&self, name: &str) -> Option<&[u8]> {
        match name {
            "exif" => self.exif.as_deref(),
            _ => None,
        }
    }
}
