// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tile decoding through an external HEVC decoder and compositing.

use crate::hvcc::length_prefixed_to_annexb;
use crate::image::SampleBuffer;
use crate::{Error, GridDescriptor, HeicContainer, Item, Property, Result, Stop, ToU64 as _};
use log::{debug, warn};
use std::fmt;
use std::io::{Read, Seek};

/// Width and height of every grid tile.
pub const TILE_SIZE: u32 = 512;

/// Chroma planes of a 4:2:0 tile are half size in both directions.
const CHROMA_SIZE: u32 = TILE_SIZE / 2;

/// An error or warning reported by a [`HevcDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderError {
    pub code: i32,
    pub message: &'static str,
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for DecoderError {}

impl From<DecoderError> for Error {
    fn from(err: DecoderError) -> Self {
        warn!("HEVC decoder: {err}");
        Self::DecodeFailure(err.message)
    }
}

/// One 8-bit plane of a decoded picture.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub samples: &'a [u8],
    /// Distance between the starts of consecutive rows.
    pub stride: usize,
    pub width: u32,
    pub height: u32,
}

impl<'a> Plane<'a> {
    /// The `width` samples of row `y`, or `None` if the plane is too short.
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        if y >= self.height {
            return None;
        }
        let start = (y as usize).checked_mul(self.stride)?;
        self.samples.get(start..start.checked_add(self.width as usize)?)
    }
}

/// A decoded picture: Y, Cb and Cr planes.
#[derive(Debug, Clone, Copy)]
pub struct Picture<'a> {
    pub planes: [Plane<'a>; 3],
}

/// A push-style HEVC decoder, such as a binding to libde265.
///
/// For every tile the decoder is reset, fed the Annex-B parameter sets and
/// slice data, flushed, and then stepped with [`decode`](Self::decode) until
/// it yields a picture or reports that no more work is pending.
pub trait HevcDecoder {
    /// Drop all buffered data and decoded pictures.
    fn reset(&mut self);

    /// Queue Annex-B data with a presentation timestamp.
    fn push_data(&mut self, data: &[u8], pts: u64) -> Result<(), DecoderError>;

    /// Mark the end of the stream so buffered data gets decoded.
    fn flush(&mut self) -> Result<(), DecoderError>;

    /// Run one decode step. Returns `true` while more work is pending.
    fn decode(&mut self) -> Result<bool, DecoderError>;

    /// Take the next finished picture, if there is one.
    fn next_picture(&mut self) -> Option<Picture<'_>>;

    /// Take the next pending warning, if there is one.
    fn next_warning(&mut self) -> Option<DecoderError>;
}

/// Buffers reused for every tile.
struct TileScratch {
    /// Interleaved Cb, Cr at chroma resolution.
    chroma: SampleBuffer,
    /// Interleaved Cb, Cr at tile resolution.
    upsampled: SampleBuffer,
}

/// Decode every tile of `grid` into `composite`, in row-major order.
pub(crate) fn decode_grid<R, D>(
    container: &HeicContainer,
    src: &mut R,
    decoder: &mut D,
    grid: &GridDescriptor,
    composite: &mut SampleBuffer,
    stop: &dyn Stop,
) -> Result<()>
where
    R: Read + Seek,
    D: HevcDecoder + ?Sized,
{
    let mut scratch = TileScratch {
        chroma: SampleBuffer::new(CHROMA_SIZE, CHROMA_SIZE, 2)?,
        upsampled: SampleBuffer::new(TILE_SIZE, TILE_SIZE, 2)?,
    };
    for (item_id, x, y) in grid.tile_origins() {
        stop.check()?;
        debug!("tile item {item_id} at ({x}, {y})");
        feed_tile(container, src, decoder, item_id)?;
        decode_tile(decoder, item_id, composite, x, y, &mut scratch)?;
    }
    Ok(())
}

/// Check every property association of `item`, then return its first `hvcC`.
fn hevc_config<'a>(container: &'a HeicContainer, item: &Item) -> Result<&'a Property> {
    let mut config = None;
    for association in &item.associations {
        let property = container.property(association.index)?;
        if config.is_none() && property.property_type == b"hvcC" {
            config = Some(property);
        }
    }
    config.ok_or(Error::InvalidData("tile has no hvcC property"))
}

/// Reset the decoder and push one tile's parameter sets and slice data.
fn feed_tile<R, D>(container: &HeicContainer, src: &mut R, decoder: &mut D, item_id: u32) -> Result<()>
where
    R: Read + Seek,
    D: HevcDecoder + ?Sized,
{
    let item = container.item(item_id)?;
    let config = hevc_config(container, item)?;
    let mut data = container.read_item_data(src, item)?;
    let nal_count = length_prefixed_to_annexb(&mut data);
    debug!(
        "tile item {item_id}: {} bytes of parameter sets, {nal_count} slice NAL units",
        config.payload.len()
    );

    decoder.reset();
    decoder.push_data(&config.payload, 0)?;
    // pts counts the bytes pushed so far
    decoder.push_data(&data, config.payload.len().to_u64())?;
    decoder.flush()?;
    Ok(())
}

/// Step the decoder until it yields a picture, then composite it at `(x0, y0)`.
fn decode_tile<D: HevcDecoder + ?Sized>(
    decoder: &mut D,
    item_id: u32,
    composite: &mut SampleBuffer,
    x0: u32,
    y0: u32,
    scratch: &mut TileScratch,
) -> Result<()> {
    loop {
        let more = decoder.decode()?;
        while let Some(warning) = decoder.next_warning() {
            warn!("tile item {item_id}: {warning}");
        }
        if let Some(picture) = decoder.next_picture() {
            return composite_tile(&picture, composite, x0, y0, scratch);
        }
        if !more {
            return Err(Error::DecodeFailure("decoder produced no picture"));
        }
    }
}

fn check_plane(plane: &Plane<'_>, size: u32) -> Result<()> {
    if plane.width != size || plane.height != size {
        warn!("plane is {}x{}, expected {size}x{size}", plane.width, plane.height);
        return Err(Error::DecodeFailure("decoded plane has unexpected dimensions"));
    }
    Ok(())
}

/// Upsample the chroma planes and write the tile as interleaved Y, Cb, Cr.
fn composite_tile(picture: &Picture<'_>, composite: &mut SampleBuffer, x0: u32, y0: u32, scratch: &mut TileScratch) -> Result<()> {
    let [luma, cb, cr] = &picture.planes;
    check_plane(luma, TILE_SIZE)?;
    check_plane(cb, CHROMA_SIZE)?;
    check_plane(cr, CHROMA_SIZE)?;

    for y in 0..CHROMA_SIZE {
        let (Some(cb_row), Some(cr_row)) = (cb.row(y), cr.row(y)) else {
            return Err(Error::DecodeFailure("decoded plane is shorter than its stride implies"));
        };
        let out = scratch.chroma.row_mut(y);
        for ((px, &b), &r) in out.chunks_exact_mut(2).zip(cb_row).zip(cr_row) {
            px[0] = b;
            px[1] = r;
        }
    }
    scratch.chroma.resize_triangle_into(&mut scratch.upsampled)?;

    for y in 0..TILE_SIZE {
        let Some(luma_row) = luma.row(y) else {
            return Err(Error::DecodeFailure("decoded plane is shorter than its stride implies"));
        };
        let chroma_row = scratch.upsampled.row(y);
        let out = composite
            .span_mut(x0, y0 + y, TILE_SIZE)
            .ok_or(Error::InvalidData("tile lies outside the composite"))?;
        for ((px, &l), c) in out.chunks_exact_mut(3).zip(luma_row).zip(chroma_row.chunks_exact(2)) {
            px[0] = l;
            px[1] = c[0];
            px[2] = c[1];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OnePicture {
        y: std::vec::Vec<u8>,
        c: std::vec::Vec<u8>,
        c_size: u32,
        ready: bool,
    }

    impl HevcDecoder for OnePicture {
        fn reset(&mut self) {}

        fn push_data(&mut self, _: &[u8], _: u64) -> Result<(), DecoderError> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), DecoderError> {
            Ok(())
        }

        fn decode(&mut self) -> Result<bool, DecoderError> {
            self.ready = true;
            Ok(false)
        }

        fn next_picture(&mut self) -> Option<Picture<'_>> {
            if !self.ready {
                return None;
            }
            let chroma = Plane { samples: &self.c, stride: self.c_size as usize, width: self.c_size, height: self.c_size };
            Some(Picture {
                planes: [
                    Plane { samples: &self.y, stride: TILE_SIZE as usize, width: TILE_SIZE, height: TILE_SIZE },
                    chroma,
                    chroma,
                ],
            })
        }

        fn next_warning(&mut self) -> Option<DecoderError> {
            None
        }
    }

    fn scratch() -> TileScratch {
        TileScratch {
            chroma: SampleBuffer::new(CHROMA_SIZE, CHROMA_SIZE, 2).unwrap(),
            upsampled: SampleBuffer::new(TILE_SIZE, TILE_SIZE, 2).unwrap(),
        }
    }

    fn solid(c_size: u32) -> OnePicture {
        OnePicture {
            y: vec![16; (TILE_SIZE * TILE_SIZE) as usize],
            c: vec![128; (c_size * c_size) as usize],
            c_size,
            ready: false,
        }
    }

    #[test]
    fn tile_lands_at_its_origin() {
        let mut composite = SampleBuffer::new(2 * TILE_SIZE, TILE_SIZE, 3).unwrap();
        let mut decoder = solid(CHROMA_SIZE);
        decode_tile(&mut decoder, 2, &mut composite, TILE_SIZE, 0, &mut scratch()).unwrap();
        assert_eq!(composite.pixel(0, 0), Some(&[0u8, 0, 0][..]));
        assert_eq!(composite.pixel(TILE_SIZE, 0), Some(&[16u8, 128, 128][..]));
        assert_eq!(composite.pixel(2 * TILE_SIZE - 1, TILE_SIZE - 1), Some(&[16u8, 128, 128][..]));
    }

    #[test]
    fn wrong_chroma_geometry() {
        let mut composite = SampleBuffer::new(TILE_SIZE, TILE_SIZE, 3).unwrap();
        let mut decoder = solid(TILE_SIZE);
        let res = decode_tile(&mut decoder, 1, &mut composite, 0, 0, &mut scratch());
        assert!(matches!(res, Err(Error::DecodeFailure(_))));
    }

    #[test]
    fn short_plane_buffer() {
        let mut composite = SampleBuffer::new(TILE_SIZE, TILE_SIZE, 3).unwrap();
        let mut decoder = solid(CHROMA_SIZE);
        decoder.y.truncate(100);
        let res = decode_tile(&mut decoder, 1, &mut composite, 0, 0, &mut scratch());
        assert!(matches!(res, Err(Error::DecodeFailure(_))));
    }

    #[test]
    fn plane_row_respects_stride() {
        let samples = [1, 2, 0, 3, 4, 0];
        let plane = Plane { samples: &samples, stride: 3, width: 2, height: 2 };
        assert_eq!(plane.row(1), Some(&[3u8, 4][..]));
        assert_eq!(plane.row(2), None);
    }
}
