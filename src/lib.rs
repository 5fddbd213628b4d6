#![deny(unsafe_code)]
//! Decoder for HEIC grid images.
//!
//! Parses the ISO Base Media box tree of a HEIC file into an item table, a
//! property table and the inline item data, then decodes every 512×512 tile
//! of the grid through a caller-supplied [`HevcDecoder`] and composites the
//! tiles into a single YCbCr image.
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::ReadBytesExt;
use fallible_collections::TryReserveError;
use log::{debug, warn};
use std::convert::TryInto as _;
use std::io::{Read, Seek, SeekFrom, Take};

mod boxes;
mod decode;
mod grid;
mod hvcc;
mod image;
mod meta;

use crate::boxes::BoxType;
use crate::meta::{ItemTable, ParseContext, PropertyTable};

pub use crate::boxes::FourCC;
pub use crate::decode::{DecoderError, HevcDecoder, Picture, Plane, TILE_SIZE};
pub use crate::grid::GridDescriptor;
pub use crate::hvcc::hvcc_to_annexb;
pub use crate::image::{Colorspace, HeicImage, SampleBuffer};
pub use crate::meta::{ConstructionMethod, Item, ItemLocation, Property, PropertyAssociation, MAX_ASSOCIATIONS};

pub use enough::{Stop, StopReason, Unstoppable};

/// Nesting limit for container boxes.
const MAX_BOX_DEPTH: u32 = 16;

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

/// A reader that knows how many bytes of the enclosing box (or stream) remain.
trait Budget: Read {
    fn bytes_left(&self) -> u64;
}

/// Wraps the top-level reader to track the current offset against the stream length.
struct OffsetReader<'a, T> {
    reader: &'a mut T,
    offset: u64,
    len: u64,
}

impl<'a, T> OffsetReader<'a, T> {
    fn new(reader: &'a mut T, len: u64) -> Self {
        Self { reader, offset: 0, len }
    }
}

impl<T: Read> Budget for OffsetReader<'_, T> {
    fn bytes_left(&self) -> u64 {
        self.len.saturating_sub(self.offset)
    }
}

impl<T: Read> Read for OffsetReader<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.offset = self
            .offset
            .checked_add(bytes_read.to_u64())
            .ok_or(Error::InvalidData("total bytes read too large for offset type"))?;
        Ok(bytes_read)
    }
}

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes decoder failures.
///
/// Every variant is fatal: the first error aborts the whole read and no
/// partial image is produced.
#[derive(Debug)]
pub enum Error {
    /// A box header or body is cut short, or a box claims more bytes than its parent has left.
    TruncatedBox(&'static str),
    /// A full box carries a version this decoder does not handle.
    UnsupportedVersion(&'static str),
    /// An item id outside `[1, item count]`.
    InvalidItemId(u32),
    /// More than [`MAX_ASSOCIATIONS`] property associations for one item.
    TooManyAssociations(u32),
    /// `iloc` field sizes other than offset=4, length=4, base_offset=0, index=0.
    UnsupportedLocationEncoding,
    /// `iloc` entry with an extent count other than 1.
    UnsupportedExtentCount(u16),
    /// A NAL unit in `hvcC` reaches past the end of the property.
    TruncatedConfig(&'static str),
    /// No item of type `grid`.
    NoGridItem,
    /// Item data stored in a way this decoder cannot read.
    UnsupportedDataSource,
    /// The grid descriptor needs 8 bytes of item data; carries the bytes available.
    AuxiliaryTooSmall(usize),
    /// Grid descriptor with 32-bit dimension fields.
    UnsupportedFieldWidth,
    /// A property association index of 0 or past the end of the property table.
    InvalidPropertyIndex(u16),
    /// The HEVC decoder rejected data or produced an unusable picture.
    DecodeFailure(&'static str),
    /// Out of memory
    AllocationFailure,
    /// The byte source does not support seeking.
    NotSeekable,
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// The box tree ended before a media data box.
    MissingMediaData,
    /// Resource limit exceeded during parsing
    ResourceLimitExceeded(&'static str),
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TruncatedBox(s) => write!(f, "truncated box: {s}"),
            Self::UnsupportedVersion(s) => write!(f, "unsupported version: {s}"),
            Self::InvalidItemId(id) => write!(f, "item id {id} is out of range"),
            Self::TooManyAssociations(id) => write!(f, "too many property associations for item {id}"),
            Self::UnsupportedLocationEncoding => {
                f.write_str("only iloc offset_size=4, length_size=4, base_offset_size=0, index_size=0 are supported")
            },
            Self::UnsupportedExtentCount(n) => write!(f, "only one extent per item is supported, found {n}"),
            Self::TruncatedConfig(s) => write!(f, "hvcC too short: {s}"),
            Self::NoGridItem => f.write_str("no grid item"),
            Self::UnsupportedDataSource => f.write_str("unsupported item data source"),
            Self::AuxiliaryTooSmall(n) => write!(f, "grid descriptor needs 8 bytes of idat, found {n}"),
            Self::UnsupportedFieldWidth => f.write_str("only 16-bit grid dimensions are supported"),
            Self::InvalidPropertyIndex(i) => write!(f, "property index {i} is out of range"),
            Self::DecodeFailure(s) => write!(f, "HEVC decode failed: {s}"),
            Self::AllocationFailure => f.write_str("OOM"),
            Self::NotSeekable => f.write_str("only seekable sources are supported"),
            Self::InvalidData(s) | Self::ResourceLimitExceeded(s) => f.write_str(s),
            Self::MissingMediaData => f.write_str("missing mdat box"),
            Self::Io(err) => std::fmt::Display::fmt(err, f),
            Self::Stopped(reason) => write!(f, "Stopped: {reason}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::TruncatedBox("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::TruncatedBox("unexpected end of box"),
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::ResourceLimitExceeded("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::TruncatedBox(_) => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::AllocationFailure
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Resource limits for decoding untrusted HEIC files.
///
/// Limits are checked **before** the allocations they guard.
///
/// # Examples
///
/// ```rust
/// use heic_grid::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Strict limits for untrusted input
/// let config = DecodeConfig::default()
///     .with_max_grid_tiles(64)
///     .with_total_megapixels_limit(16);
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Maximum number of direct children parsed per container box.
    /// Default: 100
    pub max_children_per_box: u32,

    /// Maximum item count declared by `iinf`.
    /// Default: 65,535 items
    pub max_items: u32,

    /// Maximum number of properties in `ipco`.
    /// Default: 4,096 properties
    pub max_item_properties: u32,

    /// Maximum number of grid tiles.
    /// Default: 1,000 tiles
    pub max_grid_tiles: Option<u32>,

    /// Maximum composite image size in megapixels.
    /// Default: 512 megapixels
    pub total_megapixels_limit: Option<u32>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_children_per_box: 100,
            max_items: 65_535,
            max_item_properties: 4_096,
            max_grid_tiles: Some(1_000),
            total_megapixels_limit: Some(512),
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    ///
    /// Box budgets and nesting depth are still enforced.
    pub fn unlimited() -> Self {
        Self {
            max_children_per_box: u32::MAX,
            max_items: u32::MAX,
            max_item_properties: u32::MAX,
            max_grid_tiles: None,
            total_megapixels_limit: None,
        }
    }

    /// Set the maximum number of children parsed per container box
    pub fn with_max_children_per_box(mut self, children: u32) -> Self {
        self.max_children_per_box = children;
        self
    }

    /// Set the maximum item count
    pub fn with_max_items(mut self, items: u32) -> Self {
        self.max_items = items;
        self
    }

    /// Set the maximum property count
    pub fn with_max_item_properties(mut self, properties: u32) -> Self {
        self.max_item_properties = properties;
        self
    }

    /// Set the maximum grid tile count
    pub fn with_max_grid_tiles(mut self, tiles: u32) -> Self {
        self.max_grid_tiles = Some(tiles);
        self
    }

    /// Set the total megapixels limit for the composite image
    pub fn with_total_megapixels_limit(mut self, megapixels: u32) -> Self {
        self.total_megapixels_limit = Some(megapixels);
        self
    }

    fn validate_grid_tiles(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.max_grid_tiles {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("grid tile count limit exceeded"));
            }
        }

        Ok(())
    }

    fn validate_total_megapixels(&self, width: u32, height: u32) -> Result<()> {
        if let Some(limit) = self.total_megapixels_limit {
            let pixels = u64::from(width)
                .checked_mul(u64::from(height))
                .ok_or(Error::InvalidData("dimension overflow"))?;

            if pixels > u64::from(limit) * 1_000_000 {
                return Err(Error::ResourceLimitExceeded("total megapixels limit exceeded"));
            }
        }

        Ok(())
    }
}

/// Basic ISO box structure.
///
/// HEIC files are a sequence of possibly-nested 'box' structures.  Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    /// Box type.
    name: BoxType,
    /// Size of the box in bytes, header included.
    size: u64,
    /// Offset to the start of the contained data (or header size).
    offset: u64,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    const MIN_LARGE_SIZE: u64 = 16;
}

/// See ISO 14496-12:2015 § 4.2
struct BMFFBox<'a, T: ?Sized> {
    head: BoxHeader,
    content: Take<&'a mut T>,
}

impl<T: Read + ?Sized> BMFFBox<'_, T> {
    fn read_into_try_vec(&mut self) -> std::io::Result<TryVec<u8>> {
        let limit = self.content.limit();
        let mut vec = std::vec::Vec::new();
        vec.try_reserve_exact(usize::try_from(limit).map_err(|_| std::io::ErrorKind::OutOfMemory)?)
            .map_err(|_| std::io::ErrorKind::OutOfMemory)?;
        self.content.read_to_end(&mut vec)?;
        if vec.len().to_u64() != limit {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        Ok(vec.into())
    }

    fn get_header(&self) -> &BoxHeader {
        &self.head
    }
}

impl<T: Read + ?Sized> Read for BMFFBox<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<T: Read + ?Sized> Budget for BMFFBox<'_, T> {
    fn bytes_left(&self) -> u64 {
        self.content.limit()
    }
}

impl<T: ?Sized> Drop for BMFFBox<'_, T> {
    fn drop(&mut self) {
        if self.content.limit() > 0 {
            let name: FourCC = From::from(self.head.name);
            debug!("Dropping {} bytes in '{}'", self.content.limit(), name);
        }
    }
}

#[test]
fn box_read_to_end() {
    let tmp = &mut b"1234567890".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::ItemDataBox, size: 13, offset: 8 },
        content: <_ as Read>::take(tmp, 5),
    };
    let buf = src.read_into_try_vec().unwrap();
    assert_eq!(buf.len(), 5);
    assert_eq!(buf, b"12345".as_ref());
}

#[test]
fn box_read_to_end_short_source() {
    let tmp = &mut b"123".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::ItemDataBox, size: 13, offset: 8 },
        content: <_ as Read>::take(tmp, 5),
    };
    assert!(src.read_into_try_vec().is_err());
}

/// Read and parse a box header, checking it against the `budget` left in
/// the enclosing box or stream.
///
/// See ISO 14496-12:2015 § 4.2
fn read_box_header<T: ReadBytesExt + ?Sized>(src: &mut T, budget: u64) -> Result<BoxHeader> {
    if budget < BoxHeader::MIN_SIZE {
        return Err(Error::TruncatedBox("fewer than 8 bytes left for a box header"));
    }
    let size32 = be_u32(src)?;
    let name = BoxType::from(be_u32(src)?);
    let (size, offset) = match size32 {
        // Box extends to the end of whatever encloses it; usually the last mdat.
        0 => (budget, BoxHeader::MIN_SIZE),
        1 => {
            if budget < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::TruncatedBox("no room for a 64-bit box size"));
            }
            let size64 = be_u64(src)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData("malformed wide size"));
            }
            (size64, BoxHeader::MIN_LARGE_SIZE)
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData("malformed size"));
            }
            (u64::from(size32), BoxHeader::MIN_SIZE)
        },
    };
    if size > budget {
        return Err(Error::TruncatedBox("box is larger than its enclosing box"));
    }
    Ok(BoxHeader { name, size, offset })
}

/// Parse the extra header fields for a full box.
fn read_fullbox_extra<T: ReadBytesExt + ?Sized>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

/// Parse one box from `src` and dispatch it to its handler.
///
/// Whatever the handler leaves unread is discarded here, so the returned
/// budget is always the enclosing budget minus the declared box size.
fn parse_box(src: &mut dyn Budget, ctx: &mut ParseContext<'_>) -> Result<u64> {
    let budget = src.bytes_left();
    let head = read_box_header(src, budget)?;
    let mut b = BMFFBox {
        head,
        content: (&mut *src).take(head.size - head.offset),
    };

    match head.name {
        BoxType::FileTypeBox => {
            let major = FourCC::from(be_u32(&mut b)?);
            debug!("ftyp major brand {major}");
        },
        BoxType::MetadataBox | BoxType::ItemReferenceBox => {
            let (version, flags) = read_fullbox_extra(&mut b)?;
            debug!("{:?} version {version} flags {flags:#x}", head.name);
            let max_children = ctx.config.max_children_per_box;
            parse_children(&mut b, ctx, max_children)?;
        },
        BoxType::ItemPropertiesBox => {
            let max_children = ctx.config.max_children_per_box;
            parse_children(&mut b, ctx, max_children)?;
        },
        BoxType::ItemInfoBox => meta::read_iinf(&mut b, ctx)?,
        BoxType::ItemInfoEntry => meta::read_infe(&mut b, ctx)?,
        BoxType::ItemPropertyContainerBox => meta::read_ipco(&mut b, ctx)?,
        BoxType::ItemPropertyAssociationBox => meta::read_ipma(&mut b, ctx)?,
        BoxType::ItemLocationBox => meta::read_iloc(&mut b, ctx)?,
        BoxType::ItemDataBox => meta::read_idat(&mut b, ctx)?,
        BoxType::MediaDataBox => {
            debug!("mdat with {} bytes, box tree complete", b.bytes_left());
            ctx.finished = true;
            // Item payloads are read by seeking later, not through this box.
            b.content.set_limit(0);
        },
        _ => debug!("{:?} (skipped)", b.get_header()),
    }

    skip_box_remain(&mut b)?;
    Ok(budget - head.size)
}

/// Parse up to `max_children` boxes until the budget of `src` is used up or
/// the media data box has been reached.
fn parse_children(src: &mut dyn Budget, ctx: &mut ParseContext<'_>, max_children: u32) -> Result<()> {
    if ctx.depth >= MAX_BOX_DEPTH {
        return Err(Error::InvalidData("boxes nested too deeply"));
    }
    ctx.depth += 1;

    let mut left = src.bytes_left();
    let mut parsed = 0;
    while left > 0 && !ctx.finished && parsed < max_children {
        ctx.stop.check()?;
        left = parse_box(src, ctx)?;
        parsed += 1;
    }
    if left > 0 && !ctx.finished {
        debug!("stopped after {parsed} boxes with {left} bytes left");
    }

    ctx.depth -= 1;
    Ok(())
}

/// Skip over the remain data of a box.
fn skip_box_remain<T: Read + ?Sized>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let remain = src.bytes_left();
    if remain > 0 {
        debug!("remain {remain} (skipped) in {:?}", src.get_header());
    }
    skip(src, remain)
}

/// Skip a number of bytes that we don't care to parse.
fn skip<T: Read + ?Sized>(src: &mut T, bytes: u64) -> Result<()> {
    let copied = std::io::copy(&mut src.take(bytes), &mut std::io::sink())?;
    if copied != bytes {
        return Err(Error::TruncatedBox("stream ended inside a box"));
    }
    Ok(())
}

fn be_u16<T: ReadBytesExt + ?Sized>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u32<T: ReadBytesExt + ?Sized>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u64<T: ReadBytesExt + ?Sized>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}

/// Returns true if `magic` looks like the start of a HEIC file.
///
/// Only the major brand at bytes 8..12 is checked.
pub fn is_heic(magic: &[u8]) -> bool {
    magic.get(8..12).is_some_and(|brand| brand == b"heic")
}

/// Parsed box tree of a HEIC file: items, properties and inline item data.
///
/// Built once by [`HeicContainer::parse`] and read-only afterwards. Coded
/// tile data stays in the source stream and is read on demand.
pub struct HeicContainer {
    items: ItemTable,
    properties: PropertyTable,
    idat: Option<TryVec<u8>>,
    stream_len: u64,
}

impl HeicContainer {
    /// Parse the box tree of `src` up to the media data box.
    pub fn parse<R: Read + Seek>(src: &mut R, config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        let stream_len = src.seek(SeekFrom::End(0)).map_err(|_| Error::NotSeekable)?;
        src.seek(SeekFrom::Start(0)).map_err(|_| Error::NotSeekable)?;

        let mut ctx = ParseContext::new(config, stop);
        let mut f = OffsetReader::new(src, stream_len);
        parse_children(&mut f, &mut ctx, config.max_children_per_box)?;

        if !ctx.finished {
            return Err(Error::MissingMediaData);
        }

        let ParseContext { items, properties, idat, .. } = ctx;
        debug!("parsed {} items, {} properties", items.count(), properties.len());
        Ok(Self { items, properties, idat, stream_len })
    }

    /// Number of item slots declared by `iinf`; valid ids are `1..=item_count()`.
    pub fn item_count(&self) -> u32 {
        self.items.count()
    }

    /// Look up an item by id.
    pub fn item(&self, item_id: u32) -> Result<&Item> {
        self.items.get(item_id)
    }

    /// All items with their ids, in id order.
    pub fn items(&self) -> impl Iterator<Item = (u32, &Item)> {
        self.items.iter()
    }

    /// Look up a property by its 1-based index.
    pub fn property(&self, index: u16) -> Result<&Property> {
        self.properties.get(index)
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Contents of the `idat` box, if there was one.
    pub fn idat(&self) -> Option<&[u8]> {
        self.idat.as_deref()
    }

    /// Resolve the grid descriptor.
    pub fn grid(&self) -> Result<GridDescriptor> {
        GridDescriptor::resolve(self)
    }

    /// Read the first `Exif` item, if any.
    pub fn read_exif<R: Read + Seek>(&self, src: &mut R) -> Result<Option<TryVec<u8>>> {
        let Some((item_id, item)) = self.items.iter().find(|(_, item)| item.item_type == b"Exif") else {
            return Ok(None);
        };
        if item.location.is_none() {
            warn!("Exif item {item_id} has no location, ignoring it");
            return Ok(None);
        }
        let data = self.read_item_data(src, item)?;
        debug!("Exif item {item_id}: {} bytes", data.len());
        Ok(Some(data.into()))
    }

    /// Decode every tile of the grid and composite them.
    pub fn decode<R, D>(&self, src: &mut R, decoder: &mut D, config: &DecodeConfig, stop: &dyn Stop) -> Result<HeicImage>
    where
        R: Read + Seek,
        D: HevcDecoder + ?Sized,
    {
        let exif = self.read_exif(src)?;
        let grid = self.grid()?;
        config.validate_grid_tiles(grid.tile_count())?;
        config.validate_total_megapixels(grid.width(), grid.height())?;

        let mut image = HeicImage::new(grid)?;
        decode::decode_grid(self, src, decoder, &grid, &mut image.pixels, stop)?;
        image.exif = exif;
        image.colorspace = Colorspace::YCbCr;
        Ok(image)
    }

    /// Copy the bytes an item's `iloc` entry points at.
    fn read_item_data<R: Read + Seek>(&self, src: &mut R, item: &Item) -> Result<std::vec::Vec<u8>> {
        let location = item.location.ok_or(Error::InvalidData("item has no iloc entry"))?;
        let size = location.size.to_usize();
        let mut buf = std::vec::Vec::new();

        match item.construction_method {
            ConstructionMethod::File => {
                let end = u64::from(location.offset) + u64::from(location.size);
                if end > self.stream_len {
                    return Err(Error::InvalidData("item extent runs past the end of the stream"));
                }
                buf.try_reserve_exact(size).map_err(|_| Error::AllocationFailure)?;
                src.seek(SeekFrom::Start(location.offset.into()))?;
                src.by_ref().take(location.size.into()).read_to_end(&mut buf)?;
                if buf.len() != size {
                    return Err(Error::TruncatedBox("short read of item data"));
                }
            },
            ConstructionMethod::Idat => {
                let start = location.offset.to_usize();
                let data = self
                    .idat()
                    .and_then(|idat| idat.get(start..start.checked_add(size)?))
                    .ok_or(Error::InvalidData("item extent runs past the end of idat"))?;
                buf.try_reserve_exact(size).map_err(|_| Error::AllocationFailure)?;
                buf.extend_from_slice(data);
            },
            ConstructionMethod::Item => return Err(Error::UnsupportedDataSource),
        }
        Ok(buf)
    }
}

/// Read a HEIC grid image, decoding its tiles with `decoder`.
///
/// Uses [`DecodeConfig::default`] and no cancellation.
pub fn read_heic<R, D>(src: &mut R, decoder: &mut D) -> Result<HeicImage>
where
    R: Read + Seek,
    D: HevcDecoder + ?Sized,
{
    read_heic_with_config(src, decoder, &DecodeConfig::default(), &Unstoppable)
}

/// Read a HEIC grid image with resource limits and cancellation support.
///
/// # Arguments
///
/// * `src` - Seekable reader for the HEIC file
/// * `decoder` - HEVC decoder, reset before every tile
/// * `config` - Resource limits
/// * `stop` - Cancellation token (use [`Unstoppable`] if not needed)
pub fn read_heic_with_config<R, D>(src: &mut R, decoder: &mut D, config: &DecodeConfig, stop: &dyn Stop) -> Result<HeicImage>
where
    R: Read + Seek,
    D: HevcDecoder + ?Sized,
{
    let container = HeicContainer::parse(src, config, stop)?;
    container.decode(src, decoder, config, stop)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(bytes: &[u8], budget: u64) -> Result<BoxHeader> {
        read_box_header(&mut &bytes[..], budget)
    }

    #[test]
    fn header_needs_eight_bytes_of_budget() {
        let bytes = [0, 0, 0, 8, b'f', b'r', b'e', b'e'];
        assert!(matches!(header(&bytes, 7), Err(Error::TruncatedBox(_))));
        assert_eq!(header(&bytes, 8).unwrap().size, 8);
    }

    #[test]
    fn header_larger_than_budget() {
        let bytes = [0, 0, 0, 32, b'f', b'r', b'e', b'e'];
        assert!(matches!(header(&bytes, 31), Err(Error::TruncatedBox(_))));
    }

    #[test]
    fn header_wide_size() {
        let bytes = [0, 0, 0, 1, b'm', b'd', b'a', b't', 0, 0, 0, 0, 0, 0, 0, 20];
        let h = header(&bytes, 100).unwrap();
        assert_eq!(h.size, 20);
        assert_eq!(h.offset, 16);
        assert!(matches!(header(&bytes, 12), Err(Error::TruncatedBox(_))));
    }

    #[test]
    fn header_size_zero_takes_rest_of_budget() {
        let bytes = [0, 0, 0, 0, b'm', b'd', b'a', b't'];
        assert_eq!(header(&bytes, 77).unwrap().size, 77);
    }

    #[test]
    fn header_malformed_size() {
        let bytes = [0, 0, 0, 4, b'f', b'r', b'e', b'e'];
        assert!(matches!(header(&bytes, 100), Err(Error::InvalidData(_))));
    }

    #[test]
    fn unknown_box_consumes_exactly_its_size() {
        let config = DecodeConfig::default();
        let mut ctx = ParseContext::new(&config, &Unstoppable);
        let bytes = [0, 0, 0, 12, b'f', b'r', b'e', b'e', 1, 2, 3, 4, 0xAA, 0xBB];
        let mut cursor = std::io::Cursor::new(&bytes[..]);
        let mut f = OffsetReader::new(&mut cursor, bytes.len().to_u64());
        let left = parse_box(&mut f, &mut ctx).unwrap();
        assert_eq!(left, 2);
        assert_eq!(f.bytes_left(), 2);
    }

    #[test]
    fn child_count_is_capped() {
        let mut stream = std::vec::Vec::new();
        stream.extend_from_slice(&[0, 0, 0, 41, b'i', b'p', b'r', b'p']);
        stream.extend_from_slice(&[0, 0, 0, 8, b'f', b'r', b'e', b'e']);
        stream.extend_from_slice(&[0, 0, 0, 8, b'f', b'r', b'e', b'e']);
        stream.extend_from_slice(&[0, 0, 0, 9, b'i', b'd', b'a', b't', 7]);
        stream.extend_from_slice(&[0, 0, 0, 8, b'f', b'r', b'e', b'e']);
        stream.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        let config = DecodeConfig::default().with_max_children_per_box(2);
        let mut ctx = ParseContext::new(&config, &Unstoppable);
        let mut cursor = std::io::Cursor::new(&stream[..]);
        let mut f = OffsetReader::new(&mut cursor, stream.len().to_u64());
        assert_eq!(parse_box(&mut f, &mut ctx).unwrap(), 3);
        assert_eq!(f.bytes_left(), 3);
        assert!(ctx.idat.is_none());
        assert_eq!(cursor.position(), 41);
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut stream = std::vec::Vec::new();
        let depth = MAX_BOX_DEPTH as usize + 4;
        for level in 0..depth {
            let size = (depth - level) * 8;
            stream.extend_from_slice(&(size as u32).to_be_bytes());
            stream.extend_from_slice(b"iprp");
        }
        let config = DecodeConfig::default();
        let mut ctx = ParseContext::new(&config, &Unstoppable);
        let mut cursor = std::io::Cursor::new(&stream[..]);
        let mut f = OffsetReader::new(&mut cursor, stream.len().to_u64());
        assert!(matches!(
            parse_children(&mut f, &mut ctx, 100),
            Err(Error::InvalidData("boxes nested too deeply"))
        ));
    }

    #[test]
    fn megapixel_limit_compares_whole_pixels() {
        let config = DecodeConfig::default().with_total_megapixels_limit(1);
        assert!(config.validate_total_megapixels(1000, 1000).is_ok());
        assert!(matches!(config.validate_total_megapixels(1000, 1001), Err(Error::ResourceLimitExceeded(_))));
        assert!(DecodeConfig::unlimited().validate_total_megapixels(u32::MAX, u32::MAX).is_ok());
    }

    #[test]
    fn sniff() {
        assert!(is_heic(b"\0\0\0\x18ftypheic\0\0\0\0"));
        assert!(!is_heic(b"\0\0\0\x18ftypavif\0\0\0\0"));
        assert!(!is_heic(b"\0\0\0\x18ftyphe"));
    }
}
