// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::boxes::{BoxType, FourCC};
use crate::hvcc;
use crate::{
    BMFFBox, Budget as _, DecodeConfig, Error, Result, Stop, ToUsize as _, TryVec, be_u16, be_u32, read_box_header,
    read_fullbox_extra,
};
use arrayvec::ArrayVec;
use bitreader::BitReader;
use byteorder::ReadBytesExt;
use log::debug;
use std::io::Read;

/// Property associations kept per item.
pub const MAX_ASSOCIATIONS: usize = 10;

/// Where an item's data lives.
///
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionMethod {
    #[default]
    File,
    Idat,
    Item,
}

/// A single extent: an offset and a size, relative to the file or to `idat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemLocation {
    pub offset: u32,
    pub size: u32,
}

/// Link from an item to an entry of the property table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyAssociation {
    pub essential: bool,
    /// 1-based index into the property table.
    pub index: u16,
}

#[derive(Debug, Default, Clone)]
pub struct Item {
    pub item_type: FourCC,
    pub associations: ArrayVec<PropertyAssociation, MAX_ASSOCIATIONS>,
    pub construction_method: ConstructionMethod,
    /// `None` until an `iloc` entry names the item.
    pub location: Option<ItemLocation>,
}

/// An entry of `ipco`. `hvcC` payloads are stored already converted to Annex-B.
#[derive(Debug)]
pub struct Property {
    pub property_type: FourCC,
    pub payload: TryVec<u8>,
}

/// Items indexed by id. Slot 0 exists but is never a valid id.
#[derive(Debug, Default)]
pub(crate) struct ItemTable {
    slots: TryVec<Item>,
}

impl ItemTable {
    fn with_count(count: u32) -> Result<Self> {
        let len = count.to_usize().checked_add(1).ok_or(Error::ResourceLimitExceeded("item count too large"))?;
        let mut slots = TryVec::with_capacity(len)?;
        for _ in 0..len {
            slots.push(Item::default())?;
        }
        Ok(Self { slots })
    }

    pub(crate) fn count(&self) -> u32 {
        u32::try_from(self.slots.len().saturating_sub(1)).unwrap_or(u32::MAX)
    }

    fn check(&self, item_id: u32) -> Result<usize> {
        if item_id == 0 || item_id > self.count() {
            return Err(Error::InvalidItemId(item_id));
        }
        Ok(item_id.to_usize())
    }

    pub(crate) fn get(&self, item_id: u32) -> Result<&Item> {
        let slot = self.check(item_id)?;
        self.slots.get(slot).ok_or(Error::InvalidItemId(item_id))
    }

    pub(crate) fn get_mut(&mut self, item_id: u32) -> Result<&mut Item> {
        let slot = self.check(item_id)?;
        self.slots.iter_mut().nth(slot).ok_or(Error::InvalidItemId(item_id))
    }

    /// Valid items in id order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &Item)> {
        (1..=self.count()).zip(self.slots.iter().skip(1))
    }
}

/// Properties in `ipco` order, addressed by 1-based index.
#[derive(Debug, Default)]
pub(crate) struct PropertyTable {
    entries: TryVec<Property>,
}

impl PropertyTable {
    pub(crate) fn get(&self, index: u16) -> Result<&Property> {
        let slot = usize::from(index).checked_sub(1).ok_or(Error::InvalidPropertyIndex(index))?;
        self.entries.get(slot).ok_or(Error::InvalidPropertyIndex(index))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mutable state threaded through the box handlers.
pub(crate) struct ParseContext<'a> {
    pub(crate) config: &'a DecodeConfig,
    pub(crate) stop: &'a dyn Stop,
    pub(crate) items: ItemTable,
    seen_iinf: bool,
    pub(crate) properties: PropertyTable,
    pub(crate) idat: Option<TryVec<u8>>,
    /// Current container nesting level.
    pub(crate) depth: u32,
    /// Set once the media data box is reached.
    pub(crate) finished: bool,
}

impl<'a> ParseContext<'a> {
    pub(crate) fn new(config: &'a DecodeConfig, stop: &'a dyn Stop) -> Self {
        Self {
            config,
            stop,
            items: ItemTable::default(),
            seen_iinf: false,
            properties: PropertyTable::default(),
            idat: None,
            depth: 0,
            finished: false,
        }
    }
}

/// Parse an Item Information Box
///
/// See ISO 14496-12:2015 § 8.11.6
pub(crate) fn read_iinf<T: Read + ?Sized>(src: &mut BMFFBox<'_, T>, ctx: &mut ParseContext<'_>) -> Result<()> {
    let (version, _) = read_fullbox_extra(src)?;
    let entry_count = match version {
        0 => be_u16(src)?.into(),
        _ => be_u32(src)?,
    };
    if ctx.seen_iinf {
        return Err(Error::InvalidData("multiple iinf boxes"));
    }
    if entry_count > ctx.config.max_items {
        return Err(Error::ResourceLimitExceeded("item count limit exceeded"));
    }
    debug!("iinf version {version} with {entry_count} items");
    ctx.seen_iinf = true;
    ctx.items = ItemTable::with_count(entry_count)?;

    crate::parse_children(src, ctx, entry_count)
}

/// Parse an Item Info Entry; only version 2 is understood.
///
/// See ISO 14496-12:2015 § 8.11.6.2
pub(crate) fn read_infe<T: Read + ?Sized>(src: &mut BMFFBox<'_, T>, ctx: &mut ParseContext<'_>) -> Result<()> {
    let (version, _) = read_fullbox_extra(src)?;
    if version != 2 {
        return Err(Error::UnsupportedVersion("infe version must be 2"));
    }
    let item_id = u32::from(be_u16(src)?);
    let _item_protection_index = be_u16(src)?;
    let item_type = FourCC::from(be_u32(src)?);
    debug!("infe item_id {item_id} item_type: {item_type}");

    ctx.items.get_mut(item_id)?.item_type = item_type;
    Ok(())
}

/// Parse an Item Property Container box.
///
/// Every child is a property; it is stored whole, in order, and `hvcC`
/// payloads are converted to Annex-B on the way in.
///
/// See ISO 23008-12:2017 § 9.3.1
pub(crate) fn read_ipco<T: Read + ?Sized>(src: &mut BMFFBox<'_, T>, ctx: &mut ParseContext<'_>) -> Result<()> {
    if !ctx.properties.is_empty() {
        return Err(Error::InvalidData("multiple ipco boxes"));
    }
    let limit = ctx.config.max_item_properties.to_usize();

    let mut left = src.bytes_left();
    while left > 0 {
        ctx.stop.check()?;
        if ctx.properties.len() >= limit {
            return Err(Error::ResourceLimitExceeded("item property count limit exceeded"));
        }
        let head = read_box_header(src, left)?;
        let mut b = BMFFBox {
            head,
            content: (&mut *src).take(head.size - head.offset),
        };
        let mut payload = b.read_into_try_vec()?;
        if head.name == BoxType::HevcConfigurationBox {
            payload = hvcc::hvcc_to_annexb(&payload)?;
        }
        let property_type = FourCC::from(head.name);
        debug!("property {} '{property_type}': {} bytes", ctx.properties.len() + 1, payload.len());
        ctx.properties.entries.push(Property { property_type, payload })?;
        left -= head.size;
    }
    Ok(())
}

/// Parse an Item Property Association box.
///
/// See ISO 23008-12:2017 § 9.3.1
pub(crate) fn read_ipma<T: Read + ?Sized>(src: &mut BMFFBox<'_, T>, ctx: &mut ParseContext<'_>) -> Result<()> {
    let (version, flags) = read_fullbox_extra(src)?;
    let wide_index = flags & 1 == 1;
    let entry_count = be_u32(src)?;

    for _ in 0..entry_count {
        ctx.stop.check()?;
        let item_id = match version {
            0 => be_u16(src)?.into(),
            _ => be_u32(src)?,
        };
        let item = ctx.items.get_mut(item_id)?;
        let association_count = src.read_u8()?;
        if association_count.to_usize() > MAX_ASSOCIATIONS {
            return Err(Error::TooManyAssociations(item_id));
        }

        for _ in 0..association_count {
            let mut buf = [0u8; 2];
            let association = &mut buf[..if wide_index { 2 } else { 1 }];
            src.read_exact(association)?;
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let index = association.read_u16(association.remaining().try_into()?)?;
            item.associations
                .try_push(PropertyAssociation { essential, index })
                .map_err(|_| Error::TooManyAssociations(item_id))?;
        }
    }
    Ok(())
}

/// Parse an Item Location Box; versions 0 through 2 with a single 32-bit
/// extent per item.
///
/// See ISO 14496-12:2015 § 8.11.3
pub(crate) fn read_iloc<T: Read + ?Sized>(src: &mut BMFFBox<'_, T>, ctx: &mut ParseContext<'_>) -> Result<()> {
    let (version, _) = read_fullbox_extra(src)?;
    if version > 2 {
        return Err(Error::UnsupportedVersion("iloc version must be 0, 1 or 2"));
    }

    let mut field_sizes = [0u8; 2];
    src.read_exact(&mut field_sizes)?;
    let mut sizes = BitReader::new(&field_sizes);
    let offset_size = sizes.read_u8(4)?;
    let length_size = sizes.read_u8(4)?;
    let base_offset_size = sizes.read_u8(4)?;
    let index_size = sizes.read_u8(4)?;
    if offset_size != 4 || length_size != 4 || base_offset_size != 0 || index_size != 0 {
        return Err(Error::UnsupportedLocationEncoding);
    }

    let item_count = match version {
        2 => be_u32(src)?,
        _ => be_u16(src)?.into(),
    };

    for _ in 0..item_count {
        ctx.stop.check()?;
        let item_id = u32::from(be_u16(src)?);
        let item = ctx.items.get_mut(item_id)?;

        item.construction_method = match version {
            0 => ConstructionMethod::File,
            _ => match be_u16(src)? & 0xf {
                0 => ConstructionMethod::File,
                1 => ConstructionMethod::Idat,
                2 => ConstructionMethod::Item,
                _ => return Err(Error::InvalidData("construction_method is not 0, 1 or 2")),
            },
        };
        let _data_reference_index = be_u16(src)?;

        let extent_count = be_u16(src)?;
        if extent_count != 1 {
            return Err(Error::UnsupportedExtentCount(extent_count));
        }
        let offset = be_u32(src)?;
        let size = be_u32(src)?;
        debug!("iloc item {item_id}: {:?} offset {offset} size {size}", item.construction_method);
        item.location = Some(ItemLocation { offset, size });
    }
    Ok(())
}

/// Keep the contents of the Item Data box.
///
/// See ISO 14496-12:2015 § 8.11.11
pub(crate) fn read_idat<T: Read + ?Sized>(src: &mut BMFFBox<'_, T>, ctx: &mut ParseContext<'_>) -> Result<()> {
    if ctx.idat.is_some() {
        return Err(Error::InvalidData("multiple idat boxes"));
    }
    ctx.idat = Some(src.read_into_try_vec()?);
    Ok(())
}
