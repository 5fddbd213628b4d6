// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::decode::TILE_SIZE;
use crate::{ConstructionMethod, Error, HeicContainer, Result, ToUsize as _};
use log::debug;

/// Layout of a grid image: `rows × columns` tiles of [`TILE_SIZE`] pixels.
///
/// The composite width and height are recorded but not used for cropping;
/// decoded images always cover whole tiles.
///
/// See ISO 23008-12:2017 § 6.6.2.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDescriptor {
    pub rows_minus_one: u8,
    pub columns_minus_one: u8,
    pub composite_width: u16,
    pub composite_height: u16,
}

impl GridDescriptor {
    /// Encoded size of a descriptor with 16-bit dimension fields.
    pub const SIZE: usize = 8;

    /// Parse the 8-byte grid descriptor.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(&[version, flags, rows_minus_one, columns_minus_one, w0, w1, h0, h1]) = data.get(..Self::SIZE) else {
            return Err(Error::AuxiliaryTooSmall(data.len()));
        };
        // flags & 1 determines field size: 0 = 16-bit, 1 = 32-bit
        if flags & 1 != 0 {
            return Err(Error::UnsupportedFieldWidth);
        }
        let grid = Self {
            rows_minus_one,
            columns_minus_one,
            composite_width: u16::from_be_bytes([w0, w1]),
            composite_height: u16::from_be_bytes([h0, h1]),
        };
        debug!("grid version {version}: {grid:?}");
        Ok(grid)
    }

    /// Find the `grid` item and parse its descriptor from `idat`.
    pub(crate) fn resolve(container: &HeicContainer) -> Result<Self> {
        let (item_id, item) = container
            .items()
            .find(|(_, item)| item.item_type == b"grid")
            .ok_or(Error::NoGridItem)?;
        if item.construction_method != ConstructionMethod::Idat {
            return Err(Error::UnsupportedDataSource);
        }

        let idat = container.idat().unwrap_or_default();
        let data = match item.location {
            Some(location) => {
                let start = location.offset.to_usize().min(idat.len());
                let end = start.saturating_add(location.size.to_usize()).min(idat.len());
                &idat[start..end]
            },
            None => idat,
        };
        debug!("grid item {item_id}: {} descriptor bytes", data.len());
        Self::parse(data)
    }

    pub fn rows(&self) -> u32 {
        u32::from(self.rows_minus_one) + 1
    }

    pub fn columns(&self) -> u32 {
        u32::from(self.columns_minus_one) + 1
    }

    pub fn tile_count(&self) -> u32 {
        self.rows() * self.columns()
    }

    /// Width of the decoded composite, in pixels.
    pub fn width(&self) -> u32 {
        self.columns() * TILE_SIZE
    }

    /// Height of the decoded composite, in pixels.
    pub fn height(&self) -> u32 {
        self.rows() * TILE_SIZE
    }

    /// Tile item ids with the pixel origin of each tile, in row-major order.
    ///
    /// Tile `k` (counting from 0) is item `k + 1`.
    pub fn tile_origins(&self) -> impl Iterator<Item = (u32, u32, u32)> + use<> {
        let columns = self.columns();
        (0..self.tile_count()).map(move |k| (k + 1, (k % columns) * TILE_SIZE, (k / columns) * TILE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_small() {
        assert!(matches!(GridDescriptor::parse(&[0; 7]), Err(Error::AuxiliaryTooSmall(7))));
        assert!(matches!(GridDescriptor::parse(&[]), Err(Error::AuxiliaryTooSmall(0))));
    }

    #[test]
    fn wide_fields_unsupported() {
        let data = [0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(GridDescriptor::parse(&data), Err(Error::UnsupportedFieldWidth)));
    }

    #[test]
    fn parse_fields() {
        let grid = GridDescriptor::parse(&[0, 0, 1, 2, 0x05, 0xa0, 0x03, 0xc0]).unwrap();
        assert_eq!(grid.rows(), 2);
        assert_eq!(grid.columns(), 3);
        assert_eq!(grid.composite_width, 1440);
        assert_eq!(grid.composite_height, 960);
        assert_eq!(grid.width(), 1536);
        assert_eq!(grid.height(), 1024);
        assert_eq!(grid.tile_count(), 6);
    }

    #[test]
    fn two_by_two_origins() {
        let grid = GridDescriptor::parse(&[0, 0, 1, 1, 0x04, 0x00, 0x04, 0x00]).unwrap();
        let tiles: std::vec::Vec<_> = grid.tile_origins().collect();
        assert_eq!(tiles, [(1, 0, 0), (2, 512, 0), (3, 0, 512), (4, 512, 512)]);
    }

    #[test]
    fn single_tile() {
        let grid = GridDescriptor::parse(&[0; 8]).unwrap();
        assert_eq!(grid.tile_origins().collect::<std::vec::Vec<_>>(), [(1, 0, 0)]);
        assert_eq!((grid.width(), grid.height()), (512, 512));
    }
}
