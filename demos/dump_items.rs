// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Print the item table, properties and grid layout of HEIC files.
//!
//! Usage: `cargo run --example dump_items -- file.heic [more.heic ...]`
//! Set `RUST_LOG=debug` to see the box tree as it is parsed.

use heic_grid::{DecodeConfig, HeicContainer, Unstoppable};
use std::fs::File;

fn dump(path: &str) -> heic_grid::Result<()> {
    let mut file = File::open(path)?;
    let container = HeicContainer::parse(&mut file, &DecodeConfig::default(), &Unstoppable)?;

    println!("{path}: {} items, {} properties", container.item_count(), container.property_count());
    for (id, item) in container.items() {
        let location = match item.location {
            Some(loc) => format!("{:?} offset {} size {}", item.construction_method, loc.offset, loc.size),
            None => "no location".to_owned(),
        };
        let properties: Vec<String> = item
            .associations
            .iter()
            .map(|a| {
                let name = container
                    .property(a.index)
                    .map_or_else(|_| "?".to_owned(), |p| p.property_type.to_string());
                format!("{}{name}#{}", if a.essential { "!" } else { "" }, a.index)
            })
            .collect();
        println!("  item {id:>4} '{}' {location} [{}]", item.item_type, properties.join(" "));
    }

    match container.grid() {
        Ok(grid) => println!(
            "  grid {}x{} tiles, {}x{} declared, {}x{} decoded",
            grid.columns(),
            grid.rows(),
            grid.composite_width,
            grid.composite_height,
            grid.width(),
            grid.height()
        ),
        Err(e) => println!("  no usable grid: {e}"),
    }
    if let Some(exif) = container.read_exif(&mut file)? {
        println!("  exif: {} bytes", exif.len());
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let mut failed = false;
    for path in std::env::args().skip(1) {
        if let Err(e) = dump(&path) {
            eprintln!("{path}: {e}");
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
}
