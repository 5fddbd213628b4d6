#![no_main]
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let config = heic_grid::DecodeConfig::default()
        .with_max_children_per_box(16)
        .with_max_items(64)
        .with_max_item_properties(64)
        .with_max_grid_tiles(16)
        .with_total_megapixels_limit(8);
    if let Ok(container) = heic_grid::HeicContainer::parse(&mut Cursor::new(data), &config, &enough::Unstoppable) {
        let _ = container.grid();
    }
});
