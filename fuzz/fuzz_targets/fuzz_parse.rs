#![no_main]
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let config = heic_grid::DecodeConfig::default();
    if let Ok(container) = heic_grid::HeicContainer::parse(&mut Cursor::new(data), &config, &enough::Unstoppable) {
        let _ = container.grid();
        let _ = container.read_exif(&mut Cursor::new(data));
        for (id, item) in container.items() {
            for association in &item.associations {
                let _ = (id, container.property(association.index));
            }
        }
    }
});
