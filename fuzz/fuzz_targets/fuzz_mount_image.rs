#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::io::Read;
use std::sync::Arc;
use wirefs::sim::{SimBus, SimDevice};
use wirefs::{CacheRegistry, DeviceAddress, WireFile, WireFsConfig};

const ADDR: DeviceAddress = DeviceAddress(0x2D00_0000_0000_0F01);
const PAGES: usize = 16;
const PAGE_LEN: usize = 32;

#[derive(Debug, Arbitrary)]
struct Image {
    write_once: bool,
    pages: Vec<(u8, [u8; PAGE_LEN])>,
    redirects: Vec<(u8, u8)>,
}

fn walk(file: &WireFile, depth: usize) {
    if depth > 4 {
        return;
    }
    if let Ok(true) = file.is_directory() {
        for name in file.list().unwrap_or_default() {
            if let Ok(child) = file.child(&name) {
                walk(&child, depth + 1);
            }
        }
    } else if let Ok(mut reader) = file.reader() {
        let mut sink = Vec::new();
        let _ = reader.read_to_end(&mut sink);
    }
}

// Mounting an arbitrary page image must fail cleanly, never panic or hang
fuzz_target!(|image: Image| {
    let device = if image.write_once {
        SimDevice::write_once(ADDR, PAGES, PAGE_LEN)
    } else {
        SimDevice::rewritable(ADDR, PAGES, PAGE_LEN)
    };
    for (page, bytes) in &image.pages {
        device.program(*page as usize % PAGES, bytes);
    }
    if image.write_once {
        for (page, target) in &image.redirects {
            device.set_redirect(*page as usize % PAGES, *target as usize % PAGES);
        }
    }

    let bus = Arc::new(SimBus::new(vec![device]));
    let registry = CacheRegistry::new(bus, WireFsConfig::default());
    if let Ok(root) = WireFile::new(registry, &[ADDR], "/") {
        walk(&root, 0);
    }
});
