//! Write-once memory: redirection, bitmap commits and flush recovery

use proptest::prelude::*;
use std::io::{Read, Write};
use std::sync::Arc;
use wirefs::core::allocator::BitmapPlacement;
use wirefs::core::header::{FsLayout, PointerWidth};
use wirefs::core::page::encode_packet;
use wirefs::sim::{SimBus, SimDevice};
use wirefs::{
    CacheRegistry, Device, DeviceAddress, MemoryCache, PageId, PageState, WireFile, WireFsConfig,
    WireFsError,
};

const ADDR: DeviceAddress = DeviceAddress(0x0B00_0000_0000_0009);

fn engine_cache(device: &SimDevice) -> MemoryCache {
    let devices: Vec<Box<dyn Device>> = vec![Box::new(device.clone())];
    let mut cache = MemoryCache::new(devices, WireFsConfig::default()).unwrap();
    cache.set_layout(Some(FsLayout {
        width: PointerWidth::One,
        multi_device: false,
        bitmap: BitmapPlacement::Engine,
    }));
    cache.load_bitmap().unwrap();
    cache
}

fn registry(device: &SimDevice) -> Arc<CacheRegistry> {
    CacheRegistry::new(
        Arc::new(SimBus::new(vec![device.clone()])),
        WireFsConfig::default(),
    )
}

#[test]
fn test_otp_conflict_redirects_to_fresh_page() {
    let device = SimDevice::write_once(ADDR, 16, 32);
    let mut cache = engine_cache(&device);
    cache.mark_used(PageId(5)).unwrap();
    cache.write_page_packet(PageId(5), &[0xFF; 8]).unwrap();
    cache.sync().unwrap();
    assert_eq!(device.page_write_count(5), 1);
    let committed = device.page(5);

    // A nine-byte packet needs a length bit the first packet already cleared.
    cache.write_page_packet(PageId(5), &[0x00; 2]).unwrap();
    cache.write_page_packet(PageId(5), &[0x7F; 9]).unwrap();
    assert_eq!(cache.page_state(PageId(5)), Some(PageState::Verify));
    cache.sync().unwrap();

    let target = cache.redirect_of(PageId(5)).unwrap();
    assert_ne!(target, PageId(5));
    assert_ne!(target, PageId::ROOT);
    assert_eq!(device.redirect(5), target.index());
    assert_eq!(device.page(5), committed);
    assert_eq!(device.page_write_count(5), 1);
    assert_eq!(cache.stats().redirects, 1);
    assert!(cache.write_log().is_empty());

    let mut fresh = engine_cache(&device);
    assert_eq!(fresh.read_page_packet(PageId(5)).unwrap(), vec![0x7F; 9]);
    assert!(fresh.bitmap().unwrap().is_committed_used(target));
}

#[test]
fn test_committed_zero_bits_never_return() {
    let device = SimDevice::write_once(ADDR, 16, 32);
    let snapshot = |d: &SimDevice| (0..16).map(|p| d.page(p)).collect::<Vec<_>>();
    let mut cache = engine_cache(&device);
    let page = cache.allocate_page().unwrap();
    cache.write_page_packet(page, &[0x0F, 0xF0, 0x00]).unwrap();
    cache.sync().unwrap();

    let mut previous = snapshot(&device);
    for pattern in [[0xFFu8; 3], [0xAA; 3], [0x00; 3]] {
        cache.write_page_packet(page, &pattern).unwrap();
        cache.sync().unwrap();
        let now = snapshot(&device);
        for (before, after) in previous.iter().flatten().zip(now.iter().flatten()) {
            assert_eq!(after & !before, 0, "a programmed bit went back to 1");
        }
        assert_eq!(cache.read_page_packet(page).unwrap(), pattern);
        previous = now;
    }
    assert!(cache.stats().redirects >= 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_write_once_bits_only_clear(
        writes in prop::collection::vec(
            (1usize..5, prop::collection::vec(any::<u8>(), 0..=29)),
            1..10
        )
    ) {
        let device = SimDevice::write_once(ADDR, 64, 32);
        let snapshot = |d: &SimDevice| (0..64).map(|p| d.page(p)).collect::<Vec<_>>();
        let mut cache = engine_cache(&device);
        for page in 1..5 {
            cache.mark_used(PageId(page)).unwrap();
        }

        let mut previous = snapshot(&device);
        for (page, payload) in &writes {
            let page = PageId(*page as u32);
            cache.write_page_packet(page, payload).unwrap();
            cache.sync().unwrap();

            let now = snapshot(&device);
            for (before, after) in previous.iter().flatten().zip(now.iter().flatten()) {
                prop_assert_eq!(after & !before, 0);
            }
            prop_assert_eq!(&cache.read_page_packet(page).unwrap(), payload);
            previous = now;
        }

        // The device alone, followed through its redirects, holds the last payloads.
        let mut fresh = engine_cache(&device);
        let mut last = std::collections::BTreeMap::new();
        for (page, payload) in &writes {
            last.insert(*page, payload.clone());
        }
        for (page, payload) in last {
            prop_assert_eq!(fresh.read_page_packet(PageId(page as u32)).unwrap(), payload);
        }
    }
}

#[test]
fn test_write_log_collapses_repeated_writes() {
    let device = SimDevice::write_once(ADDR, 16, 32);
    let mut cache = engine_cache(&device);
    cache.mark_used(PageId(3)).unwrap();
    for round in 0..5u8 {
        cache.write_page_packet(PageId(3), &[0xF0 | round]).unwrap();
    }
    assert_eq!(cache.write_log().len(), 1);
    cache.sync().unwrap();
    assert_eq!(device.page_write_count(3), 1);
    assert_eq!(cache.stats().page_writes, 1);
}

#[test]
fn test_redirect_chain_resolves_to_terminal_page() {
    let device = SimDevice::write_once(ADDR, 16, 32);
    device.set_redirect(1, 2);
    device.set_redirect(2, 3);
    device.program(3, &encode_packet(b"end of chain", 3));

    let mut cache = engine_cache(&device);
    assert_eq!(cache.read_page_packet(PageId(1)).unwrap(), b"end of chain");
    assert_eq!(cache.redirect_of(PageId(1)), Some(PageId(2)));
    assert_eq!(cache.redirect_of(PageId(2)), Some(PageId(3)));
}

#[test]
fn test_redirect_cycle_is_corruption() {
    let device = SimDevice::write_once(ADDR, 16, 32);
    device.set_redirect(4, 5);
    device.set_redirect(5, 6);
    device.set_redirect(6, 4);

    let mut cache = engine_cache(&device);
    let err = cache.read_page_packet(PageId(4)).unwrap_err();
    assert!(matches!(err, WireFsError::CircularRedirect { .. }));
    assert!(matches!(
        cache.write_page_packet(PageId(5), b"x"),
        Err(WireFsError::CircularRedirect { .. })
    ));
}

#[test]
fn test_stale_redirect_heals_on_write() {
    let device = SimDevice::write_once(ADDR, 16, 32);
    let mut cache = engine_cache(&device);
    cache.mark_used(PageId(2)).unwrap();
    cache.write_page_packet(PageId(2), &[0x00; 4]).unwrap();
    cache.sync().unwrap();
    assert_eq!(cache.read_page_packet(PageId(2)).unwrap(), vec![0x00; 4]);

    // Another session redirected the page behind this cache's back.
    device.program(9, &encode_packet(&[0x11; 2], 9));
    device.set_redirect(2, 9);
    cache.mark_used(PageId(9)).unwrap();

    cache.write_page_packet(PageId(2), &[0x01; 2]).unwrap();
    cache.sync().unwrap();
    assert_eq!(cache.redirect_of(PageId(2)), Some(PageId(9)));
    assert_eq!(device.redirect(2), 9);
    assert_eq!(device.page(2)[0], 4);
    assert_eq!(cache.read_page_packet(PageId(2)).unwrap(), vec![0x01; 2]);
}

#[test]
fn test_failed_redirect_commit_resumes() {
    let device = SimDevice::write_once(ADDR, 16, 32);
    let mut cache = engine_cache(&device);
    cache.mark_used(PageId(7)).unwrap();
    cache.write_page_packet(PageId(7), &[0x00; 3]).unwrap();
    cache.sync().unwrap();
    cache.write_page_packet(PageId(7), &[0xFF; 3]).unwrap();

    // The target page is written, committing the pointer to it fails.
    device.fail_next_redirects(1);
    let err = cache.sync().unwrap_err();
    assert!(matches!(err, WireFsError::Sync(_)));
    assert_eq!(device.redirect(7), 0);
    assert_eq!(cache.page_state(PageId(7)), Some(PageState::Redirect));
    let target = cache.redirect_of(PageId(7)).unwrap();
    assert_eq!(device.page_write_count(target.index()), 1);

    cache.sync().unwrap();
    assert_eq!(device.redirect(7), target.index());
    assert_eq!(device.page_write_count(target.index()), 1);
    assert!(cache.write_log().is_empty());
    let mut fresh = engine_cache(&device);
    assert_eq!(fresh.read_page_packet(PageId(7)).unwrap(), vec![0xFF; 3]);
}

#[test]
fn test_write_once_filesystem_end_to_end() {
    let device = SimDevice::write_once(ADDR, 64, 32);
    let registry = registry(&device);
    let root = WireFile::new(registry.clone(), &[ADDR], "/").unwrap();
    root.format().unwrap();
    let free = root.free_pages().unwrap();
    assert_eq!(free, 63);

    let file = root.child("OTP.5").unwrap();
    let mut writer = file.writer(false).unwrap();
    writer.write_all(b"first version of the data").unwrap();
    writer.close().unwrap();

    // Rewriting the file forces its pages and the root onto fresh pages.
    let mut writer = file.writer(false).unwrap();
    writer.write_all(b"second").unwrap();
    writer.close().unwrap();
    drop((file, root));

    let reopened = self::registry(&device);
    let file = WireFile::new(reopened, &[ADDR], "/OTP.5").unwrap();
    let mut text = String::new();
    file.reader().unwrap().read_to_string(&mut text).unwrap();
    assert_eq!(text, "second");
    // Deleted or rewritten pages are never handed back on write-once memory.
    assert!(file.free_pages().unwrap() < free - 1);
}

#[test]
fn test_format_on_write_once_device() {
    let device = SimDevice::write_once(ADDR, 16, 32);
    let registry = registry(&device);
    let root = WireFile::new(registry, &[ADDR], "/").unwrap();
    root.format().unwrap();
    assert!(root.list().unwrap().is_empty());
    assert_eq!(device.page_write_count(0), 1);
}
