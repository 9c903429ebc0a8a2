//! Filesystems spread over a master device and its satellites

use std::io::{Read, Write};
use std::sync::Arc;
use wirefs::core::allocator::BitmapPlacement;
use wirefs::core::header::{PointerWidth, RootHeader, Topology};
use wirefs::core::page::encode_packet;
use wirefs::sim::{SimBus, SimDevice};
use wirefs::{CacheRegistry, DeviceAddress, ErrorKind, WireFile, WireFsConfig};

const MASTER: DeviceAddress = DeviceAddress(0x2D00_0000_0000_0A01);
const SAT_1: DeviceAddress = DeviceAddress(0x2D00_0000_0000_0A02);
const SAT_2: DeviceAddress = DeviceAddress(0x2D00_0000_0000_0A03);

fn group() -> (Arc<SimBus>, Vec<SimDevice>) {
    let devices = vec![
        SimDevice::rewritable(MASTER, 8, 32),
        SimDevice::rewritable(SAT_1, 8, 32),
        SimDevice::rewritable(SAT_2, 8, 32),
    ];
    (Arc::new(SimBus::new(devices.clone())), devices)
}

fn formatted_group() -> (Arc<SimBus>, Vec<SimDevice>) {
    let (bus, devices) = group();
    let registry = CacheRegistry::new(bus.clone(), WireFsConfig::default());
    let root = WireFile::new(registry, &[MASTER, SAT_1, SAT_2], "/").unwrap();
    root.format().unwrap();
    (bus, devices)
}

#[test]
fn test_format_writes_stubs_and_device_map() {
    let (bus, devices) = formatted_group();
    // Satellite roots sit on the first page of each satellite.
    assert_eq!(devices[1].page_write_count(0), 1);
    assert_eq!(devices[2].page_write_count(0), 1);

    let registry = CacheRegistry::new(bus, WireFsConfig::default());
    let root = WireFile::new(registry, &[MASTER, SAT_1, SAT_2], "/").unwrap();
    assert_eq!(root.list().unwrap(), vec!["DMAP.100".to_string()]);
    assert_eq!(root.total_pages(), 24);
    // Root, two satellite stubs and the device map.
    assert_eq!(root.free_pages().unwrap(), 20);
}

#[test]
fn test_master_alone_expands_to_full_group() {
    let (bus, _devices) = formatted_group();
    let registry = CacheRegistry::new(bus, WireFsConfig::default());
    let root = WireFile::new(registry, &[MASTER], "/").unwrap();
    assert_eq!(root.devices(), vec![MASTER]);

    assert!(root.exists().unwrap());
    assert_eq!(root.devices(), vec![MASTER, SAT_1, SAT_2]);
    assert_eq!(root.total_pages(), 24);
}

#[test]
fn test_satellite_points_to_master() {
    let (bus, _devices) = formatted_group();
    let registry = CacheRegistry::new(bus, WireFsConfig::default());
    let file = WireFile::new(registry.clone(), &[SAT_2], "/NOTE.1").unwrap();
    let mut writer = file.writer(false).unwrap();
    writer.write_all(b"written through a satellite").unwrap();
    writer.close().unwrap();
    assert!(file.is_file().unwrap());
    assert_eq!(file.devices(), vec![MASTER, SAT_1, SAT_2]);

    let from_master = WireFile::new(registry, &[MASTER], "/NOTE.1").unwrap();
    let mut text = String::new();
    from_master.reader().unwrap().read_to_string(&mut text).unwrap();
    assert_eq!(text, "written through a satellite");
}

#[test]
fn test_file_spans_every_device() {
    let (bus, devices) = formatted_group();
    let data: Vec<u8> = (0..500u32).map(|i| (i * 7 % 251) as u8).collect();
    {
        let registry = CacheRegistry::new(bus.clone(), WireFsConfig::default());
        let file = WireFile::new(registry, &[MASTER], "/BIG.2").unwrap();
        let mut writer = file.writer(false).unwrap();
        writer.write_all(&data).unwrap();
        writer.close().unwrap();
        assert_eq!(file.entry().unwrap().unwrap().pages, 18);
    }
    assert!(devices[2].page_write_count(5) > 0);

    let registry = CacheRegistry::new(bus, WireFsConfig::default());
    let file = WireFile::new(registry, &[SAT_1], "/BIG.2").unwrap();
    assert_eq!(file.length().unwrap(), 500);
    let mut back = Vec::new();
    file.reader().unwrap().read_to_end(&mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn test_missing_satellite_is_a_transport_error() {
    let (bus, _devices) = formatted_group();
    bus.remove(SAT_2);
    let registry = CacheRegistry::new(bus, WireFsConfig::default());
    let root = WireFile::new(registry, &[MASTER], "/").unwrap();
    let err = root.list().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[test]
fn test_satellite_chain_is_invalid() {
    let (bus, devices) = formatted_group();
    let stub = RootHeader::new(
        PointerWidth::One,
        Topology::Satellite { master: SAT_1 },
        BitmapPlacement::Local,
    );
    devices[2].program(0, &encode_packet(&stub.to_root_data(), 0));

    let registry = CacheRegistry::new(bus, WireFsConfig::default());
    let file = WireFile::new(registry, &[SAT_2], "/").unwrap();
    let err = file.exists().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFilesystem);
}
