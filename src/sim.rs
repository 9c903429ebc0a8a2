//! In-memory devices for tests and benchmarks
//!
//! [`SimDevice`] behaves like one bus device with a single general-purpose
//! memory bank, either rewritable (EEPROM-like) or write-once (EPROM-like:
//! programming can only clear bits, pages carry an inverted redirect byte and
//! the device keeps its own page usage bitmap). Clones share their memory, so
//! a test can keep a clone to inspect or damage what the filesystem wrote.

use crate::core::allocator::PageBitmap;
use crate::core::error::{TransportError, TransportResult};
use crate::core::provider::{Adapter, Device, DeviceAddress, MemoryBank};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Largest page count whose redirect fits the one-byte extra info
const EXTRA_INFO_PAGES: usize = 256;

#[derive(Debug)]
struct BankState {
    pages: Vec<Vec<u8>>,
    writes: Vec<usize>,
    /// Redirect of each page, 0 when none
    redirects: Vec<usize>,
    /// Device usage bitmap, bit set = free
    usage: Vec<u8>,
    corrupt_reads: usize,
    corruptions: usize,
    fail_writes: usize,
    fail_redirects: usize,
    reads: u64,
}

impl BankState {
    fn new(pages: usize, page_len: usize, fill: u8) -> Self {
        BankState {
            pages: vec![vec![fill; page_len]; pages],
            writes: vec![0; pages],
            redirects: vec![0; pages],
            usage: vec![0xFF; PageBitmap::byte_len(pages)],
            corrupt_reads: 0,
            corruptions: 0,
            fail_writes: 0,
            fail_redirects: 0,
            reads: 0,
        }
    }

    fn check(&self, page: usize) -> TransportResult<()> {
        if page >= self.pages.len() {
            return Err(TransportError::Bus(format!(
                "page {} out of range ({} pages)",
                page,
                self.pages.len()
            )));
        }
        Ok(())
    }

    /// Flip one byte inside the packet, a different one on every call
    fn corrupt(&mut self, buf: &mut [u8]) {
        let n = self.corruptions;
        self.corruptions += 1;
        let len = usize::from(buf[0]).min(buf.len().saturating_sub(3)).max(1);
        let at = 1 + n % len;
        buf[at] ^= ((n % 255) + 1) as u8;
    }
}

#[derive(Debug, Clone)]
struct SimBank {
    page_len: usize,
    write_once: bool,
    general_purpose: bool,
    state: Arc<Mutex<BankState>>,
}

impl SimBank {
    fn new(pages: usize, page_len: usize, write_once: bool, general_purpose: bool) -> Self {
        let fill = if write_once { 0xFF } else { 0x00 };
        SimBank {
            page_len,
            write_once,
            general_purpose,
            state: Arc::new(Mutex::new(BankState::new(pages, page_len, fill))),
        }
    }

    fn page_count_inner(&self) -> usize {
        self.state.lock().pages.len()
    }
}

impl MemoryBank for SimBank {
    fn page_length(&self) -> usize {
        self.page_len
    }

    fn page_count(&self) -> usize {
        self.page_count_inner()
    }

    fn is_write_once(&self) -> bool {
        self.write_once
    }

    fn is_general_purpose(&self) -> bool {
        self.general_purpose
    }

    fn is_non_volatile(&self) -> bool {
        self.general_purpose
    }

    fn has_extra_info(&self) -> bool {
        self.write_once && self.page_count_inner() <= EXTRA_INFO_PAGES
    }

    fn extra_info_length(&self) -> usize {
        usize::from(self.has_extra_info())
    }

    fn extra_info_description(&self) -> &str {
        if self.has_extra_info() {
            "inverted redirection page"
        } else {
            ""
        }
    }

    fn has_page_bitmap(&self) -> bool {
        self.write_once
    }

    fn read_page(&mut self, page: usize, _continuing: bool, buf: &mut [u8]) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.check(page)?;
        state.reads += 1;
        buf.copy_from_slice(&state.pages[page][..buf.len()]);
        if state.corrupt_reads > 0 {
            state.corrupt_reads -= 1;
            state.corrupt(buf);
        }
        Ok(())
    }

    fn read_page_crc(
        &mut self,
        page: usize,
        _continuing: bool,
        buf: &mut [u8],
        extra: &mut [u8],
    ) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.check(page)?;
        state.reads += 1;
        buf.copy_from_slice(&state.pages[page][..buf.len()]);
        if let Some(first) = extra.first_mut() {
            *first = !(state.redirects[page] as u8);
        }
        Ok(())
    }

    fn write_page_packet(&mut self, page: usize, buf: &[u8]) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.check(page)?;
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(TransportError::Bus("injected write failure".to_string()));
        }
        if buf.len() > self.page_len {
            return Err(TransportError::Bus(format!(
                "{} bytes do not fit a {}-byte page",
                buf.len(),
                self.page_len
            )));
        }
        let write_once = self.write_once;
        for (cell, &byte) in state.pages[page].iter_mut().zip(buf) {
            *cell = if write_once { *cell & byte } else { byte };
        }
        state.writes[page] += 1;
        Ok(())
    }

    fn redirected_page(&mut self, page: usize) -> TransportResult<usize> {
        if !self.write_once {
            return Err(TransportError::Unsupported("redirected_page"));
        }
        let state = self.state.lock();
        state.check(page)?;
        Ok(state.redirects[page])
    }

    fn redirect_page(&mut self, page: usize, target: usize) -> TransportResult<()> {
        if !self.write_once {
            return Err(TransportError::Unsupported("redirect_page"));
        }
        let mut state = self.state.lock();
        state.check(page)?;
        state.check(target)?;
        if state.fail_redirects > 0 {
            state.fail_redirects -= 1;
            return Err(TransportError::Bus("injected redirect failure".to_string()));
        }
        // The stored byte is inverted, so programming can only add bits.
        state.redirects[page] |= target;
        Ok(())
    }

    fn read_page_bitmap(&mut self, buf: &mut [u8]) -> TransportResult<()> {
        if !self.write_once {
            return Err(TransportError::Unsupported("read_page_bitmap"));
        }
        let state = self.state.lock();
        let n = buf.len().min(state.usage.len());
        buf[..n].copy_from_slice(&state.usage[..n]);
        Ok(())
    }

    fn write_page_bitmap(&mut self, buf: &[u8]) -> TransportResult<()> {
        if !self.write_once {
            return Err(TransportError::Unsupported("write_page_bitmap"));
        }
        let mut state = self.state.lock();
        for (cell, &byte) in state.usage.iter_mut().zip(buf) {
            *cell &= byte;
        }
        Ok(())
    }
}

/// Simulated bus device
#[derive(Debug, Clone)]
pub struct SimDevice {
    address: DeviceAddress,
    banks: Vec<SimBank>,
    /// Index of the general-purpose bank in `banks`
    memory: usize,
    speed_negotiations: Arc<Mutex<u64>>,
}

impl SimDevice {
    fn with_memory(address: DeviceAddress, pages: usize, page_len: usize, write_once: bool) -> Self {
        SimDevice {
            address,
            banks: vec![SimBank::new(pages, page_len, write_once, true)],
            memory: 0,
            speed_negotiations: Arc::new(Mutex::new(0)),
        }
    }

    /// EEPROM-like device
    pub fn rewritable(address: DeviceAddress, pages: usize, page_len: usize) -> Self {
        Self::with_memory(address, pages, page_len, false)
    }

    /// EPROM-like device
    pub fn write_once(address: DeviceAddress, pages: usize, page_len: usize) -> Self {
        Self::with_memory(address, pages, page_len, true)
    }

    /// Put a volatile scratchpad bank in front of the memory bank
    pub fn with_scratchpad(mut self, page_len: usize) -> Self {
        self.banks.insert(0, SimBank::new(1, page_len, false, false));
        self.memory += 1;
        self
    }

    fn state(&self) -> parking_lot::MutexGuard<'_, BankState> {
        self.banks[self.memory].state.lock()
    }

    /// Raw content of `page`
    pub fn page(&self, page: usize) -> Vec<u8> {
        self.state().pages[page].clone()
    }

    /// Overwrite one byte, ignoring write-once rules
    pub fn poke(&self, page: usize, offset: usize, value: u8) {
        self.state().pages[page][offset] = value;
    }

    /// Program raw bytes at the start of `page` with the device's write rules
    pub fn program(&self, page: usize, bytes: &[u8]) {
        let write_once = self.banks[self.memory].write_once;
        let mut state = self.state();
        for (cell, &byte) in state.pages[page].iter_mut().zip(bytes) {
            *cell = if write_once { *cell & byte } else { byte };
        }
    }

    pub fn page_write_count(&self, page: usize) -> usize {
        self.state().writes[page]
    }

    pub fn redirect(&self, page: usize) -> usize {
        self.state().redirects[page]
    }

    /// Set the redirect of `page`, ignoring write-once rules
    pub fn set_redirect(&self, page: usize, target: usize) {
        self.state().redirects[page] = target;
    }

    /// Corrupt the next `count` raw reads, each one differently
    pub fn corrupt_next_reads(&self, count: usize) {
        self.state().corrupt_reads = count;
    }

    /// Fail the next `count` page writes
    pub fn fail_next_writes(&self, count: usize) {
        self.state().fail_writes = count;
    }

    /// Fail the next `count` redirect commits
    pub fn fail_next_redirects(&self, count: usize) {
        self.state().fail_redirects = count;
    }

    /// Page reads served so far
    pub fn read_count(&self) -> u64 {
        self.state().reads
    }

    pub fn speed_negotiations(&self) -> u64 {
        *self.speed_negotiations.lock()
    }
}

impl Device for SimDevice {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    fn bank_count(&self) -> usize {
        self.banks.len()
    }

    fn bank(&mut self, index: usize) -> &mut dyn MemoryBank {
        &mut self.banks[index]
    }

    fn do_speed(&mut self) -> TransportResult<()> {
        *self.speed_negotiations.lock() += 1;
        Ok(())
    }
}

/// Simulated bus holding a set of devices
#[derive(Debug, Default)]
pub struct SimBus {
    devices: Mutex<AHashMap<DeviceAddress, SimDevice>>,
}

impl SimBus {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        SimBus {
            devices: Mutex::new(devices.into_iter().map(|d| (d.address, d)).collect()),
        }
    }

    pub fn insert(&self, device: SimDevice) {
        self.devices.lock().insert(device.address, device);
    }

    /// Take a device off the bus
    pub fn remove(&self, address: DeviceAddress) -> Option<SimDevice> {
        self.devices.lock().remove(&address)
    }
}

impl Adapter for SimBus {
    fn device(&self, address: DeviceAddress) -> TransportResult<Box<dyn Device>> {
        self.devices
            .lock()
            .get(&address)
            .cloned()
            .map(|d| Box::new(d) as Box<dyn Device>)
            .ok_or(TransportError::NoDevice(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_once_only_clears_bits() {
        let mut device = SimDevice::write_once(DeviceAddress(1), 4, 8);
        device.bank(0).write_page_packet(1, &[0xF0, 0x0F]).unwrap();
        device.bank(0).write_page_packet(1, &[0x3C, 0xFF]).unwrap();
        assert_eq!(&device.page(1)[..3], &[0x30, 0x0F, 0xFF]);
        assert_eq!(device.page_write_count(1), 2);
    }

    #[test]
    fn test_redirect_in_extra_info() {
        let mut device = SimDevice::write_once(DeviceAddress(1), 4, 8);
        device.bank(0).redirect_page(1, 3).unwrap();
        let mut buf = [0u8; 8];
        let mut extra = [0u8; 1];
        device
            .bank(0)
            .read_page_crc(1, false, &mut buf, &mut extra)
            .unwrap();
        assert_eq!(extra[0], !3u8);
        assert_eq!(device.bank(0).redirected_page(1).unwrap(), 3);
    }

    #[test]
    fn test_scratchpad_is_not_general_purpose() {
        let mut device = SimDevice::rewritable(DeviceAddress(1), 4, 32).with_scratchpad(32);
        assert_eq!(device.bank_count(), 2);
        assert!(!device.bank(0).is_general_purpose());
        assert_eq!(device.bank(1).page_count(), 4);
    }

    #[test]
    fn test_bus_reports_missing_device() {
        let bus = SimBus::new(vec![SimDevice::rewritable(DeviceAddress(1), 4, 32)]);
        assert!(bus.device(DeviceAddress(1)).is_ok());
        assert!(bus.remove(DeviceAddress(1)).is_some());
        assert!(matches!(
            bus.device(DeviceAddress(1)),
            Err(TransportError::NoDevice(DeviceAddress(1)))
        ));
    }
}
