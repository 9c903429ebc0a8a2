//! Flush of the write log and the page bitmap
//!
//! Each round runs three passes over the log, tail to head:
//! 1. `Verify` pages are checked against the device. A page that cannot be
//!    programmed in place gets a fresh page in the same bank and turns into
//!    `Redirect`.
//! 2. `Write` pages are physically written.
//! 3. `Redirect` pointers are committed once their target has been written.
//!
//! Every step leaves the slot in a state that a later `sync` resumes from.

use super::{BankRef, MemoryCache};
use crate::core::allocator::{BitmapPlacement, PageAllocator, PageBitmap, LOCAL_BITMAP_BYTES};
use crate::core::error::{Result, WireFsError};
use crate::core::header::local_bitmap_range;
use crate::core::page::{encode_packet, PageId, PageState};
use tracing::{debug, info, warn};

impl MemoryCache {
    /// Make every staged write and bitmap change durable.
    ///
    /// Failures come back wrapped in [`WireFsError::Sync`]; the staged state
    /// is kept so the call can simply be repeated.
    pub fn sync(&mut self) -> Result<()> {
        self.flush().map_err(|e| {
            warn!("Flush failed, {} pages still pending: {}", self.write_log.len(), e);
            WireFsError::Sync(Box::new(e))
        })
    }

    fn bitmap_dirty(&self) -> bool {
        self.bitmap.as_ref().map(|b| b.is_dirty()).unwrap_or(false)
    }

    fn flush(&mut self) -> Result<()> {
        if self.write_log.is_empty() && !self.bitmap_dirty() {
            return Ok(());
        }
        let pending = self.write_log.len();
        self.stage_bitmap()?;

        while !self.write_log.is_empty() {
            let mut progressed = false;

            for page in self.write_log.oldest_first() {
                if self.slots[page.index()].state == PageState::Verify {
                    self.verify_page(page)?;
                    progressed = true;
                }
            }

            for page in self.write_log.oldest_first() {
                if self.slots[page.index()].state == PageState::Write {
                    self.commit_write(page)?;
                    progressed = true;
                }
            }

            for page in self.write_log.oldest_first() {
                if self.slots[page.index()].state == PageState::Redirect
                    && self.commit_redirect(page)?
                {
                    progressed = true;
                }
            }

            if !progressed {
                let stuck = self.write_log.oldest_first();
                return Err(WireFsError::RedirectFailed {
                    page: stuck.first().map(|p| p.index()).unwrap_or(0),
                });
            }
        }

        self.commit_bitmap()?;
        info!("Flushed {} pages", pending);
        Ok(())
    }

    /// Decide whether a staged write-once page can be programmed in place
    fn verify_page(&mut self, page: PageId) -> Result<()> {
        let bank = self.bank_of(page)?.clone();
        let physical = self.read_physical(&bank, page)?;
        let slot = &self.slots[page.index()];

        // Programming can only clear bits: every 1 we want must still be 1.
        let programmable = slot
            .packet()
            .iter()
            .zip(&physical)
            .all(|(&want, &have)| want & !have == 0);
        let data = slot.data().to_vec();
        if programmable {
            self.slots[page.index()].state = PageState::Write;
            return Ok(());
        }

        let target = self.allocate_redirect_target(&bank, page)?;
        let packet = encode_packet(&data, bank.local(target));
        let moved = &mut self.slots[target.index()];
        moved.stage(&packet, 0xFF);
        moved.redirect = 0;
        moved.state = PageState::Verify;
        self.write_log.push(target);

        let slot = &mut self.slots[page.index()];
        slot.state = PageState::Redirect;
        slot.redirect = target.0;
        self.stats.redirects += 1;
        debug!("Page {} cannot be programmed in place, redirecting to {}", page, target);
        Ok(())
    }

    /// Free page in the same bank as `page`, never the bank's first page
    fn allocate_redirect_target(&mut self, bank: &BankRef, page: PageId) -> Result<PageId> {
        let range = bank.first_page + 1..bank.first_page + bank.page_count;
        let bitmap = self.bitmap.as_mut().ok_or_else(|| {
            WireFsError::InvalidFilesystem("page bitmap not loaded".to_string())
        })?;
        let target = bitmap
            .free_page_in(range)
            .filter(|&t| t != page)
            .ok_or(WireFsError::OutOfSpace)?;
        bitmap.mark_used(target)?;
        Ok(target)
    }

    fn commit_write(&mut self, page: PageId) -> Result<()> {
        let bank = self.bank_of(page)?.clone();
        if self.config.renegotiate_speed && self.last_written_device != Some(bank.device) {
            self.devices[bank.device].do_speed()?;
        }
        self.last_written_device = Some(bank.device);

        let packet = self.slots[page.index()].packet().to_vec();
        self.bank_mut(&bank)
            .write_page_packet(bank.local(page), &packet)?;
        self.stats.page_writes += 1;

        self.slots[page.index()].state = PageState::ReadWithCrc;
        self.write_log.remove(page);
        Ok(())
    }

    /// Commit one redirect pointer; false while its target is still staged
    fn commit_redirect(&mut self, page: PageId) -> Result<bool> {
        let target = PageId(self.slots[page.index()].redirect);
        if self.slots[target.index()].state.is_dirty() {
            return Ok(false);
        }
        let bank = self.bank_of(page)?.clone();
        let local_target = bank.local(target);

        let live = self.lookup_redirect(&bank, page)?;
        if live == 0 {
            self.bank_mut(&bank)
                .redirect_page(bank.local(page), local_target)?;
        } else if live != local_target {
            warn!(
                "Page {} already redirected to local page {}, wanted {}",
                page, live, local_target
            );
            return Err(WireFsError::RedirectFailed { page: page.index() });
        }

        self.slots[page.index()].state = PageState::NotRead;
        self.write_log.remove(page);
        Ok(true)
    }

    /// Write a dirty local or file bitmap into its packets before the drain
    fn stage_bitmap(&mut self) -> Result<()> {
        if !self.bitmap_dirty() {
            return Ok(());
        }
        let Some(layout) = self.layout else {
            return Ok(());
        };
        let image = match self.bitmap.as_ref() {
            Some(bitmap) => bitmap.program_image(),
            None => return Ok(()),
        };

        match layout.bitmap {
            BitmapPlacement::Engine => {}
            BitmapPlacement::Local => {
                let mut root = self.read_page_packet(PageId::ROOT)?;
                let range = local_bitmap_range();
                if root.len() < range.end {
                    return Err(WireFsError::InvalidFilesystem(
                        "root directory too short for its bitmap".to_string(),
                    ));
                }
                let mut bytes = [0u8; LOCAL_BITMAP_BYTES];
                let used = image.len().min(LOCAL_BITMAP_BYTES);
                bytes[..used].copy_from_slice(&image[..used]);
                root[range].copy_from_slice(&bytes);
                self.write_page_packet(PageId::ROOT, &root)?;
            }
            BitmapPlacement::File { .. } => {
                let n = layout.pointer_len();
                let chain = self.bitmap_file.clone();
                let mut rest = image.as_slice();
                for (index, &page) in chain.iter().enumerate() {
                    let room = self.max_data_length(page)?.saturating_sub(n);
                    let (chunk, tail) = rest.split_at(room.min(rest.len()));
                    rest = tail;
                    let next = chain.get(index + 1).map(|p| p.0).unwrap_or(0);
                    let mut data = chunk.to_vec();
                    data.extend(layout.width.encode(next));
                    self.write_page_packet(page, &data)?;
                }
                if !rest.is_empty() {
                    return Err(WireFsError::Capacity(
                        "bitmap file too small for the page bitmap".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Record the bitmap as committed once the log has drained. A device
    /// kept bitmap is programmed here and read back.
    fn commit_bitmap(&mut self) -> Result<()> {
        if !self.bitmap_dirty() {
            return Ok(());
        }
        let Some(layout) = self.layout else {
            return Ok(());
        };
        let image = match self.bitmap.as_ref() {
            Some(bitmap) => bitmap.program_image(),
            None => return Ok(()),
        };

        if layout.bitmap == BitmapPlacement::Engine {
            let banks = self.banks.clone();
            for bank in &banks {
                let local = bank_image(&image, bank);
                self.bank_mut(bank).write_page_bitmap(&local)?;
            }
            self.stats.bitmap_commits += 1;
            if self.config.verify_bitmap {
                let stored = self.read_engine_bitmap()?;
                if stored != image {
                    return Err(WireFsError::BitmapVerify);
                }
            }
            debug!("Committed device page bitmap");
        }

        if let Some(bitmap) = self.bitmap.as_mut() {
            bitmap.commit(image);
            debug!("{} pages free after flush", bitmap.number_free_pages());
        }
        Ok(())
    }
}

/// Slice of a global write-once image covering the pages of `bank`
fn bank_image(image: &[u8], bank: &BankRef) -> Vec<u8> {
    let mut local = vec![0xFFu8; PageBitmap::byte_len(bank.page_count)];
    for page in 0..bank.page_count {
        let global = bank.first_page + page;
        if image[global / 8] & (1 << (global % 8)) == 0 {
            local[page / 8] &= !(1 << (page % 8));
        }
    }
    local
}
