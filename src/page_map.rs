//! The virtual-address scheme over a page provider.
//!
//! Every pseudo-page `pid` owns two adjacent virtual slots in one big
//! reservation: the *main* slot at index `2·pid`, where the physical page
//! is mapped, and the *sub* slot at `2·pid + 1` immediately after it.
//! Linking a successor page into the sub slot makes writes that run off
//! the end of the main slot land on the successor's physical page. That
//! is how a block can straddle two non-adjacent physical pages behind one
//! contiguous pointer.

use core::mem;
use core::ptr::NonNull;

use log::debug;

use crate::page_service::PageService;
use crate::sys;

/// The reservation window, slot arithmetic, and provider handle.
pub struct AddressMap<S: PageService> {
    service: S,
    base: NonNull<u8>,
    reserved_len: usize,
    page_size: usize,
    /// Page ids the fleet was sized for; binding past this would escape
    /// the reservation.
    page_limit: u64,
}

impl<S: PageService> AddressMap<S> {
    /// Pick the page order, reserve the window, and size the provider's
    /// fleet.
    ///
    /// The page size is the smallest `2^(order+12)` that holds one
    /// `max_slot` (a maximum-class block plus its id header), so a block
    /// never spans more than two pages. The window covers four times the
    /// declared total bytes, doubled for the sub slots.
    pub fn new(mut service: S, max_slot: usize, total_limit: usize) -> AddressMap<S> {
        let mut order = 0u32;
        let mut page_size = 4096usize;
        while page_size < max_slot {
            order += 1;
            page_size <<= 1;
        }
        service
            .set_page_order(order)
            .unwrap_or_else(|e| panic!("setting page order: {}", e));

        let window = (total_limit * 4 + page_size - 1) & !(page_size - 1);
        let base = sys::reserve(2 * window)
            .unwrap_or_else(|e| panic!("reserving page window: {}", e));
        let page_limit = (window / page_size) as u64;
        service
            .resize_fleet(page_limit)
            .unwrap_or_else(|e| panic!("sizing page fleet: {}", e));

        debug!(
            "page map: order {} ({} byte pages), {} ids, window {} bytes at {:p}",
            order,
            page_size,
            page_limit,
            2 * window,
            base.as_ptr()
        );

        AddressMap {
            service,
            base,
            reserved_len: 2 * window,
            page_size,
            page_limit,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_limit(&self) -> u64 {
        self.page_limit
    }

    fn slot_addr(&self, slot: u64) -> *mut u8 {
        unsafe { self.base.as_ptr().add(slot as usize * self.page_size) }
    }

    /// The address of pseudo-page `pid` (its main slot).
    pub fn address_of(&self, pid: u64) -> *mut u8 {
        debug_assert!(pid < self.page_limit);
        self.slot_addr(2 * pid)
    }

    /// Bind a physical page to `pid` and map it into the main slot.
    pub fn bind(&mut self, pid: u64) {
        assert!(
            pid < self.page_limit,
            "page id {} outside the fleet of {}; total_limit exceeded?",
            pid,
            self.page_limit
        );
        self.service
            .bind(pid)
            .unwrap_or_else(|e| panic!("binding page {}: {}", pid, e));
        sys::map_shared_fixed(
            self.slot_addr(2 * pid),
            self.page_size,
            self.service.fd(),
            (pid * self.page_size as u64) as i64,
        )
        .unwrap_or_else(|e| panic!("mapping page {}: {}", pid, e));
    }

    /// Unmap `pid`'s main slot and release the physical page.
    ///
    /// Not called for pool-retained ids; those keep both the mapping
    /// and the binding.
    pub fn unbind(&mut self, pid: u64) {
        sys::decommit(self.slot_addr(2 * pid), self.page_size)
            .unwrap_or_else(|e| panic!("unmapping page {}: {}", pid, e));
        self.service
            .release(pid)
            .unwrap_or_else(|e| panic!("releasing page {}: {}", pid, e));
    }

    /// Map page `next` into `pid`'s sub slot, so writes overflowing
    /// `pid`'s main slot continue on `next`.
    pub fn set_next(&mut self, pid: u64, next: u64) {
        debug_assert!(pid < self.page_limit && next < self.page_limit);
        sys::map_shared_fixed(
            self.slot_addr(2 * pid + 1),
            self.page_size,
            self.service.fd(),
            (next * self.page_size as u64) as i64,
        )
        .unwrap_or_else(|e| panic!("linking page {} after {}: {}", next, pid, e));
    }

    /// Replace `pid`'s sub slot with an inaccessible reservation again.
    pub fn reset_next(&mut self, pid: u64) {
        sys::decommit(self.slot_addr(2 * pid + 1), self.page_size)
            .unwrap_or_else(|e| panic!("unlinking successor of page {}: {}", pid, e));
    }

    /// Bytes held on the provider side, plus this struct.
    pub fn using_mem(&self) -> usize {
        let service_bytes = self.service.used_bytes().unwrap_or(0) as usize;
        mem::size_of::<Self>() + service_bytes
    }
}

impl<S: PageService> Drop for AddressMap<S> {
    fn drop(&mut self) {
        // Dropping the provider closes its fd; the one munmap takes every
        // slot mapping down with the reservation.
        let _ = sys::unmap(self.base.as_ptr(), self.reserved_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::page_service::MemfdPages;
    use test_log::test;

    fn map_with(total: usize, max_slot: usize) -> AddressMap<MemfdPages> {
        AddressMap::new(MemfdPages::new().unwrap(), max_slot, total)
    }

    #[test]
    fn test_page_order_fits_max_slot() {
        let map = map_with(1 << 20, 4096);
        assert_eq!(map.page_size(), 4096);
        let map = map_with(1 << 20, 4097);
        assert_eq!(map.page_size(), 8192);
    }

    #[test]
    fn test_bind_write_unbind() {
        let mut map = map_with(1 << 18, 4096);
        map.bind(3);
        let p = map.address_of(3);
        unsafe {
            p.write(0x11);
            p.add(map.page_size() - 1).write(0x22);
            assert_eq!(p.read(), 0x11);
        }
        map.unbind(3);
    }

    #[test]
    fn test_sub_slot_crosses_into_next_page() {
        let mut map = map_with(1 << 18, 4096);
        let ps = map.page_size();
        map.bind(0);
        map.bind(1);
        map.set_next(0, 1);

        // A write running off page 0's main slot lands at the start of
        // page 1.
        let p0 = map.address_of(0);
        unsafe {
            for i in 0..8 {
                p0.add(ps - 4 + i).write(i as u8);
            }
            let p1 = map.address_of(1);
            assert_eq!(p1.read(), 4);
            assert_eq!(p1.add(3).read(), 7);
        }

        map.reset_next(0);
        map.unbind(1);
        map.unbind(0);
    }
}
