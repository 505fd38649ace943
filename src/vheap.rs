//! The pseudo-page engine: size-class heaps composed from fixed-size
//! pages supplied by an external provider.
//!
//! Each size class keeps a chain of pseudo-pages, newest first. Blocks
//! pack downward from the end of the head page, `[id header][payload]`
//! with a fixed stride, and the head's `offset` field marks the start of
//! its most recent block. When the hole at the head is too short for one
//! more block, a fresh page is chained in and the new block straddles
//! from its tail into the old head's hole through the sub-slot mapping
//! (see [`page_map`](crate::page_map)). Deallocation moves the head
//! block into the freed slot, so the chain stays packed and a page empty
//! of blocks goes back to the id recycler.

use core::cmp;
use core::mem;
use core::ptr;

use log::{debug, trace};

use crate::block_info::BlockMap;
use crate::codec;
use crate::page_info::PageInfo;
use crate::page_map::AddressMap;
use crate::page_service::PageService;
use crate::size_class::SizeClasses;
use crate::{Config, FieldWidth};

/// Structural audit results for the pseudo-page engine. All-zero means
/// healthy.
#[derive(Debug, Default)]
pub struct VAudit {
    /// Slots whose id header disagrees with the descriptor pointing at
    /// them.
    pub header_mismatches: usize,
    /// Class chains whose slot capacity disagrees with the live count.
    pub chain_mismatches: usize,
    /// Broken prev links or chains longer than the page table (a cycle).
    pub broken_chains: usize,
}

impl VAudit {
    pub fn is_valid(&self) -> bool {
        self.header_mismatches == 0 && self.chain_mismatches == 0 && self.broken_chains == 0
    }
}

/// The pseudo-page allocator, generic over its page provider, which is
/// the one external dependency it has.
///
/// Same API contract as [`Multiheap`](crate::Multiheap): caller-owned id
/// space, relocatable blocks, addresses valid only until the next
/// mutating call.
pub struct VirtualMultiheap<S: PageService> {
    classes: SizeClasses,
    class_min: usize,
    class_max: usize,
    block_limit: usize,
    id_width: usize,
    null_page: u64,
    /// Head page per class, `null_page` where the class is empty.
    heads: Vec<u64>,
    map: AddressMap<S>,
    blocks: BlockMap,
    pages: PageInfo,
}

impl<S: PageService> VirtualMultiheap<S> {
    /// Build an allocator over `service` for blocks of
    /// `min_block..=max_block` bytes, at most `block_limit` live at once,
    /// `total_limit` bytes of declared total payload.
    ///
    /// Picks the physical page order (smallest power of two holding one
    /// maximum-class slot), sizes the provider's fleet, and reserves the
    /// mapping window. `total_limit` also sizes the packed page-id field;
    /// exceeding it is undefined.
    pub fn new(service: S, config: Config) -> VirtualMultiheap<S> {
        assert!(
            config.min_block > 0 && config.min_block <= config.max_block,
            "block size range {}..={} is empty",
            config.min_block,
            config.max_block,
        );
        assert!(config.block_limit > 0, "block_limit must be positive");

        let classes = SizeClasses::new(config.mode);
        let class_min = classes.size_to_class(config.min_block);
        let class_max = classes.size_to_class(config.max_block);
        let class_count = class_max - class_min + 1;

        let (id_width, page_width) = match config.widths {
            FieldWidth::Fixed => (4, 4),
            FieldWidth::Packed => {
                // One spare value above the id range keeps the all-ones
                // sentinel distinct from any real id.
                let id_width = codec::required_bytes(config.block_limit as u64);
                // Bound the page count by total payload plus header
                // overhead at the smallest possible page.
                let pages_bound =
                    (id_width * config.block_limit + config.total_limit + 4095) / 4096;
                let page_width =
                    cmp::max(codec::required_bytes(pages_bound as u64), id_width);
                (id_width, page_width)
            }
        };

        let max_slot = classes.class_to_size(class_max) + id_width;
        let map = AddressMap::new(service, max_slot, config.total_limit);
        let offset_width = match config.widths {
            FieldWidth::Fixed => 4,
            FieldWidth::Packed => codec::required_bytes(map.page_size() as u64),
        };

        debug!(
            "vheap: classes {}..={}, id/page/offset widths {}/{}/{}, page size {}",
            class_min,
            class_max,
            id_width,
            page_width,
            offset_width,
            map.page_size(),
        );

        let mut vh = VirtualMultiheap {
            classes,
            class_min,
            class_max,
            block_limit: config.block_limit,
            id_width,
            null_page: codec::ones(page_width),
            heads: vec![codec::ones(page_width); class_count],
            map,
            blocks: BlockMap::new(offset_width, page_width, config.block_limit),
            pages: PageInfo::new(page_width, offset_width, config.page_pool_cap),
        };

        // Same warmup as the multiheap engine: pre-touch the tables, map
        // the first page, and force one compacting move.
        if vh.block_limit > 1 {
            let spell = vh.classes.class_to_size(class_max);
            vh.allocate(0, spell);
            vh.allocate(1, spell);
            vh.deallocate(0);
            vh.deallocate(1);
        }

        vh
    }

    fn assert_id(&self, id: usize) {
        assert!(
            id < self.block_limit,
            "block id {} outside 0..{}",
            id,
            self.block_limit
        );
    }

    /// Chain a fresh head page into `class`, first block at `offset`.
    fn insert_page(&mut self, class: usize, old_head: u64, offset: usize) -> u64 {
        let (page, mapped) = self.pages.pop_free();
        if !mapped {
            self.map.bind(page);
        }
        self.pages
            .replace(page, self.null_page, old_head, offset, class);
        self.heads[class - self.class_min] = page;
        if old_head != self.null_page {
            // The incoming block straddles into the old head's hole;
            // linking the sub slot makes that one contiguous write.
            self.map.set_next(page, old_head);
            self.pages.set_prev(old_head, page);
        }
        trace!("insert page {} for class {} at offset {}", page, class, offset);
        page
    }

    /// Unchain the empty head `page` and recycle its id.
    fn remove_page(&mut self, page: u64, class: usize) {
        let next = self.pages.next_of(page);
        if next != self.null_page {
            self.pages.set_prev(next, self.null_page);
        }
        self.heads[class - self.class_min] = next;
        if next != self.null_page {
            self.map.reset_next(page);
        }
        if !self.pages.push_free(page) {
            self.map.unbind(page);
        }
        trace!("remove page {} from class {}", page, class);
    }

    /// Allocate `length` bytes under block id `id`.
    pub fn allocate(&mut self, id: usize, length: usize) {
        let class = self.classes.size_to_class(length);
        assert!(
            class >= self.class_min && class <= self.class_max,
            "length {} outside the configured block size range",
            length,
        );
        self.assert_id(id);
        assert!(self.blocks.is_free(id), "block id {} is already live", id);

        let real = self.classes.class_to_size(class) + self.id_width;
        let page_size = self.map.page_size();
        let head = self.heads[class - self.class_min];

        let (page, offset) = if head == self.null_page {
            let offset = page_size - real;
            (self.insert_page(class, head, offset), offset)
        } else {
            let hole = self.pages.offset_of(head);
            if hole >= real {
                let offset = hole - real;
                self.pages.set_offset(head, offset);
                (head, offset)
            } else {
                // Too short a hole: the new block starts near the end of
                // a fresh page and spills into this one.
                let offset = hole + page_size - real;
                (self.insert_page(class, head, offset), offset)
            }
        };

        self.blocks.set_site(id, offset, page);
        unsafe {
            codec::put_uint(
                self.map.address_of(page).add(offset),
                self.id_width,
                id as u64,
            );
        }
        trace!("allocate id={} len={} page={} offset={}", id, length, page, offset);
    }

    /// Free block `id`, compacting its class.
    ///
    /// The head page's first block moves into the freed slot (at most one
    /// relocation), and a head page left empty is unchained.
    pub fn deallocate(&mut self, id: usize) {
        self.assert_id(id);
        let (offset, page) = self.blocks.site_of(id);
        assert!(
            page != self.null_page,
            "deallocate of free block id {}",
            id
        );

        let class = self.pages.class_of(page);
        let real = self.classes.class_to_size(class) + self.id_width;
        let head = self.heads[class - self.class_min];
        debug_assert!(head != self.null_page);
        let head_offset = self.pages.offset_of(head);

        let dst = unsafe { self.map.address_of(page).add(offset) };
        let src = unsafe { self.map.address_of(head).add(head_offset) };
        debug_assert_eq!(
            unsafe { codec::get_uint(dst, self.id_width) },
            id as u64,
        );

        if dst != src {
            let moved = unsafe { codec::get_uint(src, self.id_width) } as usize;
            // Physically disjoint even when the pages alias through the
            // sub slots: slots of one page never overlap, and a
            // straddling tail sits below any block of the page it spills
            // into.
            unsafe { ptr::copy_nonoverlapping(src, dst, real) };
            self.blocks.copy_record(id, moved);
            trace!("deallocate id={}: moved id={} to page {} offset {}", id, moved, page, offset);
        } else {
            trace!("deallocate id={}: head block", id);
        }

        self.blocks.clear_page(id);
        if head_offset + real >= self.map.page_size() {
            self.remove_page(head, class);
        } else {
            self.pages.set_offset(head, head_offset + real);
        }
    }

    /// Move block `id` to the class fitting `new_length`, bouncing the
    /// surviving payload through a temporary buffer. Never resizes in
    /// place; a zero `new_length` frees, and a free id allocates.
    pub fn reallocate(&mut self, id: usize, new_length: usize) {
        self.assert_id(id);
        if new_length == 0 {
            self.deallocate(id);
            return;
        }
        if self.blocks.is_free(id) {
            self.allocate(id, new_length);
            return;
        }

        let new_size = self.classes.class_to_size(self.classes.size_to_class(new_length));
        let page = self.blocks.page_of(id);
        let old_size = self.classes.class_to_size(self.pages.class_of(page));
        if new_size == old_size {
            return;
        }

        let keep = cmp::min(new_size, old_size);
        let mut bounce = vec![0u8; keep];
        unsafe {
            ptr::copy_nonoverlapping(self.dereference(id), bounce.as_mut_ptr(), keep);
        }
        self.deallocate(id);
        self.allocate(id, new_length);
        unsafe {
            ptr::copy_nonoverlapping(bounce.as_ptr(), self.dereference(id), keep);
        }
        trace!("reallocate id={} -> {} bytes", id, new_size);
    }

    /// The current payload address of `id`, or null if free. Valid only
    /// until the next mutating call on this handle.
    pub fn dereference(&mut self, id: usize) -> *mut u8 {
        self.assert_id(id);
        let (offset, page) = self.blocks.site_of(id);
        if page == self.null_page {
            return ptr::null_mut();
        }
        unsafe { self.map.address_of(page).add(offset + self.id_width) }
    }

    /// Read-only flavor of [`dereference`](Self::dereference).
    pub fn dereference_const(&self, id: usize) -> *const u8 {
        self.assert_id(id);
        let (offset, page) = self.blocks.site_of(id);
        if page == self.null_page {
            return ptr::null();
        }
        unsafe { self.map.address_of(page).add(offset + self.id_width) }
    }

    /// The internal length of `id`, or 0 if free.
    pub fn length(&self, id: usize) -> usize {
        self.assert_id(id);
        let page = self.blocks.page_of(id);
        if page == self.null_page {
            0
        } else {
            self.classes.class_to_size(self.pages.class_of(page))
        }
    }

    /// [`dereference`](Self::dereference) and [`length`](Self::length)
    /// from one descriptor lookup.
    pub fn dereference_and_length(&mut self, id: usize) -> (*mut u8, usize) {
        self.assert_id(id);
        let (offset, page) = self.blocks.site_of(id);
        if page == self.null_page {
            return (ptr::null_mut(), 0);
        }
        let addr = unsafe { self.map.address_of(page).add(offset + self.id_width) };
        (addr, self.classes.class_to_size(self.pages.class_of(page)))
    }

    /// Bytes held by this handle: provider pages, the descriptor and
    /// page tables, and the head array.
    pub fn using_mem(&self) -> usize {
        mem::size_of::<Self>()
            + self.heads.len() * mem::size_of::<u64>()
            + self.blocks.using_mem()
            + self.pages.using_mem()
            + self.map.using_mem()
    }

    /// Walk every descriptor and class chain, verifying header
    /// agreement, chain integrity, and that each chain's slot capacity
    /// matches its live population. Linear in the block limit; meant for
    /// tests.
    pub fn audit(&self) -> VAudit {
        let mut report = VAudit::default();
        let page_size = self.map.page_size();
        let class_count = self.class_max - self.class_min + 1;
        let mut live = vec![0usize; class_count];

        for id in 0..self.block_limit {
            let (offset, page) = self.blocks.site_of(id);
            if page == self.null_page {
                continue;
            }
            let class = self.pages.class_of(page);
            live[class - self.class_min] += 1;
            let header =
                unsafe { codec::get_uint(self.map.address_of(page).add(offset), self.id_width) };
            if header != id as u64 {
                report.header_mismatches += 1;
            }
        }

        for (index, &head) in self.heads.iter().enumerate() {
            let class = self.class_min + index;
            let real = self.classes.class_to_size(class) + self.id_width;
            let mut capacity = 0usize;
            let mut steps = 0usize;
            let mut prev = self.null_page;
            let mut page = head;
            while page != self.null_page {
                if self.pages.prev_of(page) != prev || steps > self.block_limit {
                    report.broken_chains += 1;
                    break;
                }
                capacity += (page_size - self.pages.offset_of(page) + real - 1) / real;
                prev = page;
                page = self.pages.next_of(page);
                steps += 1;
            }
            if page == self.null_page && capacity != live[index] {
                report.chain_mismatches += 1;
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::page_service::MemfdPages;
    use test_log::test;

    fn engine(config: Config) -> VirtualMultiheap<MemfdPages> {
        VirtualMultiheap::new(MemfdPages::new().unwrap(), config)
    }

    fn small_config() -> Config {
        Config::new(1, 2048, 64, 256 * 1024)
    }

    #[test]
    fn test_round_trip() {
        let mut vh = engine(small_config());
        vh.allocate(3, 100);
        let p = vh.dereference(3);
        assert!(!p.is_null());
        unsafe {
            for i in 0..100 {
                p.add(i).write(i as u8);
            }
        }
        assert!(vh.length(3) >= 100);
        let q = vh.dereference(3);
        unsafe {
            for i in 0..100 {
                assert_eq!(q.add(i).read(), i as u8);
            }
        }
        assert!(vh.audit().is_valid());
    }

    #[test]
    fn test_free_queries_are_null() {
        let mut vh = engine(small_config());
        assert!(vh.dereference(9).is_null());
        assert!(vh.dereference_const(9).is_null());
        assert_eq!(vh.length(9), 0);
        let (p, len) = vh.dereference_and_length(9);
        assert!(p.is_null());
        assert_eq!(len, 0);

        vh.allocate(9, 50);
        assert!(!vh.dereference(9).is_null());
        vh.deallocate(9);
        assert!(vh.dereference(9).is_null());
        assert_eq!(vh.length(9), 0);
    }

    #[test]
    fn test_compaction_moves_head_block() {
        let mut vh = engine(small_config());
        vh.allocate(0, 64);
        vh.allocate(1, 64);
        vh.allocate(2, 64);
        // Block 2 is the newest, so it is the head block of the class.
        let p1 = vh.dereference(1);
        vh.deallocate(1);
        assert_eq!(vh.dereference(2), p1);
        assert!(vh.audit().is_valid());
    }

    #[test]
    fn test_page_chain_growth_and_shrink() {
        // 512-byte blocks on 4 KiB pages: a handful per page, so a few
        // dozen blocks span several chained pages.
        let mut vh = engine(Config::new(1, 512, 64, 64 * 1024));
        for id in 0..32 {
            vh.allocate(id, 512);
            unsafe { vh.dereference(id).write_bytes(id as u8, 512) };
        }
        assert!(vh.audit().is_valid());

        // Contents survive interleaved frees and the compaction they
        // cause.
        for id in (0..32).step_by(2) {
            vh.deallocate(id);
            assert!(vh.audit().is_valid());
        }
        for id in (1..32).step_by(2) {
            let p = vh.dereference(id);
            unsafe {
                for i in 0..512 {
                    assert_eq!(p.add(i).read(), id as u8);
                }
            }
        }
        for id in (1..32).step_by(2) {
            vh.deallocate(id);
        }
        assert!(vh.audit().is_valid());
    }

    #[test]
    fn test_straddling_block_round_trip() {
        // Blocks just over half a page force every second allocation to
        // straddle a page boundary through the sub slot.
        let mut vh = engine(Config::new(1, 3000, 16, 96 * 1024));
        for id in 0..8 {
            vh.allocate(id, 3000);
            let p = vh.dereference(id);
            unsafe {
                for i in 0..3000 {
                    p.add(i).write((id as u8) ^ (i as u8));
                }
            }
        }
        for id in 0..8 {
            let p = vh.dereference(id);
            unsafe {
                for i in 0..3000 {
                    assert_eq!(p.add(i).read(), (id as u8) ^ (i as u8), "id {} byte {}", id, i);
                }
            }
        }
        assert!(vh.audit().is_valid());
        for id in 0..8 {
            vh.deallocate(id);
            assert!(vh.audit().is_valid());
        }
    }

    #[test]
    fn test_reallocate_through_bounce() {
        let mut vh = engine(small_config());
        vh.allocate(4, 100);
        unsafe { vh.dereference(4).write_bytes(0xa5, 100) };
        vh.reallocate(4, 2000);
        assert!(vh.length(4) >= 2000);
        let p = vh.dereference(4);
        unsafe {
            for i in 0..100 {
                assert_eq!(p.add(i).read(), 0xa5);
            }
        }

        // Degenerate forms: zero length frees, free id allocates.
        vh.reallocate(4, 0);
        assert_eq!(vh.length(4), 0);
        vh.reallocate(4, 32);
        assert!(vh.length(4) >= 32);
        assert!(vh.audit().is_valid());
    }

    #[test]
    fn test_using_mem_settles_after_churn() {
        let mut vh = engine(Config::new(16, 1024, 128, 256 * 1024));
        for id in 0..128 {
            vh.allocate(id, 1024);
        }
        let peak = vh.using_mem();
        for id in 0..128 {
            vh.deallocate(id);
        }
        let settled = vh.using_mem();
        assert!(settled < peak);
        assert!(vh.audit().is_valid());
    }

    #[test]
    #[should_panic(expected = "already live")]
    fn test_double_allocate_panics() {
        let mut vh = engine(small_config());
        vh.allocate(0, 16);
        vh.allocate(0, 16);
    }
}
