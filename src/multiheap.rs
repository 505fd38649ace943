//! The multiheap engine: one compacting pseudo-heap per size class in the
//! process's own virtual memory.
//!
//! Every size class in the configured range owns a [`ClassHeap`]: a dense
//! array of equal-sized slots, each `[id header][payload]`, in which the
//! first `count` slots are exactly the live blocks of that class.
//! Allocation appends a slot; deallocation moves the last slot into the
//! hole and shrinks, so a heap of `k` live blocks always occupies `k`
//! slots, and a block's address is only as durable as the time to the
//! next mutating call.

use core::cmp;
use core::mem;
use core::ptr;

use log::{debug, trace};

use crate::arena::Arena;
use crate::block_info::BlockIndex;
use crate::codec;
use crate::pheap::ArenaHeap;
use crate::size_class::SizeClasses;
use crate::{Config, FieldWidth};

/// One size class's storage: `count` packed slots of `slot_size` bytes.
struct ClassHeap {
    count: usize,
    slot_size: usize,
    heap: ArenaHeap,
}

impl ClassHeap {
    fn slot_addr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.count, "slot {} of {} in use", slot, self.count);
        unsafe { self.heap.address().add(slot * self.slot_size) }
    }

    fn last_addr(&self) -> *mut u8 {
        debug_assert!(self.count > 0);
        self.slot_addr(self.count - 1)
    }

    /// Open a fresh slot at the tail, growing the heap if the slot does
    /// not fit in the committed pages. Returns its index.
    fn append(&mut self, arena: &mut Arena) -> usize {
        let slot = self.count;
        self.count += 1;
        self.heap.grow(arena, self.count * self.slot_size);
        slot
    }

    /// Drop the tail slot, trimming committed pages past the slack.
    fn remove_last(&mut self, arena: &mut Arena) {
        debug_assert!(self.count > 0);
        self.count -= 1;
        self.heap.shrink(arena, self.count * self.slot_size);
    }
}

/// What a structural audit of the engine found. All-zero means every
/// invariant holds; anything else is corruption.
#[derive(Debug, Default)]
pub struct Audit {
    /// Live descriptor counts that disagree with a heap's slot count.
    pub count_mismatches: usize,
    /// Slots whose id header disagrees with the descriptor pointing at
    /// them.
    pub header_mismatches: usize,
    /// Descriptors pointing past their heap's live prefix.
    pub stray_slots: usize,
}

impl Audit {
    pub fn is_valid(&self) -> bool {
        self.count_mismatches == 0 && self.header_mismatches == 0 && self.stray_slots == 0
    }
}

/// The multiheap allocator. See the crate docs for the API contract; in
/// short: the caller owns the id space, and any address obtained from
/// [`dereference`](Multiheap::dereference) dies at the next mutating
/// call.
///
/// Constructing a handle reserves a large span of address space for the
/// lifetime of the handle. Handles are independent, but each one's
/// reservation probe sees whatever address space earlier handles took.
pub struct Multiheap {
    classes: SizeClasses,
    class_min: usize,
    class_max: usize,
    block_limit: usize,
    id_width: usize,
    index: BlockIndex,
    heaps: Vec<ClassHeap>,
    arena: Arena,
}

impl Multiheap {
    /// Build an allocator for blocks of `min_block..=max_block` bytes,
    /// at most `block_limit` of them live at once, with `total_limit`
    /// bytes of declared total payload.
    ///
    /// `total_limit` sizes the packed offset field and is otherwise
    /// unenforced; exceeding it is undefined. Panics on a nonsensical
    /// configuration.
    pub fn new(config: Config) -> Multiheap {
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
        let heap_count = class_max - class_min + 1;

        let (id_width, class_width, slot_width) = match config.widths {
            FieldWidth::Fixed => (4, 4, 4),
            FieldWidth::Packed => {
                let id_width = codec::required_bytes(config.block_limit as u64 - 1);
                // The slot field is sized from the declared total bytes
                // plus header overhead, as an upper bound on any slot
                // index.
                let slot_width = codec::required_bytes(
                    (config.total_limit + id_width * config.block_limit) as u64,
                );
                let class_width = codec::required_bytes(heap_count as u64);
                (id_width, class_width, slot_width)
            }
        };

        let arena = Arena::new(heap_count, config.recycle);
        let heaps = (0..heap_count)
            .map(|i| ClassHeap {
                count: 0,
                slot_size: classes.class_to_size(class_min + i) + id_width,
                heap: ArenaHeap::new(i),
            })
            .collect();

        debug!(
            "multiheap: classes {}..={} ({} heaps), id/class/slot widths {}/{}/{}",
            class_min, class_max, heap_count, id_width, class_width, slot_width,
        );

        let mut mh = Multiheap {
            classes,
            class_min,
            class_max,
            block_limit: config.block_limit,
            id_width,
            index: BlockIndex::new(class_width, slot_width, config.block_limit),
            heaps,
            arena,
        };

        // Warm up: one allocate/free pair at the top class touches the
        // tables and the first pages, and exercises one compacting move,
        // so the first real operation does not pay the first-touch cost.
        if mh.block_limit > 1 {
            let spell = mh.classes.class_to_size(class_max);
            mh.allocate(0, spell);
            mh.allocate(1, spell);
            mh.deallocate(0);
            mh.deallocate(1);
        }

        mh
    }

    /// The stored size-class tag of a live block (1-based within the
    /// configured range), or 0 when free.
    fn stored_class(&self, id: usize) -> usize {
        assert!(
            id < self.block_limit,
            "block id {} outside 0..{}",
            id,
            self.block_limit
        );
        self.index.class_of(id)
    }

    /// Allocate `length` bytes under block id `id`.
    ///
    /// `id` must be free and `length` within the configured size range.
    pub fn allocate(&mut self, id: usize, length: usize) {
        let class = self.classes.size_to_class(length);
        assert!(
            class >= self.class_min && class <= self.class_max,
            "length {} outside the configured block size range",
            length,
        );
        assert!(
            self.stored_class(id) == 0,
            "block id {} is already live",
            id
        );

        let heap_index = class - self.class_min;
        let slot = self.heaps[heap_index].append(&mut self.arena);
        unsafe {
            codec::put_uint(self.heaps[heap_index].last_addr(), self.id_width, id as u64);
        }
        self.index.set(id, heap_index + 1, slot);
        trace!("allocate id={} len={} class={} slot={}", id, length, class, slot);
    }

    /// Free block `id`, compacting its class heap.
    ///
    /// At most one other block moves: the one living in the class's last
    /// slot, which takes over the freed slot.
    pub fn deallocate(&mut self, id: usize) {
        let stored = self.stored_class(id);
        assert!(stored != 0, "deallocate of free block id {}", id);
        let heap_index = stored - 1;
        let slot = self.index.slot_of(id);

        // The slot header and the descriptor must agree; full scans live
        // in audit(), this is the cheap spot check.
        debug_assert_eq!(
            unsafe { codec::get_uint(self.heaps[heap_index].slot_addr(slot), self.id_width) },
            id as u64,
        );

        self.index.set_class(id, 0);

        let last = self.heaps[heap_index].count - 1;
        if slot != last {
            let moved: usize;
            {
                let heap = &self.heaps[heap_index];
                let src = heap.last_addr();
                let dst = heap.slot_addr(slot);
                moved = unsafe { codec::get_uint(src, self.id_width) } as usize;
                // Distinct slots of one heap never overlap.
                unsafe { ptr::copy_nonoverlapping(src, dst, heap.slot_size) };
            }
            self.index.set_slot(moved, slot);
            trace!("deallocate id={}: moved id={} into slot {}", id, moved, slot);
        } else {
            trace!("deallocate id={}: tail slot", id);
        }

        self.heaps[heap_index].remove_last(&mut self.arena);
    }

    /// Move block `id` to the class fitting `new_length`, preserving the
    /// common prefix of its payload. No-op when the class does not
    /// change.
    ///
    /// Experimental, as in the original design: always allocate-copy-free,
    /// never in place.
    pub fn reallocate(&mut self, id: usize, new_length: usize) {
        let new_class = self.classes.size_to_class(new_length);
        assert!(
            new_class >= self.class_min && new_class <= self.class_max,
            "length {} outside the configured block size range",
            new_length,
        );
        let stored = self.stored_class(id);
        assert!(stored != 0, "reallocate of free block id {}", id);

        let new_stored = new_class - self.class_min + 1;
        if new_stored == stored {
            return;
        }
        let old_index = stored - 1;
        let new_index = new_stored - 1;

        let old_slot = self.index.slot_of(id);
        let new_slot = self.heaps[new_index].append(&mut self.arena);
        let copy_len = cmp::min(
            self.heaps[old_index].slot_size,
            self.heaps[new_index].slot_size,
        );
        unsafe {
            // Header and payload prefix travel together; the heaps are
            // distinct classes, so the ranges cannot overlap.
            ptr::copy_nonoverlapping(
                self.heaps[old_index].slot_addr(old_slot),
                self.heaps[new_index].slot_addr(new_slot),
                copy_len,
            );
        }

        // Retire the old slot through the normal compacting path, then
        // point the descriptor at the new home.
        self.deallocate(id);
        self.index.set(id, new_stored, new_slot);
        trace!("reallocate id={} -> class {} slot {}", id, new_class, new_slot);
    }

    /// The current address of `id`'s payload, or null if `id` is free.
    ///
    /// The address is valid only until the next `allocate`, `deallocate`
    /// or `reallocate` on *any* block of this handle.
    pub fn dereference(&mut self, id: usize) -> *mut u8 {
        let stored = self.stored_class(id);
        if stored == 0 {
            return ptr::null_mut();
        }
        let slot = self.index.slot_of(id);
        unsafe { self.heaps[stored - 1].slot_addr(slot).add(self.id_width) }
    }

    /// Read-only flavor of [`dereference`](Multiheap::dereference), with
    /// the same lifetime caveat.
    pub fn dereference_const(&self, id: usize) -> *const u8 {
        let stored = self.stored_class(id);
        if stored == 0 {
            return ptr::null();
        }
        let slot = self.index.slot_of(id);
        unsafe { self.heaps[stored - 1].slot_addr(slot).add(self.id_width) }
    }

    /// The internal length of block `id` (its class's representative
    /// size, at least what was requested), or 0 if free.
    pub fn length(&self, id: usize) -> usize {
        let stored = self.stored_class(id);
        if stored == 0 {
            0
        } else {
            self.classes.class_to_size(self.class_min + stored - 1)
        }
    }

    /// [`dereference`](Multiheap::dereference) and
    /// [`length`](Multiheap::length) from a single descriptor lookup.
    pub fn dereference_and_length(&mut self, id: usize) -> (*mut u8, usize) {
        let stored = self.stored_class(id);
        if stored == 0 {
            return (ptr::null_mut(), 0);
        }
        let slot = self.index.slot_of(id);
        let addr = unsafe { self.heaps[stored - 1].slot_addr(slot).add(self.id_width) };
        (addr, self.classes.class_to_size(self.class_min + stored - 1))
    }

    /// Bytes held by this handle: committed heap pages, the descriptor
    /// table, and the retained pool and garbage pages.
    pub fn using_mem(&self) -> usize {
        let shift = self.arena.page_shift();
        let mut total = mem::size_of::<Multiheap>();
        for heap in &self.heaps {
            total += mem::size_of::<ClassHeap>() + heap.heap.using_mem(shift);
        }
        total += self.index.using_mem();
        total += self.arena.pool_bytes();
        total += self.arena.garbage_bytes();
        total
    }

    /// Walk every descriptor and slot, verifying density and header
    /// agreement. Meant for tests and debugging; cost is linear in the
    /// configured block limit.
    pub fn audit(&self) -> Audit {
        let mut report = Audit::default();
        let mut live_per_heap = vec![0usize; self.heaps.len()];

        for id in 0..self.block_limit {
            let stored = self.index.class_of(id);
            if stored == 0 {
                continue;
            }
            let heap = &self.heaps[stored - 1];
            let slot = self.index.slot_of(id);
            live_per_heap[stored - 1] += 1;
            if slot >= heap.count {
                report.stray_slots += 1;
                continue;
            }
            let header = unsafe { codec::get_uint(heap.slot_addr(slot), self.id_width) };
            if header != id as u64 {
                report.header_mismatches += 1;
            }
        }

        for (heap, &live) in self.heaps.iter().zip(&live_per_heap) {
            if heap.count != live {
                report.count_mismatches += 1;
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn small_config() -> Config {
        Config::new(1, 2048, 64, 128 * 1024)
    }

    #[test]
    fn test_round_trip() {
        let mut mh = Multiheap::new(small_config());
        mh.allocate(3, 100);
        let p = mh.dereference(3);
        assert!(!p.is_null());
        unsafe {
            for i in 0..100 {
                p.add(i).write(i as u8);
            }
        }
        assert!(mh.length(3) >= 100);
        let q = mh.dereference(3);
        unsafe {
            for i in 0..100 {
                assert_eq!(q.add(i).read(), i as u8);
            }
        }
        assert!(mh.audit().is_valid());
    }

    #[test]
    fn test_free_queries_are_null() {
        let mut mh = Multiheap::new(small_config());
        assert!(mh.dereference(5).is_null());
        assert!(mh.dereference_const(5).is_null());
        assert_eq!(mh.length(5), 0);
        let (p, len) = mh.dereference_and_length(5);
        assert!(p.is_null());
        assert_eq!(len, 0);

        mh.allocate(5, 32);
        assert!(!mh.dereference(5).is_null());
        mh.deallocate(5);
        assert!(mh.dereference(5).is_null());
        assert_eq!(mh.length(5), 0);
    }

    #[test]
    fn test_tail_swap_moves_last_block() {
        let mut mh = Multiheap::new(small_config());
        mh.allocate(0, 16);
        mh.allocate(1, 16);
        mh.allocate(2, 16);
        let p1 = mh.dereference(1);
        let p2 = mh.dereference(2);
        assert_ne!(p1, p2);

        // Freeing 1 moves 2 (the tail) into 1's slot.
        mh.deallocate(1);
        assert_eq!(mh.dereference(2), p1);
        assert!(mh.audit().is_valid());
    }

    #[test]
    fn test_content_survives_compaction() {
        let mut mh = Multiheap::new(small_config());
        mh.allocate(0, 64);
        mh.allocate(1, 64);
        mh.allocate(2, 64);
        unsafe { mh.dereference(2).write_bytes(0x5a, 64) };
        mh.deallocate(0);
        mh.deallocate(1);
        let p = mh.dereference(2);
        unsafe {
            for i in 0..64 {
                assert_eq!(p.add(i).read(), 0x5a);
            }
        }
    }

    #[test]
    fn test_reallocate_changes_class_keeps_prefix() {
        let mut mh = Multiheap::new(small_config());
        mh.allocate(7, 100);
        unsafe { mh.dereference(7).write_bytes(0xa5, 100) };
        let old_len = mh.length(7);

        mh.reallocate(7, 2000);
        assert!(mh.length(7) >= 2000);
        assert_ne!(mh.length(7), old_len);
        let p = mh.dereference(7);
        unsafe {
            for i in 0..100 {
                assert_eq!(p.add(i).read(), 0xa5);
            }
        }
        assert!(mh.audit().is_valid());

        // Same class: a no-op, address included.
        let before = mh.dereference(7);
        mh.reallocate(7, 1999);
        assert_eq!(mh.dereference(7), before);
    }

    #[test]
    fn test_using_mem_settles_after_churn() {
        let mut mh = Multiheap::new(Config::new(16, 4096, 256, 1 << 20));
        for id in 0..256 {
            mh.allocate(id, 4096);
        }
        let peak = mh.using_mem();
        for id in 0..256 {
            mh.deallocate(id);
        }
        let settled = mh.using_mem();
        assert!(settled < peak);
        assert!(mh.audit().is_valid());
    }

    #[test]
    #[should_panic(expected = "already live")]
    fn test_double_allocate_panics() {
        let mut mh = Multiheap::new(small_config());
        mh.allocate(0, 16);
        mh.allocate(0, 16);
    }

    #[test]
    #[should_panic(expected = "free block")]
    fn test_double_free_panics() {
        let mut mh = Multiheap::new(small_config());
        mh.allocate(0, 16);
        mh.deallocate(0);
        mh.deallocate(0);
    }
}
