//! Pseudo-heaps: page-granular growable regions.
//!
//! Two flavors, one per backing policy:
//!
//! - [`ArenaHeap`] lives in a fixed slot of the [`Arena`](crate::arena::Arena)
//!   and keeps a stable base address forever; growth commits pages in
//!   place, shrinking feeds the recycling caches. The size-class heaps of
//!   the multiheap engine are these.
//! - [`RemapHeap`] is a single moveable mapping resized with `mremap`;
//!   the kernel relocates it at will. The pseudo-page engine's internal
//!   tables use these, since they index by offset and never hand out
//!   long-lived interior pointers.

use core::ptr::NonNull;

use crate::arena::Arena;
use crate::sys;

fn pages_for(len: usize, page_shift: u32) -> usize {
    (len + ((1 << page_shift) - 1)) >> page_shift
}

/// A growable region inside one arena slot. Base address is stable from
/// the first grow until the heap empties back into the pool.
pub struct ArenaHeap {
    /// Key into the arena's garbage table.
    owner: usize,
    addr: Option<NonNull<u8>>,
    /// Committed pages, excluding any trimmed tail parked in the arena.
    pages: usize,
}

impl ArenaHeap {
    pub fn new(owner: usize) -> ArenaHeap {
        ArenaHeap {
            owner,
            addr: None,
            pages: 0,
        }
    }

    /// Base address. Meaningful only while the heap holds at least one
    /// committed page.
    pub fn address(&self) -> *mut u8 {
        debug_assert!(self.addr.is_some(), "address of an empty heap");
        self.addr.map_or(core::ptr::null_mut(), |a| a.as_ptr())
    }

    /// Ensure at least `new_size` bytes are committed. No-op when the
    /// heap is already big enough.
    ///
    /// Reuse order: pooled region (when the heap is coming to life), then
    /// this heap's own garbage tail, then freshly committed pages.
    pub fn grow(&mut self, arena: &mut Arena, new_size: usize) {
        let shift = arena.page_shift();
        let new_pages = pages_for(new_size, shift);
        let mut have = self.pages;
        if have >= new_pages {
            return;
        }

        let addr = match self.addr {
            None => {
                let (addr, committed) = arena.acquire_region();
                // mmap never returns null, and slot addresses come from a
                // live reservation.
                self.addr = Some(unsafe { NonNull::new_unchecked(addr) });
                have = committed;
                if have >= new_pages {
                    self.pages = have;
                    return;
                }
                addr
            }
            Some(addr) => {
                if let Some(reclaimed) = arena.take_tail(self.owner) {
                    have += reclaimed;
                    if have >= new_pages {
                        self.pages = have;
                        return;
                    }
                }
                addr.as_ptr()
            }
        };

        sys::commit(
            unsafe { addr.add(have << shift) },
            (new_pages - have) << shift,
        )
        .unwrap_or_else(|e| panic!("growing pseudo-heap: {}", e));
        self.pages = new_pages;
    }

    /// Reduce the heap to `new_size` bytes plus the configured slack.
    ///
    /// A shrink to nothing returns the whole region to the pool; a
    /// partial shrink parks the trimmed tail in the garbage table, still
    /// committed, where the next grow can splice it back.
    pub fn shrink(&mut self, arena: &mut Arena, new_size: usize) {
        let shift = arena.page_shift();
        let (num, den) = arena.shrink_slack();
        let keep = pages_for(new_size, shift) * num / den;
        if self.pages <= keep {
            return;
        }
        let addr = match self.addr {
            Some(a) => a.as_ptr(),
            None => return,
        };

        // Either way the previous tail is superseded.
        arena.drop_tail(self.owner);
        if keep == 0 {
            arena.release_region(addr, self.pages);
            self.addr = None;
            self.pages = 0;
        } else {
            arena.push_tail(self.owner, unsafe { addr.add(keep << shift) }, self.pages - keep);
            self.pages = keep;
        }
    }

    /// Committed bytes (the parked tail is accounted by the arena).
    pub fn using_mem(&self, page_shift: u32) -> usize {
        self.pages << page_shift
    }
}

/// A moveable mapping resized with `mremap`. Holds one page from birth so
/// resizing never deals with a zero-length mapping.
pub struct RemapHeap {
    addr: NonNull<u8>,
    pages: usize,
    page_shift: u32,
}

impl RemapHeap {
    pub fn new() -> RemapHeap {
        let page_size = sys::page_size();
        let page_shift = page_size.trailing_zeros();
        let addr = sys::reserve(page_size)
            .and_then(|a| sys::commit(a.as_ptr(), page_size).map(|()| a))
            .unwrap_or_else(|e| panic!("creating table heap: {}", e));
        RemapHeap {
            addr,
            pages: 1,
            page_shift,
        }
    }

    /// Current base. Invalidated by the next [`resize`](Self::resize).
    pub fn address(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Resize to hold `new_len` bytes. The base address may change.
    pub fn resize(&mut self, new_len: usize) {
        let new_pages = (new_len >> self.page_shift) + 1;
        if new_pages == self.pages {
            return;
        }
        self.addr = sys::remap_move(
            self.addr.as_ptr(),
            self.pages << self.page_shift,
            new_pages << self.page_shift,
        )
        .unwrap_or_else(|e| panic!("resizing table heap: {}", e));
        self.pages = new_pages;
    }

    pub fn using_mem(&self) -> usize {
        self.pages << self.page_shift
    }
}

impl Drop for RemapHeap {
    fn drop(&mut self) {
        let _ = sys::unmap(self.addr.as_ptr(), self.pages << self.page_shift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::arena::RecycleTunables;
    use test_log::test;

    #[test]
    fn test_arena_heap_grow_shrink() {
        let mut arena = Arena::new(1, RecycleTunables::default());
        let shift = arena.page_shift();
        let ps = 1usize << shift;
        let mut heap = ArenaHeap::new(0);

        heap.grow(&mut arena, 10);
        let base = heap.address();
        unsafe { base.write_bytes(0x42, 10) };
        assert_eq!(heap.using_mem(shift), ps);

        // Growing within the committed page is free; growing past it
        // commits more without moving the base.
        heap.grow(&mut arena, ps);
        assert_eq!(heap.address(), base);
        heap.grow(&mut arena, 5 * ps);
        assert_eq!(heap.address(), base);
        assert_eq!(heap.using_mem(shift), 5 * ps);
        unsafe { assert_eq!(base.read(), 0x42) };

        heap.shrink(&mut arena, ps);
        assert!(heap.using_mem(shift) < 5 * ps);
    }

    #[test]
    fn test_arena_heap_tail_splice() {
        let mut arena = Arena::new(1, RecycleTunables::default());
        let shift = arena.page_shift();
        let ps = 1usize << shift;
        let mut heap = ArenaHeap::new(0);

        heap.grow(&mut arena, 6 * ps);
        let base = heap.address();
        unsafe { base.add(4 * ps).write(0x77) };

        heap.shrink(&mut arena, 2 * ps);
        assert!(arena.garbage_bytes() > 0);

        // Growing back reclaims the parked tail with its contents; the
        // pages were never decommitted.
        heap.grow(&mut arena, 6 * ps);
        assert_eq!(heap.address(), base);
        assert_eq!(arena.garbage_bytes(), 0);
        unsafe { assert_eq!(base.add(4 * ps).read(), 0x77) };
    }

    #[test]
    fn test_arena_heap_pool_cycle() {
        let mut arena = Arena::new(1, RecycleTunables::default());
        let shift = arena.page_shift();
        let ps = 1usize << shift;
        let mut heap = ArenaHeap::new(0);

        heap.grow(&mut arena, 3 * ps);
        let base = heap.address();
        heap.shrink(&mut arena, 0);
        assert_eq!(heap.using_mem(shift), 0);
        assert_eq!(arena.pool_bytes(), 3 * ps);

        let mut heap2 = ArenaHeap::new(0);
        heap2.grow(&mut arena, ps);
        assert_eq!(heap2.address(), base);
        // The pooled region was larger than asked; all of it is kept.
        assert_eq!(heap2.using_mem(shift), 3 * ps);
    }

    #[test]
    fn test_remap_heap_resize() {
        let mut heap = RemapHeap::new();
        let ps = sys::page_size();
        unsafe { heap.address().write_bytes(0x31, 100) };

        heap.resize(8 * ps);
        assert_eq!(heap.using_mem(), 9 * ps);
        unsafe {
            assert_eq!(heap.address().read(), 0x31);
            heap.address().add(8 * ps).write(1);
        }

        heap.resize(10);
        assert_eq!(heap.using_mem(), ps);
        unsafe { assert_eq!(heap.address().add(99).read(), 0x31) };
    }
}
