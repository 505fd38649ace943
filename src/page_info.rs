//! Per-pseudo-page metadata and free-id recycling.
//!
//! One packed record per page id ever issued: `{prev, next, offset,
//! size class}`, where prev/next chain the pages serving a size class
//! (head first) and `offset` is the byte position of the page's first
//! live block header. Records live in a remap-grown heap and the table
//! only ever grows; freed ids are recycled, not reclaimed.
//!
//! Freed ids take one of two routes back:
//!
//! - a small fixed-capacity **pool** whose ids keep their physical page
//!   bound and mapped, so reusing one costs nothing at all;
//! - a packed **stack** for the overflow, whose ids gave their page back
//!   and need a fresh bind on reuse.

use log::trace;

use crate::codec;
use crate::pheap::RemapHeap;

pub struct PageInfo {
    data: RemapHeap,
    /// Page ids issued so far; the next fresh id.
    records: u64,
    page_width: usize,
    offset_width: usize,
    record: usize,
    /// Freed ids with mapping and binding retained.
    pool: Vec<u64>,
    pool_cap: usize,
    /// Freed ids whose page went back to the provider, packed at
    /// `page_width` bytes each.
    stack: RemapHeap,
    stack_len: u64,
}

impl PageInfo {
    pub fn new(page_width: usize, offset_width: usize, pool_cap: usize) -> PageInfo {
        PageInfo {
            data: RemapHeap::new(),
            records: 0,
            page_width,
            offset_width,
            record: 2 * page_width + 2 * offset_width,
            pool: Vec::with_capacity(pool_cap),
            pool_cap,
            stack: RemapHeap::new(),
            stack_len: 0,
        }
    }

    #[inline]
    fn record_ptr(&self, id: u64) -> *mut u8 {
        debug_assert!(id < self.records, "page id {} has no record", id);
        unsafe { self.data.address().add(id as usize * self.record) }
    }

    /// Hand out a page id: pool first (mapping still live), then the
    /// stack, then a fresh id with a fresh record.
    ///
    /// The flag says whether the id's physical page is already bound and
    /// mapped; when it is false the caller must bind one.
    pub fn pop_free(&mut self) -> (u64, bool) {
        if let Some(id) = self.pool.pop() {
            trace!("page pool: reusing mapped id {}", id);
            return (id, true);
        }
        if self.stack_len > 0 {
            self.stack_len -= 1;
            let at = self.stack_len as usize * self.page_width;
            let id = unsafe { codec::get_uint(self.stack.address().add(at), self.page_width) };
            self.stack.resize(self.stack_len as usize * self.page_width);
            return (id, false);
        }
        let id = self.records;
        self.records += 1;
        self.data.resize(self.records as usize * self.record);
        (id, false)
    }

    /// Take back a freed page id. Returns true when it was pooled (the
    /// caller must then leave the page bound and mapped), false when it
    /// went to the stack and the caller must unbind it.
    pub fn push_free(&mut self, id: u64) -> bool {
        if self.pool.len() < self.pool_cap {
            self.pool.push(id);
            return true;
        }
        let at = self.stack_len as usize * self.page_width;
        self.stack_len += 1;
        self.stack.resize(self.stack_len as usize * self.page_width);
        unsafe { codec::put_uint(self.stack.address().add(at), self.page_width, id) };
        false
    }

    /// Write all four fields of `id` in one burst (page insertion).
    pub fn replace(&mut self, id: u64, prev: u64, next: u64, offset: usize, class: usize) {
        let ptr = self.record_ptr(id);
        let (pw, ow) = (self.page_width, self.offset_width);
        unsafe {
            codec::put_uint(ptr, pw, prev);
            codec::put_uint(ptr.add(pw), pw, next);
            codec::put_uint(ptr.add(2 * pw), ow, offset as u64);
            codec::put_uint(ptr.add(2 * pw + ow), ow, class as u64);
        }
    }

    pub fn prev_of(&self, id: u64) -> u64 {
        unsafe { codec::get_uint(self.record_ptr(id), self.page_width) }
    }

    pub fn set_prev(&mut self, id: u64, prev: u64) {
        let pw = self.page_width;
        unsafe { codec::put_uint(self.record_ptr(id), pw, prev) }
    }

    pub fn next_of(&self, id: u64) -> u64 {
        let pw = self.page_width;
        unsafe { codec::get_uint(self.record_ptr(id).add(pw), pw) }
    }

    pub fn set_next(&mut self, id: u64, next: u64) {
        let pw = self.page_width;
        unsafe { codec::put_uint(self.record_ptr(id).add(pw), pw, next) }
    }

    /// Byte offset of the page's first live block header.
    pub fn offset_of(&self, id: u64) -> usize {
        let (pw, ow) = (self.page_width, self.offset_width);
        unsafe { codec::get_uint(self.record_ptr(id).add(2 * pw), ow) as usize }
    }

    pub fn set_offset(&mut self, id: u64, offset: usize) {
        let (pw, ow) = (self.page_width, self.offset_width);
        unsafe { codec::put_uint(self.record_ptr(id).add(2 * pw), ow, offset as u64) }
    }

    /// The size class this page serves.
    pub fn class_of(&self, id: u64) -> usize {
        let (pw, ow) = (self.page_width, self.offset_width);
        unsafe { codec::get_uint(self.record_ptr(id).add(2 * pw + ow), ow) as usize }
    }

    /// Table bytes plus both recycling structures.
    pub fn using_mem(&self) -> usize {
        core::mem::size_of::<Self>()
            + self.data.using_mem()
            + self.stack.using_mem()
            + self.pool.capacity() * core::mem::size_of::<u64>()
    }
}
