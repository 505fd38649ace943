//! Per-block metadata tables.
//!
//! Each live block id owns one fixed-size record in a dense table. The
//! record is two packed big-endian fields whose widths are fixed when the
//! allocator is constructed, sized so every legal value fits (see
//! [`codec`](crate::codec)). The two engines interpret the fields
//! differently:
//!
//! - [`BlockIndex`] (multiheap): `{size class, slot index}`, size class 0
//!   meaning free. The table starts zeroed.
//! - [`BlockMap`] (pseudo-page engine): `{page offset, page id}`, an
//!   all-ones page id meaning free. The table starts at all-ones so a
//!   never-allocated id dereferences to null.

use crate::codec;

/// Block id → (size class, slot index). Size class 0 is "free".
pub struct BlockIndex {
    data: Vec<u8>,
    record: usize,
    class_width: usize,
    slot_width: usize,
    blocks: usize,
}

impl BlockIndex {
    pub fn new(class_width: usize, slot_width: usize, blocks: usize) -> BlockIndex {
        let record = class_width + slot_width;
        BlockIndex {
            // Zeroed data marks every id free.
            data: vec![0u8; record * blocks],
            record,
            class_width,
            slot_width,
            blocks,
        }
    }

    #[inline]
    fn record_ptr(&self, id: usize) -> *const u8 {
        debug_assert!(id < self.blocks, "block id {} out of range", id);
        unsafe { self.data.as_ptr().add(id * self.record) }
    }

    #[inline]
    fn record_mut(&mut self, id: usize) -> *mut u8 {
        debug_assert!(id < self.blocks, "block id {} out of range", id);
        unsafe { self.data.as_mut_ptr().add(id * self.record) }
    }

    /// The stored size class of `id`; 0 when the block is free.
    pub fn class_of(&self, id: usize) -> usize {
        unsafe { codec::get_uint(self.record_ptr(id), self.class_width) as usize }
    }

    pub fn set_class(&mut self, id: usize, class: usize) {
        let width = self.class_width;
        unsafe { codec::put_uint(self.record_mut(id), width, class as u64) }
    }

    pub fn slot_of(&self, id: usize) -> usize {
        let (class_width, slot_width) = (self.class_width, self.slot_width);
        unsafe { codec::get_uint(self.record_ptr(id).add(class_width), slot_width) as usize }
    }

    pub fn set_slot(&mut self, id: usize, slot: usize) {
        let (class_width, slot_width) = (self.class_width, self.slot_width);
        unsafe {
            codec::put_uint(
                self.record_mut(id).add(class_width),
                slot_width,
                slot as u64,
            )
        }
    }

    /// Write both fields in one go (the allocate path).
    pub fn set(&mut self, id: usize, class: usize, slot: usize) {
        self.set_class(id, class);
        self.set_slot(id, slot);
    }

    pub fn using_mem(&self) -> usize {
        self.data.len()
    }
}

/// Block id → (offset in page, page id). An all-ones page id is "free".
pub struct BlockMap {
    data: Vec<u8>,
    record: usize,
    offset_width: usize,
    page_width: usize,
    blocks: usize,
    null_page: u64,
}

impl BlockMap {
    pub fn new(offset_width: usize, page_width: usize, blocks: usize) -> BlockMap {
        let record = offset_width + page_width;
        BlockMap {
            // All-ones page fields mark every id free from the start.
            data: vec![0xffu8; record * blocks],
            record,
            offset_width,
            page_width,
            blocks,
            null_page: codec::ones(page_width),
        }
    }

    /// The page id value meaning "no page": all ones at the configured
    /// width.
    pub fn null_page(&self) -> u64 {
        self.null_page
    }

    #[inline]
    fn record_ptr(&self, id: usize) -> *const u8 {
        debug_assert!(id < self.blocks, "block id {} out of range", id);
        unsafe { self.data.as_ptr().add(id * self.record) }
    }

    #[inline]
    fn record_mut(&mut self, id: usize) -> *mut u8 {
        debug_assert!(id < self.blocks, "block id {} out of range", id);
        unsafe { self.data.as_mut_ptr().add(id * self.record) }
    }

    /// Both fields of `id` in one lookup.
    pub fn site_of(&self, id: usize) -> (usize, u64) {
        let ptr = self.record_ptr(id);
        unsafe {
            (
                codec::get_uint(ptr, self.offset_width) as usize,
                codec::get_uint(ptr.add(self.offset_width), self.page_width),
            )
        }
    }

    pub fn set_site(&mut self, id: usize, offset: usize, page: u64) {
        let (offset_width, page_width) = (self.offset_width, self.page_width);
        let ptr = self.record_mut(id);
        unsafe {
            codec::put_uint(ptr, offset_width, offset as u64);
            codec::put_uint(ptr.add(offset_width), page_width, page);
        }
    }

    pub fn offset_of(&self, id: usize) -> usize {
        unsafe { codec::get_uint(self.record_ptr(id), self.offset_width) as usize }
    }

    pub fn set_offset(&mut self, id: usize, offset: usize) {
        let width = self.offset_width;
        unsafe { codec::put_uint(self.record_mut(id), width, offset as u64) }
    }

    pub fn page_of(&self, id: usize) -> u64 {
        let (offset_width, page_width) = (self.offset_width, self.page_width);
        unsafe { codec::get_uint(self.record_ptr(id).add(offset_width), page_width) }
    }

    /// Mark `id` free by writing the null page sentinel.
    pub fn clear_page(&mut self, id: usize) {
        let (offset_width, page_width) = (self.offset_width, self.page_width);
        unsafe { codec::put_ones(self.record_mut(id).add(offset_width), page_width) }
    }

    pub fn is_free(&self, id: usize) -> bool {
        self.page_of(id) == self.null_page
    }

    /// Copy the whole record of `src` over the record of `dst`.
    ///
    /// The compactor uses this to point the moved head block at the slot
    /// it was copied into.
    pub fn copy_record(&mut self, src: usize, dst: usize) {
        debug_assert!(src < self.blocks && dst < self.blocks);
        debug_assert_ne!(src, dst);
        let record = self.record;
        unsafe {
            let src_ptr = self.data.as_ptr().add(src * record);
            let dst_ptr = self.data.as_mut_ptr().add(dst * record);
            core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, record);
        }
    }

    pub fn using_mem(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_index_starts_free() {
        let table = BlockIndex::new(1, 3, 16);
        for id in 0..16 {
            assert_eq!(table.class_of(id), 0);
        }
    }

    #[test]
    fn test_index_set_get() {
        let mut table = BlockIndex::new(1, 3, 16);
        table.set(3, 7, 0x12345);
        table.set(4, 200, 1);
        assert_eq!(table.class_of(3), 7);
        assert_eq!(table.slot_of(3), 0x12345);
        assert_eq!(table.class_of(4), 200);
        assert_eq!(table.slot_of(4), 1);

        table.set_class(3, 0);
        assert_eq!(table.class_of(3), 0);
        // The slot field is untouched by a class write.
        assert_eq!(table.slot_of(3), 0x12345);
    }

    #[test]
    fn test_map_starts_null() {
        let table = BlockMap::new(2, 2, 8);
        assert_eq!(table.null_page(), 0xffff);
        for id in 0..8 {
            assert!(table.is_free(id));
        }
    }

    #[test]
    fn test_map_set_get_clear() {
        let mut table = BlockMap::new(2, 2, 8);
        table.set_site(5, 0x0102, 3);
        assert_eq!(table.site_of(5), (0x0102, 3));
        assert!(!table.is_free(5));

        table.set_offset(5, 0x0a0b);
        assert_eq!(table.site_of(5), (0x0a0b, 3));

        table.clear_page(5);
        assert!(table.is_free(5));
        // The offset field survives the clear, as in the packed layout.
        assert_eq!(table.offset_of(5), 0x0a0b);
    }

    #[test]
    fn test_map_copy_record() {
        let mut table = BlockMap::new(3, 2, 8);
        table.set_site(1, 0xbeef, 9);
        table.set_site(2, 0x1111, 4);
        table.copy_record(1, 2);
        assert_eq!(table.site_of(2), (0xbeef, 9));
        assert_eq!(table.site_of(1), (0xbeef, 9));
    }
}
