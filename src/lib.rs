//! Space-saving allocators for relocatable, application-indexed blocks.
//!
//! Instead of stable pointers, callers hold opaque **block ids** of their
//! own choosing and ask the allocator for the block's current address
//! right before each use. Giving up address stability buys density: each
//! size class is a packed array of equal slots in which a freed slot is
//! refilled by the class's last block ("compact-on-free"), so live data
//! always occupies a contiguous prefix and internal fragmentation is
//! bounded by the size-class rounding alone.
//!
//! Two engines share that design and this API:
//!
//! - [`Multiheap`] backs every size class with a demand-mapped region in
//!   the process's own virtual memory, plus a recycling heuristic that
//!   retains recently released pages (see [`arena`]).
//! - [`VirtualMultiheap`] composes size classes from fixed-size
//!   *pseudo-pages* handed out by a [`PageService`]: the kernel
//!   page-allocation module over its character device
//!   ([`DevicePages`]), or an in-process memfd stand-in
//!   ([`MemfdPages`]). Linked pages are stitched together with a
//!   two-slot virtual-address trick so a block may straddle two
//!   non-adjacent physical pages behind one contiguous pointer.
//!
//! ## The relocation contract
//!
//! An address returned by `dereference` is a loan: it is valid until the
//! next `allocate`, `deallocate` or `reallocate` on *any* block of the
//! same handle, which may move any block. Writing through a stale
//! address is undefined behavior. `dereference` of a free id returns
//! null and `length` returns 0.
//!
//! Handles are strictly single-threaded; they are neither `Send` nor
//! `Sync`, and nothing here implements `GlobalAlloc`.
//!
//! ## Failure model
//!
//! Configuration and usage contract violations (length out of range,
//! double free, id collision) are programming errors and panic. So do OS
//! mapping failures: the engines hold compacting invariants across
//! process-wide mappings, and no partially-applied state is recoverable.

pub mod arena;
pub mod block_info;
pub mod codec;
pub mod multiheap;
pub mod page_info;
pub mod page_map;
pub mod page_service;
pub mod pheap;
pub mod size_class;
pub mod sys;
pub mod vheap;

pub use arena::RecycleTunables;
pub use multiheap::{Audit, Multiheap};
pub use page_service::{DevicePages, MemfdPages, PageService};
pub use size_class::SizeClassMode;
pub use sys::SysError;
pub use vheap::{VAudit, VirtualMultiheap};

/// Storage layout of the packed metadata fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    /// Four-byte fields throughout. Wider but simpler; matches the
    /// original fixed-integer build.
    Fixed,
    /// Field widths computed from the configured limits, one byte
    /// granularity. The space-saving default.
    Packed,
}

/// Allocator configuration. The four limits mirror the `init`
/// parameters of the original design; the rest is ambient policy with
/// serviceable defaults.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Smallest allocatable block, in bytes. Must be positive.
    pub min_block: usize,
    /// Largest allocatable block, in bytes.
    pub max_block: usize,
    /// Exclusive upper bound of the block-id space.
    pub block_limit: usize,
    /// Declared cap on total live payload bytes. Sizes the packed
    /// metadata fields and the pseudo-page fleet; never enforced, and
    /// exceeding it is undefined.
    pub total_limit: usize,
    /// Size-class construction.
    pub mode: SizeClassMode,
    /// Metadata field layout.
    pub widths: FieldWidth,
    /// Page-recycling tunables of the multiheap engine.
    pub recycle: RecycleTunables,
    /// Freed pseudo-pages kept bound and mapped by the pseudo-page
    /// engine.
    pub page_pool_cap: usize,
}

impl Config {
    /// A configuration with the given limits and default policy:
    /// geometric size classes, packed fields, default recycling caps.
    pub fn new(
        min_block: usize,
        max_block: usize,
        block_limit: usize,
        total_limit: usize,
    ) -> Config {
        Config {
            min_block,
            max_block,
            block_limit,
            total_limit,
            mode: SizeClassMode::default(),
            widths: FieldWidth::Packed,
            recycle: RecycleTunables::default(),
            page_pool_cap: 8,
        }
    }
}
