//! Memory management module
//!
//! Pool memory (non-paged, paged, physically contiguous and 2MB large
//! pages), physical address translation and I/O space mapping.
//!
//! The host supplies the actual allocator through [`PoolAllocator`] and the
//! address translation through [`PhysicalMemory`]. The helpers in this module
//! layer the driver's policy on top: every helper allocation is zeroed, tagged
//! and returned as an RAII buffer that frees itself on drop.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

pub mod pool;

pub use pool::{PhysicalMapping, PoolArray, PoolBox, PoolBuffer};

use crate::utils::align_up;

/// Physical address type
pub type PhysAddr = u64;

/// Page size
pub const PAGE_SIZE: usize = 4096;

/// Large page size (2MB)
pub const LARGE_PAGE_SIZE: usize = 0x20_0000;

/// Highest physical address, i.e. no restriction
pub const MAX_PHYS_ADDR: PhysAddr = PhysAddr::MAX;

/// Cache line size used for [`AllocationFlags::CACHE_ALIGNED`]
pub const CACHE_LINE_SIZE: usize = 64;

/// Four-character pool tag stamped on allocations for leak tracking
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolTag([u8; 4]);

impl PoolTag {
    /// Default tag for non-paged allocations
    pub const NONPAGED: PoolTag = PoolTag(*b"NvNp");
    /// Default tag for paged allocations
    pub const PAGED: PoolTag = PoolTag(*b"NvPg");
    /// Tag for generic call bookkeeping
    pub const GENERIC_CALL: PoolTag = PoolTag(*b"NvGc");

    /// Create a tag from four bytes
    pub const fn new(bytes: [u8; 4]) -> Self {
        PoolTag(bytes)
    }

    /// Raw tag bytes
    pub const fn as_bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Tag as the little-endian integer pool trackers display
    pub const fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl fmt::Debug for PoolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolTag(\"")?;
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        write!(f, "\")")
    }
}

/// Kind of memory an allocation is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolType {
    /// Always resident; usable at any interrupt level
    NonPaged,
    /// May be paged out; only usable at passive level
    Paged,
    /// Physically contiguous, page aligned, below `highest`
    Contiguous {
        /// Highest acceptable physical address
        highest: PhysAddr,
    },
    /// One physically contiguous, 2MB aligned large page
    LargePage,
}

impl PoolType {
    /// Memory of this kind can be touched from deferred procedure calls
    pub const fn is_resident(self) -> bool {
        !matches!(self, PoolType::Paged)
    }
}

bitflags! {
    /// Allocation modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocationFlags: u32 {
        /// Align the allocation to a cache line
        const CACHE_ALIGNED = 1 << 0;
    }
}

/// A single allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Pool to allocate from
    pub pool: PoolType,
    /// Requested size and alignment
    pub layout: Layout,
    /// Pool tag
    pub tag: PoolTag,
    /// Modifiers
    pub flags: AllocationFlags,
}

impl AllocationRequest {
    /// Create a request without modifiers
    pub const fn new(pool: PoolType, layout: Layout, tag: PoolTag) -> Self {
        Self {
            pool,
            layout,
            tag,
            flags: AllocationFlags::empty(),
        }
    }

    /// Layout the allocator must honour once pool rules are applied.
    ///
    /// Contiguous allocations are page aligned and rounded to whole pages;
    /// large pages are exactly 2MB aligned and sized.
    pub fn effective_layout(&self) -> Result<Layout, AllocationError> {
        if self.layout.size() == 0 {
            return Err(AllocationError::InvalidSize);
        }

        let mut align = self.layout.align();
        let mut size = self.layout.size();

        if self.flags.contains(AllocationFlags::CACHE_ALIGNED) {
            align = align.max(CACHE_LINE_SIZE);
        }

        match self.pool {
            PoolType::NonPaged | PoolType::Paged => {}
            PoolType::Contiguous { .. } => {
                align = align.max(PAGE_SIZE);
                size = align_up(size, PAGE_SIZE);
            }
            PoolType::LargePage => {
                if size > LARGE_PAGE_SIZE {
                    return Err(AllocationError::InvalidSize);
                }
                align = align.max(LARGE_PAGE_SIZE);
                size = LARGE_PAGE_SIZE;
            }
        }

        Layout::from_size_align(size, align).map_err(|_| AllocationError::InvalidLayout)
    }
}

/// Memory management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Zero or oversized request
    #[error("invalid allocation size")]
    InvalidSize,
    /// Size and alignment do not form a valid layout
    #[error("invalid allocation layout")]
    InvalidLayout,
    /// The pool could not satisfy the request
    #[error("out of memory")]
    OutOfMemory,
    /// Address is not backed by a mapping
    #[error("invalid address")]
    InvalidAddress,
    /// Physical range could not be mapped
    #[error("physical memory mapping failed")]
    MappingFailed,
}

/// Allocation statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Total allocations performed
    pub total_allocations: u64,
    /// Total deallocations performed
    pub total_deallocations: u64,
    /// Bytes currently allocated
    pub current_usage: u64,
    /// Peak bytes allocated
    pub peak_usage: u64,
    /// Number of failed allocations
    pub failed_allocations: u64,
}

impl AllocationStats {
    /// Account for a successful allocation of `size` bytes
    pub fn record_allocation(&mut self, size: usize) {
        self.total_allocations += 1;
        self.current_usage += size as u64;
        self.peak_usage = self.peak_usage.max(self.current_usage);
    }

    /// Account for freeing `size` bytes
    pub fn record_deallocation(&mut self, size: usize) {
        self.total_deallocations += 1;
        self.current_usage = self.current_usage.saturating_sub(size as u64);
    }

    /// Account for a failed allocation
    pub fn record_failure(&mut self) {
        self.failed_allocations += 1;
    }
}

/// Host pool allocator
///
/// Implementations may return uninitialized memory; [`allocate`] zero fills
/// it before exposing it as bytes.
pub trait PoolAllocator {
    /// Allocate memory satisfying `request.effective_layout()`
    fn allocate(&self, request: &AllocationRequest) -> Result<NonNull<u8>, AllocationError>;

    /// Return memory obtained from [`PoolAllocator::allocate`].
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with an identical
    /// `request`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, request: &AllocationRequest);

    /// Tag used by the helpers for `pool`
    fn pool_tag(&self, pool: PoolType) -> PoolTag {
        match pool {
            PoolType::Paged => PoolTag::PAGED,
            _ => PoolTag::NONPAGED,
        }
    }
}

/// Host physical address services
pub trait PhysicalMemory {
    /// Physical address backing `virt`
    fn physical_address(&self, virt: *const u8) -> PhysAddr;

    /// Map `len` bytes of physical memory at `phys` into system space (cached)
    fn map_physical(&self, phys: PhysAddr, len: usize) -> Result<NonNull<u8>, AllocationError>;

    /// Undo [`PhysicalMemory::map_physical`].
    ///
    /// # Safety
    /// `virt` and `len` must describe a live mapping from `map_physical`.
    unsafe fn unmap_physical(&self, virt: NonNull<u8>, len: usize);

    /// System-space virtual address already mapping `phys`, if any
    fn find_virtual(&self, phys: PhysAddr) -> Option<NonNull<u8>>;
}

/// Allocate per `request`.
///
/// The buffer is always zero filled before it is handed out.
pub fn allocate<'a, A>(allocator: &'a A, request: AllocationRequest) -> Result<PoolBuffer<'a, A>, AllocationError>
where
    A: PoolAllocator + ?Sized,
{
    let layout = request.effective_layout()?;
    let ptr = allocator.allocate(&request).map_err(|e| {
        log::warn!("Failed to allocate {} bytes from {:?}: {:?}", layout.size(), request.pool, e);
        e
    })?;

    // SAFETY: the allocator handed out at least `layout.size()` bytes.
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, layout.size()) };

    log::trace!("Allocated {} bytes at {:p} from {:?} ({:?})", layout.size(), ptr, request.pool, request.tag);
    // SAFETY: `ptr` was just returned by `allocator` for `request`.
    Ok(unsafe { PoolBuffer::from_raw(allocator, ptr, request, layout.size()) })
}

fn allocate_bytes<A>(allocator: &A, pool: PoolType, length: usize, align: usize) -> Result<PoolBuffer<'_, A>, AllocationError>
where
    A: PoolAllocator + ?Sized,
{
    let layout = Layout::from_size_align(length, align).map_err(|_| AllocationError::InvalidLayout)?;
    let request = AllocationRequest::new(pool, layout, allocator.pool_tag(pool));
    allocate(allocator, request)
}

/// Zeroed, physically contiguous memory anywhere in physical space
pub fn alloc_contd_memory<A>(allocator: &A, length: usize) -> Result<PoolBuffer<'_, A>, AllocationError>
where
    A: PoolAllocator + ?Sized,
{
    allocate_bytes(allocator, PoolType::Contiguous { highest: MAX_PHYS_ADDR }, length, PAGE_SIZE)
}

/// Zeroed non-paged pool memory
pub fn alloc_nonpg_memory<A>(allocator: &A, length: usize) -> Result<PoolBuffer<'_, A>, AllocationError>
where
    A: PoolAllocator + ?Sized,
{
    allocate_bytes(allocator, PoolType::NonPaged, length, core::mem::align_of::<usize>())
}

/// Zeroed paged pool memory
pub fn alloc_paged_memory<A>(allocator: &A, length: usize) -> Result<PoolBuffer<'_, A>, AllocationError>
where
    A: PoolAllocator + ?Sized,
{
    allocate_bytes(allocator, PoolType::Paged, length, core::mem::align_of::<usize>())
}

/// One zeroed 2MB large page
pub fn alloc_2mb_page<A>(allocator: &A) -> Result<PoolBuffer<'_, A>, AllocationError>
where
    A: PoolAllocator + ?Sized,
{
    allocate_bytes(allocator, PoolType::LargePage, LARGE_PAGE_SIZE, LARGE_PAGE_SIZE)
}

/// Physical address backing `virt`
pub fn get_physical_address<P, T>(memory: &P, virt: *const T) -> PhysAddr
where
    P: PhysicalMemory + ?Sized,
{
    memory.physical_address(virt.cast())
}

/// Map a physical range; unmapped when the mapping drops
pub fn map_physical_memory<P>(memory: &P, phys: PhysAddr, len: usize) -> Result<PhysicalMapping<'_, P>, AllocationError>
where
    P: PhysicalMemory + ?Sized,
{
    if len == 0 {
        return Err(AllocationError::InvalidSize);
    }

    let virt = memory.map_physical(phys, len)?;
    // SAFETY: `virt` is a fresh mapping of `len` bytes from `memory`.
    Ok(unsafe { PhysicalMapping::from_raw(memory, virt, phys, len) })
}

/// System-space virtual address for `phys`, if mapped
pub fn find_virt_by_phys<P>(memory: &P, phys: PhysAddr) -> Option<NonNull<u8>>
where
    P: PhysicalMemory + ?Sized,
{
    memory.find_virtual(phys)
}

/// Initialize memory management
pub fn init() {
    log::debug!("Memory management: page size {:#x}, large page size {:#x}", PAGE_SIZE, LARGE_PAGE_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_tag() {
        assert_eq!(PoolTag::NONPAGED.as_bytes(), *b"NvNp");
        assert_eq!(PoolTag::new(*b"ABCD").as_u32(), 0x4443_4241);
        assert_eq!(std::format!("{:?}", PoolTag::PAGED), "PoolTag(\"NvPg\")");
    }

    #[test]
    fn test_effective_layout_contiguous() {
        let request = AllocationRequest::new(
            PoolType::Contiguous { highest: MAX_PHYS_ADDR },
            Layout::from_size_align(100, 8).unwrap(),
            PoolTag::NONPAGED,
        );
        let layout = request.effective_layout().unwrap();
        assert_eq!(layout.size(), PAGE_SIZE);
        assert_eq!(layout.align(), PAGE_SIZE);
    }

    #[test]
    fn test_effective_layout_large_page() {
        let request = AllocationRequest::new(PoolType::LargePage, Layout::new::<u64>(), PoolTag::NONPAGED);
        let layout = request.effective_layout().unwrap();
        assert_eq!(layout.size(), LARGE_PAGE_SIZE);
        assert_eq!(layout.align(), LARGE_PAGE_SIZE);

        let oversized = AllocationRequest::new(
            PoolType::LargePage,
            Layout::from_size_align(LARGE_PAGE_SIZE + 1, 8).unwrap(),
            PoolTag::NONPAGED,
        );
        assert_eq!(oversized.effective_layout(), Err(AllocationError::InvalidSize));
    }

    #[test]
    fn test_effective_layout_rejects_zero_size() {
        let request = AllocationRequest::new(PoolType::NonPaged, Layout::new::<()>(), PoolTag::NONPAGED);
        assert_eq!(request.effective_layout(), Err(AllocationError::InvalidSize));
    }

    #[test]
    fn test_cache_aligned_flag() {
        let mut request = AllocationRequest::new(PoolType::NonPaged, Layout::new::<u32>(), PoolTag::NONPAGED);
        request.flags |= AllocationFlags::CACHE_ALIGNED;
        assert_eq!(request.effective_layout().unwrap().align(), CACHE_LINE_SIZE);
    }

    #[test]
    fn test_stats_peak() {
        let mut stats = AllocationStats::default();
        stats.record_allocation(100);
        stats.record_allocation(50);
        stats.record_deallocation(100);
        assert_eq!(stats.current_usage, 50);
        assert_eq!(stats.peak_usage, 150);
        assert_eq!(stats.total_deallocations, 1);
    }

    #[test]
    fn test_resident_pools() {
        assert!(PoolType::NonPaged.is_resident());
        assert!(PoolType::LargePage.is_resident());
        assert!(!PoolType::Paged.is_resident());
    }
}
