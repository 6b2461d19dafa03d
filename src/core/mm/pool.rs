//! Owned pool allocations
//!
//! RAII wrappers returning their memory to the allocator it came from.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use super::{AllocationError, AllocationRequest, PhysAddr, PhysicalMemory, PoolAllocator, PoolTag, PoolType};

/// Untyped pool memory, freed on drop
pub struct PoolBuffer<'a, A: PoolAllocator + ?Sized> {
    allocator: &'a A,
    ptr: NonNull<u8>,
    request: AllocationRequest,
    len: usize,
}

impl<'a, A: PoolAllocator + ?Sized> PoolBuffer<'a, A> {
    /// Take ownership of an allocation.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocator.allocate(&request)` and
    /// point to at least `len` initialized bytes.
    pub unsafe fn from_raw(allocator: &'a A, ptr: NonNull<u8>, request: AllocationRequest, len: usize) -> Self {
        Self {
            allocator,
            ptr,
            request,
            len,
        }
    }

    /// Start of the buffer
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Buffers are never empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pool the buffer was drawn from
    pub fn pool(&self) -> PoolType {
        self.request.pool
    }

    /// Tag the buffer was allocated with
    pub fn tag(&self) -> PoolTag {
        self.request.tag
    }
}

impl<A: PoolAllocator + ?Sized> Deref for PoolBuffer<'_, A> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: owned allocation of `len` initialized bytes.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<A: PoolAllocator + ?Sized> DerefMut for PoolBuffer<'_, A> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: owned allocation of `len` initialized bytes.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<A: PoolAllocator + ?Sized> Drop for PoolBuffer<'_, A> {
    fn drop(&mut self) {
        // SAFETY: the pointer came from this allocator with this request.
        unsafe { self.allocator.deallocate(self.ptr, &self.request) };
    }
}

/// A single value in non-paged pool, dropped and freed together
pub struct PoolBox<'a, T, A: PoolAllocator + ?Sized> {
    allocator: &'a A,
    ptr: NonNull<T>,
    request: AllocationRequest,
    _owns: PhantomData<T>,
}

impl<'a, T, A: PoolAllocator + ?Sized> PoolBox<'a, T, A> {
    /// Move `value` into non-paged pool
    pub fn new(allocator: &'a A, tag: PoolTag, value: T) -> Result<Self, AllocationError> {
        let request = AllocationRequest::new(PoolType::NonPaged, Layout::new::<T>(), tag);
        let ptr = allocator.allocate(&request)?.cast::<T>();
        // SAFETY: fresh allocation sized and aligned for `T`.
        unsafe { ptr.as_ptr().write(value) };

        Ok(Self {
            allocator,
            ptr,
            request,
            _owns: PhantomData,
        })
    }

    /// Stable address of the value
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T, A: PoolAllocator + ?Sized> Deref for PoolBox<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: initialized in `new`, live until drop.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, A: PoolAllocator + ?Sized> DerefMut for PoolBox<'_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: initialized in `new`, uniquely owned.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, A: PoolAllocator + ?Sized> Drop for PoolBox<'_, T, A> {
    fn drop(&mut self) {
        // SAFETY: the value is initialized and the pointer came from this allocator.
        unsafe {
            core::ptr::drop_in_place(self.ptr.as_ptr());
            self.allocator.deallocate(self.ptr.cast(), &self.request);
        }
    }
}

/// A fixed-length array in non-paged pool
pub struct PoolArray<'a, T, A: PoolAllocator + ?Sized> {
    allocator: &'a A,
    ptr: NonNull<T>,
    len: usize,
    request: AllocationRequest,
    _owns: PhantomData<T>,
}

impl<'a, T, A: PoolAllocator + ?Sized> PoolArray<'a, T, A> {
    /// Allocate `len` elements, building element `i` with `init(i)`
    pub fn from_fn<F>(allocator: &'a A, tag: PoolTag, len: usize, mut init: F) -> Result<Self, AllocationError>
    where
        F: FnMut(usize) -> T,
    {
        let layout = Layout::array::<T>(len).map_err(|_| AllocationError::InvalidSize)?;
        let request = AllocationRequest::new(PoolType::NonPaged, layout, tag);
        let ptr = allocator.allocate(&request)?.cast::<T>();

        for i in 0..len {
            // SAFETY: `i < len` lies inside the allocation.
            unsafe { ptr.as_ptr().add(i).write(init(i)) };
        }

        Ok(Self {
            allocator,
            ptr,
            len,
            request,
            _owns: PhantomData,
        })
    }

    /// Raw pointer to element `index`. Stable for the array's lifetime.
    pub fn element_ptr(&self, index: usize) -> Option<NonNull<T>> {
        if index < self.len {
            // SAFETY: in bounds of the allocation.
            Some(unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(index)) })
        } else {
            None
        }
    }
}

impl<T, A: PoolAllocator + ?Sized> Deref for PoolArray<'_, T, A> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `len` initialized elements.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T, A: PoolAllocator + ?Sized> DerefMut for PoolArray<'_, T, A> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: `len` initialized elements, uniquely owned.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T, A: PoolAllocator + ?Sized> Drop for PoolArray<'_, T, A> {
    fn drop(&mut self) {
        // SAFETY: all elements are initialized; the pointer came from this allocator.
        unsafe {
            core::ptr::drop_in_place(core::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len));
            self.allocator.deallocate(self.ptr.cast(), &self.request);
        }
    }
}

/// A mapped physical range, unmapped on drop
pub struct PhysicalMapping<'a, P: PhysicalMemory + ?Sized> {
    memory: &'a P,
    virt: NonNull<u8>,
    phys: PhysAddr,
    len: usize,
}

impl<'a, P: PhysicalMemory + ?Sized> PhysicalMapping<'a, P> {
    /// Take ownership of a mapping.
    ///
    /// # Safety
    /// `virt` must be a live mapping of `len` bytes at `phys` made by `memory`.
    pub unsafe fn from_raw(memory: &'a P, virt: NonNull<u8>, phys: PhysAddr, len: usize) -> Self {
        Self {
            memory,
            virt,
            phys,
            len,
        }
    }

    /// Virtual start of the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Physical start of the mapping
    pub fn physical_address(&self) -> PhysAddr {
        self.phys
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Mappings are never empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<P: PhysicalMemory + ?Sized> Drop for PhysicalMapping<'_, P> {
    fn drop(&mut self) {
        // SAFETY: owned live mapping.
        unsafe { self.memory.unmap_physical(self.virt, self.len) };
    }
}
