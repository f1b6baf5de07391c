use std::alloc::{self, Layout};
use std::mem;
use std::ops::{Deref, DerefMut};
use std::{ptr, slice};

use crate::cache::CacheMaintenance;
use crate::pool::Pool;

/// A physically contiguous block reserved for one device at boot, mapped at
/// `virt` and seen by the device at `phys`.
pub struct MemoryBlock {
    virt: *mut u8,
    phys: usize,
    size: usize,
    host: Option<Layout>,
}

unsafe impl Send for MemoryBlock {}

impl MemoryBlock {
    /// # Safety
    /// `virt` must map `size` bytes of memory the device sees at `phys`, and
    /// nothing else may use that range while the block is alive.
    pub unsafe fn from_raw_parts(virt: *mut u8, phys: usize, size: usize) -> Self {
        Self {
            virt,
            phys,
            size,
            host: None,
        }
    }

    /// Zeroed heap memory whose physical address is its virtual address. Used
    /// where the device sees host memory one-to-one, and in tests.
    pub fn identity(size: usize, align: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, align).ok()?;
        if layout.size() == 0 {
            return None;
        }
        let virt = unsafe { alloc::alloc_zeroed(layout) };
        if virt.is_null() {
            return None;
        }
        Some(Self {
            virt,
            phys: virt as usize,
            size,
            host: Some(layout),
        })
    }

    pub fn physical(&self) -> usize {
        self.phys
    }
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(layout) = self.host {
            unsafe { alloc::dealloc(self.virt, layout) };
        }
    }
}

/// Carves a [`MemoryBlock`] front to back. Nothing is ever freed.
pub struct BumpAllocator {
    block: MemoryBlock,
    offset: usize,
}

impl BumpAllocator {
    pub fn new(block: MemoryBlock) -> Self {
        Self { block, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.block.size - self.offset
    }

    /// Move the cursor up to the next `align` boundary of the physical address.
    pub fn align_to(&mut self, align: usize) {
        let phys = self.block.phys + self.offset;
        let aligned = (phys + align - 1) & !(align - 1);
        self.offset = (aligned - self.block.phys).min(self.block.size);
    }

    /// Zeroed region of `size` bytes at a physical `align` boundary.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<(*mut u8, usize)> {
        assert!(align.is_power_of_two());
        self.align_to(align);
        if size > self.remaining() {
            return None;
        }
        let virt = unsafe { self.block.virt.add(self.offset) };
        let phys = self.block.phys + self.offset;
        self.offset += size;
        unsafe { ptr::write_bytes(virt, 0, size) };
        Some((virt, phys))
    }

    /// # Safety
    /// `T` must be valid as zeroed.
    pub unsafe fn alloc_zeroed<T>(&mut self, align: usize) -> Option<Dma<T>> {
        let align = align.max(mem::align_of::<T>());
        let (virt, phys) = self.alloc(mem::size_of::<T>(), align)?;
        Some(Dma {
            virt: virt as *mut T,
            phys,
        })
    }

    /// # Safety
    /// `T` must be valid as zeroed.
    pub unsafe fn alloc_slice<T>(&mut self, count: usize, align: usize) -> Option<Dma<[T]>> {
        let align = align.max(mem::align_of::<T>());
        let (virt, phys) = self.alloc(mem::size_of::<T>() * count, align)?;
        Some(Dma {
            virt: slice::from_raw_parts_mut(virt as *mut T, count) as *mut [T],
            phys,
        })
    }
}

/// A typed view of DMA memory carved by a [`BumpAllocator`].
///
/// The handle does not own its memory: the allocator's block must outlive it.
pub struct Dma<T: ?Sized> {
    virt: *mut T,
    phys: usize,
}

unsafe impl<T: ?Sized + Send> Send for Dma<T> {}
unsafe impl<T: ?Sized + Sync> Sync for Dma<T> {}

impl<T: ?Sized> Dma<T> {
    pub fn physical(&self) -> usize {
        self.phys
    }
    pub fn size(&self) -> usize {
        mem::size_of_val(&**self)
    }
    fn virt_addr(&self) -> usize {
        self.virt as *mut u8 as usize
    }

    /// Hand the whole object to the device.
    pub fn publish(&self, cache: &dyn CacheMaintenance) {
        cache.clean(self.virt_addr(), self.size());
    }
    /// Make whatever the device wrote visible to the CPU.
    pub fn refresh(&self, cache: &dyn CacheMaintenance) {
        cache.invalidate(self.virt_addr(), self.size());
    }
}

impl<T> Dma<[T]> {
    pub fn physical_of(&self, index: usize) -> usize {
        self.phys + index * mem::size_of::<T>()
    }
    pub fn publish_range(&self, cache: &dyn CacheMaintenance, index: usize, count: usize) {
        cache.clean(
            self.virt_addr() + index * mem::size_of::<T>(),
            count * mem::size_of::<T>(),
        );
    }
    pub fn refresh_range(&self, cache: &dyn CacheMaintenance, index: usize, count: usize) {
        cache.invalidate(
            self.virt_addr() + index * mem::size_of::<T>(),
            count * mem::size_of::<T>(),
        );
    }
}

impl<T: ?Sized> Deref for Dma<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.virt }
    }
}

impl<T: ?Sized> DerefMut for Dma<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.virt }
    }
}

/// Handle of one buffer in a [`DmaPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

/// Equal-sized DMA buffers handed out and returned one at a time.
pub struct DmaPool {
    region: Dma<[u8]>,
    buffer_size: usize,
    used: Pool<()>,
}

impl DmaPool {
    pub fn new(allocator: &mut BumpAllocator, count: usize, buffer_size: usize, align: usize) -> Option<Self> {
        let buffer_size = (buffer_size + align - 1) & !(align - 1);
        let region = unsafe { allocator.alloc_slice::<u8>(count * buffer_size, align)? };
        Some(Self {
            region,
            buffer_size,
            used: Pool::with_capacity(count),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
    pub fn in_use(&self) -> usize {
        self.used.len()
    }
    pub fn is_allocated(&self, id: BufferId) -> bool {
        self.used.contains(id.0)
    }

    pub fn alloc(&mut self) -> Option<BufferId> {
        self.used.alloc(()).map(BufferId)
    }

    pub fn release(&mut self, id: BufferId) {
        self.used.release(id.0);
    }

    pub fn physical(&self, id: BufferId) -> usize {
        self.region.physical_of(id.0 * self.buffer_size)
    }

    /// Copy `data` into the buffer and clean it for the device.
    pub fn fill(&mut self, id: BufferId, data: &[u8], cache: &dyn CacheMaintenance) {
        assert!(data.len() <= self.buffer_size);
        let start = id.0 * self.buffer_size;
        self.region[start..start + data.len()].copy_from_slice(data);
        self.region.publish_range(cache, start, self.buffer_size);
    }

    /// Drop any lines of the buffer so a later read sees the device's writes.
    pub fn prepare_read(&self, id: BufferId, cache: &dyn CacheMaintenance) {
        let start = id.0 * self.buffer_size;
        self.region.refresh_range(cache, start, self.buffer_size);
    }

    /// Invalidate and copy out the first `len` bytes.
    pub fn read(&self, id: BufferId, len: usize, cache: &dyn CacheMaintenance) -> Vec<u8> {
        let start = id.0 * self.buffer_size;
        let len = len.min(self.buffer_size);
        self.region.refresh_range(cache, start, self.buffer_size);
        self.region[start..start + len].to_vec()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::Coherent;

    #[test]
    fn bump_alignment() {
        let block = MemoryBlock::identity(0x4000, 0x1000).unwrap();
        let base = block.physical();
        let mut bump = BumpAllocator::new(block);

        let (_, a) = bump.alloc(10, 1).unwrap();
        assert_eq!(a, base);
        let (_, b) = bump.alloc(64, 64).unwrap();
        assert_eq!(b, base + 64);
        bump.align_to(0x1000);
        let (_, c) = bump.alloc(16, 16).unwrap();
        assert_eq!(c, base + 0x1000);
        assert!(bump.alloc(0x4000, 1).is_none());
        assert_eq!(bump.remaining(), 0x4000 - 0x1010);
    }

    #[test]
    fn pool_buffers_are_disjoint() {
        let block = MemoryBlock::identity(0x2000, 0x1000).unwrap();
        let mut bump = BumpAllocator::new(block);
        let mut pool = DmaPool::new(&mut bump, 2, 512, 64).unwrap();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.physical(b) - pool.physical(a), 512);

        pool.fill(a, &[1, 2, 3], &Coherent);
        assert_eq!(pool.read(a, 3, &Coherent), vec![1, 2, 3]);
        assert_eq!(pool.read(b, 3, &Coherent), vec![0, 0, 0]);

        pool.release(a);
        assert!(!pool.is_allocated(a));
        assert_eq!(pool.in_use(), 1);
    }
}
