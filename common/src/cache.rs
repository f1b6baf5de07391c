//! Data cache maintenance for memory shared with a non-coherent DMA master.
//!
//! Clean before the device reads, invalidate before the CPU reads.

/// Granule of every maintenance operation.
pub const CACHE_LINE: usize = 64;

pub trait CacheMaintenance: Send + Sync {
    /// Write dirty lines covering `[addr, addr + len)` back to memory.
    fn clean(&self, addr: usize, len: usize);
    /// Discard lines covering `[addr, addr + len)` so the next read hits memory.
    fn invalidate(&self, addr: usize, len: usize);
    /// Write back, then discard.
    fn clean_invalidate(&self, addr: usize, len: usize);

    fn clean_line(&self, addr: usize) {
        self.clean(addr, 1);
    }
    fn invalidate_line(&self, addr: usize) {
        self.invalidate(addr, 1);
    }
}

/// Start addresses of every cache line overlapping `[addr, addr + len)`.
pub fn lines(addr: usize, len: usize) -> impl Iterator<Item = usize> {
    let start = addr & !(CACHE_LINE - 1);
    let end = if len == 0 { start } else { addr + len };
    (start..end).step_by(CACHE_LINE)
}

/// For interconnects that snoop the CPU caches, and for host-side tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct Coherent;

impl CacheMaintenance for Coherent {
    fn clean(&self, _addr: usize, _len: usize) {}
    fn invalidate(&self, _addr: usize, _len: usize) {}
    fn clean_invalidate(&self, _addr: usize, _len: usize) {}
}

/// Maintenance by virtual address to the point of coherency.
#[cfg(target_arch = "aarch64")]
#[derive(Clone, Copy, Debug, Default)]
pub struct DataCache;

#[cfg(target_arch = "aarch64")]
impl CacheMaintenance for DataCache {
    fn clean(&self, addr: usize, len: usize) {
        for line in lines(addr, len) {
            unsafe { core::arch::asm!("dc cvac, {}", in(reg) line) };
        }
        unsafe { core::arch::asm!("dsb sy") };
    }

    fn invalidate(&self, addr: usize, len: usize) {
        for line in lines(addr, len) {
            unsafe { core::arch::asm!("dc ivac, {}", in(reg) line) };
        }
        unsafe { core::arch::asm!("dsb sy") };
    }

    fn clean_invalidate(&self, addr: usize, len: usize) {
        for line in lines(addr, len) {
            unsafe { core::arch::asm!("dc civac, {}", in(reg) line) };
        }
        unsafe { core::arch::asm!("dsb sy") };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn line_cover() {
        assert_eq!(lines(0x1000, 64).collect::<Vec<_>>(), vec![0x1000]);
        assert_eq!(lines(0x1030, 32).collect::<Vec<_>>(), vec![0x1000, 0x1040]);
        assert_eq!(lines(0x1010, 1).collect::<Vec<_>>(), vec![0x1000]);
        assert_eq!(lines(0x1000, 0).count(), 0);
    }
}
