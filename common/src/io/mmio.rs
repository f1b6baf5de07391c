use core::mem::MaybeUninit;
use core::ops::{BitAnd, BitOr, Not};
use core::ptr;

use super::Io;

/// A memory-mapped register or a hardware-shared DMA word.
///
/// Every access is volatile, so the compiler never merges or elides reads of
/// a value the device may change behind our back.
#[repr(transparent)]
pub struct Mmio<T> {
    value: MaybeUninit<T>,
}

impl<T> Mmio<T> {
    /// Create a register cell holding `value`. Only meaningful for memory that
    /// is later handed to hardware, such as DMA structures built in place.
    pub const fn new(value: T) -> Self {
        Mmio {
            value: MaybeUninit::new(value),
        }
    }
}

impl<T> Io for Mmio<T>
where
    T: Copy + PartialEq + BitAnd<Output = T> + BitOr<Output = T> + Not<Output = T>,
{
    type Value = T;

    #[inline(always)]
    fn read(&self) -> T {
        unsafe { ptr::read_volatile(self.value.as_ptr()) }
    }

    #[inline(always)]
    fn write(&mut self, value: T) {
        unsafe { ptr::write_volatile(self.value.as_mut_ptr(), value) };
    }
}
