//! Register access.
//!
//! Register blocks are `#[repr(C)]` structs of [`Mmio`] cells laid over the
//! device's window. Registers the hardware only lets us read or only lets us
//! write are wrapped in [`ReadOnly`] and [`WriteOnly`], which hide the other
//! half of [`Io`].

use core::ops::{BitAnd, BitOr, Not};

mod mmio;

pub use mmio::*;

/// A readable and writable register of some unsigned width.
pub trait Io {
    type Value: Copy
        + PartialEq
        + BitAnd<Output = Self::Value>
        + BitOr<Output = Self::Value>
        + Not<Output = Self::Value>;

    fn read(&self) -> Self::Value;
    fn write(&mut self, value: Self::Value);

    /// Whether every bit of `flags` is set.
    #[inline(always)]
    fn readf(&self, flags: Self::Value) -> bool {
        self.read() & flags == flags
    }

    /// Read-modify-write setting or clearing `flags`.
    #[inline(always)]
    fn writef(&mut self, flags: Self::Value, value: bool) {
        let current = self.read();
        self.write(if value {
            current | flags
        } else {
            current & !flags
        });
    }
}

#[repr(transparent)]
pub struct ReadOnly<I> {
    inner: I,
}

impl<I: Io> ReadOnly<I> {
    pub const fn new(inner: I) -> Self {
        Self { inner }
    }

    #[inline(always)]
    pub fn read(&self) -> I::Value {
        self.inner.read()
    }

    #[inline(always)]
    pub fn readf(&self, flags: I::Value) -> bool {
        self.inner.readf(flags)
    }
}

/// A register whose reads are undefined or have side effects, such as a
/// doorbell. Only whole values can be written.
#[repr(transparent)]
pub struct WriteOnly<I> {
    inner: I,
}

impl<I: Io> WriteOnly<I> {
    pub const fn new(inner: I) -> Self {
        Self { inner }
    }

    #[inline(always)]
    pub fn write(&mut self, value: I::Value) {
        self.inner.write(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wrappers_forward() {
        let reg = ReadOnly::new(Mmio::new(0b1010u16));
        assert!(reg.readf(0b1000));
        assert!(!reg.readf(0b1001));
        assert_eq!(reg.read(), 0b1010);

        let mut reg = WriteOnly::new(Mmio::new(0u32));
        reg.write(7);
        assert_eq!(reg.inner.read(), 7);
    }
}
