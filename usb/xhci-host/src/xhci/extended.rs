use std::ptr::NonNull;

use common::io::{Io, Mmio};

/// Walks the xHCI extended capability list. Each item is the capability's
/// first dword and its id.
pub struct ExtendedCapabilitiesIter {
    base: *const u8,
}

impl ExtendedCapabilitiesIter {
    /// # Safety
    /// `base` must be null or point at a mapped extended capability list.
    pub unsafe fn new(base: *const u8) -> Self {
        Self { base }
    }
}

impl Iterator for ExtendedCapabilitiesIter {
    type Item = (NonNull<Mmio<u32>>, u8);

    fn next(&mut self) -> Option<Self::Item> {
        let current = NonNull::new(self.base as *mut Mmio<u32>)?;
        let reg = unsafe { current.as_ref() }.read();
        let capability_id = (reg & 0xFF) as u8;
        let next_rel = (((reg & 0xFF00) >> 8) as usize) << 2;

        self.base = if next_rel != 0 {
            unsafe { self.base.add(next_rel) }
        } else {
            std::ptr::null()
        };

        Some((current, capability_id))
    }
}

#[repr(u8)]
pub enum CapabilityId {
    // bit 0 is reserved
    UsbLegacySupport = 1,
    SupportedProtocol,
    ExtendedPowerManagement,
    IoVirtualization,
    MessageInterrupt,
    LocalMem,
    UsbDebugCapability = 10,
    ExtendedMessageInterrupt = 17,
}

/// USBLEGSUP, the BIOS/OS ownership handshake. See XHCI Section 7.1.1.
#[repr(C)]
pub struct LegacySupport {
    pub usblegsup: Mmio<u32>,
    pub usblegctlsts: Mmio<u32>,
}

pub const USBLEGSUP_BIOS_OWNED: u32 = 1 << 16;
pub const USBLEGSUP_OS_OWNED: u32 = 1 << 24;

impl LegacySupport {
    pub fn request_ownership(&mut self) {
        self.usblegsup.writef(USBLEGSUP_OS_OWNED, true);
    }

    pub fn os_owned(&self) -> bool {
        let value = self.usblegsup.read();
        value & USBLEGSUP_OS_OWNED != 0 && value & USBLEGSUP_BIOS_OWNED == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn walks_until_zero_next() {
        // id 2, then id 1 two dwords later, then id 10 three dwords after that
        let mut caps: [u32; 6] = [0x0000_0202, 0, 0x0000_0301, 0, 0, 0x0000_000A];
        let ids: Vec<u8> = unsafe { ExtendedCapabilitiesIter::new(caps.as_mut_ptr() as *const u8) }
            .map(|(_, id)| id)
            .collect();
        assert_eq!(ids, vec![2, 1, 10]);
    }
}
