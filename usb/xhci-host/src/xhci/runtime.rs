use common::io::{Io, Mmio};

/// One interrupter register set. See XHCI Section 5.5.2.
#[repr(C)]
pub struct Interrupter {
    pub iman: Mmio<u32>,
    pub imod: Mmio<u32>,
    pub erstsz: Mmio<u32>,
    _rsvd: Mmio<u32>,
    pub erstba: Mmio<u64>,
    pub erdp: Mmio<u64>,
}

pub const IMAN_IP: u32 = 1 << 0;
pub const IMAN_IE: u32 = 1 << 1;

/// Event Handler Busy, write 1 to clear.
pub const ERDP_EHB: u64 = 1 << 3;

impl Interrupter {
    /// Clear a pending interrupt while keeping it enabled.
    pub fn ack(&mut self) {
        let iman = self.iman.read();
        self.iman.write(iman | IMAN_IP);
    }
}

/// Only the primary interrupter is mapped.
#[repr(C)]
pub struct RuntimeRegs {
    pub mfindex: Mmio<u32>,
    _rsvd: [Mmio<u32>; 7],
    pub ints: [Interrupter; 1],
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(std::mem::size_of::<Interrupter>(), 32);
        assert_eq!(std::mem::size_of::<RuntimeRegs>(), 0x40);
    }
}
