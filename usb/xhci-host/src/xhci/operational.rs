use common::io::{Io, Mmio};

/// Operational registers, at `base + CAPLENGTH`. See XHCI Section 5.4.
#[repr(C)]
pub struct OperationalRegs {
    pub usb_cmd: Mmio<u32>,
    pub usb_sts: Mmio<u32>,
    pub page_size: Mmio<u32>,
    _rsvd: [Mmio<u32>; 2],
    pub dn_ctrl: Mmio<u32>,
    pub crcr: Mmio<u64>,
    _rsvd2: [Mmio<u32>; 4],
    pub dcbaap: Mmio<u64>,
    pub config: Mmio<u32>,
}

pub const USB_CMD_RS: u32 = 1 << 0;
pub const USB_CMD_HCRST: u32 = 1 << 1;
pub const USB_CMD_INTE: u32 = 1 << 2;
pub const USB_CMD_HSEE: u32 = 1 << 3;

pub const USB_STS_HCH: u32 = 1 << 0;
pub const USB_STS_HSE: u32 = 1 << 2;
pub const USB_STS_EINT: u32 = 1 << 3;
pub const USB_STS_PCD: u32 = 1 << 4;
pub const USB_STS_CNR: u32 = 1 << 11;
pub const USB_STS_HCE: u32 = 1 << 12;

/// Write-1-to-clear status bits.
pub const USB_STS_W1C: u32 = USB_STS_HSE | USB_STS_EINT | USB_STS_PCD | (1 << 10);

pub const CRCR_RCS: u64 = 1 << 0;
pub const CRCR_CS: u64 = 1 << 1;
pub const CRCR_CA: u64 = 1 << 2;
pub const CRCR_CRR: u64 = 1 << 3;

pub const OP_CONFIG_MAX_SLOTS_EN_MASK: u32 = 0xFF;
pub const OP_CONFIG_CIE_BIT: u32 = 1 << 9;

/// Enable every device notification type.
pub const DN_CTRL_ALL: u32 = 0xFFFF;

impl OperationalRegs {
    pub fn halted(&self) -> bool {
        self.usb_sts.readf(USB_STS_HCH)
    }

    pub fn not_ready(&self) -> bool {
        self.usb_sts.readf(USB_STS_CNR)
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        ((self.page_size.read() & 0xFFFF) as usize) << 12
    }

    pub fn set_max_slots_enabled(&mut self, slots: u8) {
        let config = self.config.read() & !OP_CONFIG_MAX_SLOTS_EN_MASK;
        self.config.write(config | u32::from(slots));
    }

    /// Acknowledge the given status bits, leaving the others untouched.
    pub fn ack_status(&mut self, bits: u32) {
        self.usb_sts.write(bits & USB_STS_W1C);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(std::mem::size_of::<OperationalRegs>(), 0x40);
    }
}
