use common::io::{Mmio, ReadOnly};

/// Read-only capability registers at the base of the controller's MMIO window.
///
/// See XHCI Section 5.3, Table 5-9.
#[repr(C)]
pub struct CapabilityRegs {
    /// CAPLENGTH: offset of the operational registers from the base.
    pub len: ReadOnly<Mmio<u8>>,
    _rsvd: Mmio<u8>,
    /// HCIVERSION, binary-coded decimal.
    pub hci_ver: ReadOnly<Mmio<u16>>,
    /// HCSPARAMS1: device slots (7:0), interrupters (18:8), ports (31:24).
    pub hcs_params1: ReadOnly<Mmio<u32>>,
    /// HCSPARAMS2: IST (3:0), ERST Max (7:4), scratchpad count high (25:21),
    /// SPR (26), scratchpad count low (31:27).
    pub hcs_params2: ReadOnly<Mmio<u32>>,
    /// HCSPARAMS3: U1 and U2 device exit latencies.
    pub hcs_params3: ReadOnly<Mmio<u32>>,
    /// HCCPARAMS1: AC64 (0), CSZ (2), MaxPSASize (15:12), xECP (31:16).
    pub hcc_params1: ReadOnly<Mmio<u32>>,
    /// DBOFF: doorbell array offset, dword aligned.
    pub db_offset: ReadOnly<Mmio<u32>>,
    /// RTSOFF: runtime register offset, 32-byte aligned.
    pub rts_offset: ReadOnly<Mmio<u32>>,
    /// HCCPARAMS2.
    pub hcc_params2: ReadOnly<Mmio<u32>>,
}

pub const HCC_PARAMS1_AC64_BIT: u32 = 1 << 0;
pub const HCC_PARAMS1_CSZ_BIT: u32 = 1 << 2;
pub const HCC_PARAMS1_XECP_MASK: u32 = 0xFFFF_0000;
pub const HCC_PARAMS1_XECP_SHIFT: u8 = 16;

pub const HCS_PARAMS1_MAX_SLOTS_MASK: u32 = 0x0000_00FF;
pub const HCS_PARAMS1_MAX_INTRS_MASK: u32 = 0x0007_FF00;
pub const HCS_PARAMS1_MAX_INTRS_SHIFT: u8 = 8;
pub const HCS_PARAMS1_MAX_PORTS_MASK: u32 = 0xFF00_0000;
pub const HCS_PARAMS1_MAX_PORTS_SHIFT: u8 = 24;

pub const HCS_PARAMS2_ERST_MAX_MASK: u32 = 0x0000_00F0;
pub const HCS_PARAMS2_ERST_MAX_SHIFT: u8 = 4;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK: u32 = 0x03E0_0000;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT: u8 = 21;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK: u32 = 0xF800_0000;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT: u8 = 27;

pub const DB_OFFSET_MASK: u32 = !0x3;
pub const RTS_OFFSET_MASK: u32 = !0x1F;

impl CapabilityRegs {
    pub fn ac64(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_AC64_BIT)
    }

    /// 64-byte contexts when set.
    pub fn csz(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_CSZ_BIT)
    }

    pub fn max_slots(&self) -> u8 {
        (self.hcs_params1.read() & HCS_PARAMS1_MAX_SLOTS_MASK) as u8
    }

    pub fn max_interrupters(&self) -> u16 {
        ((self.hcs_params1.read() & HCS_PARAMS1_MAX_INTRS_MASK) >> HCS_PARAMS1_MAX_INTRS_SHIFT)
            as u16
    }

    pub fn max_ports(&self) -> u8 {
        ((self.hcs_params1.read() & HCS_PARAMS1_MAX_PORTS_MASK) >> HCS_PARAMS1_MAX_PORTS_SHIFT)
            as u8
    }

    /// Event ring segment table capacity, `2^ERST Max` entries.
    pub fn max_erst_entries(&self) -> u32 {
        let exp = (self.hcs_params2.read() & HCS_PARAMS2_ERST_MAX_MASK) >> HCS_PARAMS2_ERST_MAX_SHIFT;
        1 << exp
    }

    pub fn max_scratchpad_bufs(&self) -> u16 {
        let params = self.hcs_params2.read();
        let lo = (params & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT;
        let hi = (params & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT;
        (lo | (hi << 5)) as u16
    }

    /// Extended capability list offset from the base in bytes, 0 if absent.
    pub fn ext_caps_offset(&self) -> usize {
        (((self.hcc_params1.read() & HCC_PARAMS1_XECP_MASK) >> HCC_PARAMS1_XECP_SHIFT) as usize) << 2
    }

    pub fn doorbell_offset(&self) -> usize {
        (self.db_offset.read() & DB_OFFSET_MASK) as usize
    }

    pub fn runtime_offset(&self) -> usize {
        (self.rts_offset.read() & RTS_OFFSET_MASK) as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem;

    #[test]
    fn layout() {
        assert_eq!(mem::size_of::<CapabilityRegs>(), 0x20);
    }

    #[test]
    fn scratchpad_count_spans_two_fields() {
        let mut words = [0u32; 8];
        words[2] = (0x3 << 27) | (0x1 << 21) | (0x2 << 4);
        let regs = unsafe { &*(words.as_ptr() as *const CapabilityRegs) };
        assert_eq!(regs.max_scratchpad_bufs(), 0x23);
        assert_eq!(regs.max_erst_entries(), 4);
    }
}
