use common::io::{Io, Mmio};

use crate::usb::Speed;

// RO - read-only
// ROS - read-only sticky
// RW - read/write
// RWS - read/write sticky
// RW1CS - read/write-1-to-clear sticky
// RW1S - read/write-1-to-set
// Sticky register values may preserve values through chip hardware reset

bitflags! {
    pub struct PortFlags: u32 {
        const CCS = 1 << 0; // ROS
        const PED = 1 << 1; // RW1CS
        const OCA = 1 << 3; // RO
        const PR =  1 << 4; // RW1S
        const PLS_0 = 1 << 5; // RWS
        const PLS_1 = 1 << 6; // RWS
        const PLS_2 = 1 << 7; // RWS
        const PLS_3 = 1 << 8; // RWS
        const PP =  1 << 9; // RWS
        const SPEED_0 =  1 << 10; // ROS
        const SPEED_1 =  1 << 11; // ROS
        const SPEED_2 =  1 << 12; // ROS
        const SPEED_3 =  1 << 13; // ROS
        const PIC_AMB = 1 << 14; // RWS
        const PIC_GRN = 1 << 15; // RWS
        const LWS = 1 << 16; // RW
        const CSC = 1 << 17; // RW1CS
        const PEC = 1 << 18; // RW1CS
        const WRC = 1 << 19; // RW1CS
        const OCC = 1 << 20; // RW1CS
        const PRC = 1 << 21; // RW1CS
        const PLC = 1 << 22; // RW1CS
        const CEC = 1 << 23; // RW1CS
        const CAS = 1 << 24; // RO
        const WCE = 1 << 25; // RWS
        const WDE = 1 << 26; // RWS
        const WOE = 1 << 27; // RWS
        const DR =  1 << 30; // RO
        const WPR = 1 << 31; // RW1S

        const CHANGE_BITS = Self::CSC.bits
            | Self::PEC.bits
            | Self::WRC.bits
            | Self::OCC.bits
            | Self::PRC.bits
            | Self::PLC.bits
            | Self::CEC.bits;
    }
}

/// Port register set, one per root hub port, at `operational + 0x400`.
#[repr(C)]
pub struct Port {
    // This has write one to clear fields, do not expose it, handle writes carefully!
    portsc: Mmio<u32>,
    pub portpmsc: Mmio<u32>,
    pub portli: Mmio<u32>,
    pub porthlpmc: Mmio<u32>,
}

impl Port {
    pub fn read(&self) -> u32 {
        self.portsc.read()
    }

    pub fn clear_prc(&mut self) {
        self.portsc
            .write((self.flags_preserved() | PortFlags::PRC).bits());
    }

    /// Acknowledge every pending change bit.
    pub fn clear_changes(&mut self) {
        let changes = self.flags() & PortFlags::CHANGE_BITS;
        self.portsc.write((self.flags_preserved() | changes).bits());
    }

    pub fn set_pr(&mut self) {
        self.portsc
            .write((self.flags_preserved() | PortFlags::PR).bits());
    }

    /// Port link state (PLS).
    pub fn state(&self) -> u8 {
        ((self.read() & (0b1111 << 5)) >> 5) as u8
    }

    pub fn speed(&self) -> Option<Speed> {
        Speed::from_psiv(((self.read() & (0b1111 << 10)) >> 10) as u8)
    }

    pub fn flags(&self) -> PortFlags {
        PortFlags::from_bits_truncate(self.read())
    }

    /// Connected, powered, not enabled and not resetting: a USB2 port that
    /// still needs a reset before the device can be addressed.
    pub fn needs_reset(&self) -> bool {
        let flags = self.flags();
        flags.contains(PortFlags::CCS)
            && !flags.contains(PortFlags::PED)
            && !flags.contains(PortFlags::PR)
            && self.state() != 0
    }

    // Read only preserved flags
    pub fn flags_preserved(&self) -> PortFlags {
        // RO(S) and RW(S) bits should be preserved
        // RW1S and RW1CS bits should not
        let preserved = PortFlags::CCS
            | PortFlags::OCA
            | PortFlags::PLS_0
            | PortFlags::PLS_1
            | PortFlags::PLS_2
            | PortFlags::PLS_3
            | PortFlags::PP
            | PortFlags::SPEED_0
            | PortFlags::SPEED_1
            | PortFlags::SPEED_2
            | PortFlags::SPEED_3
            | PortFlags::PIC_AMB
            | PortFlags::PIC_GRN
            | PortFlags::WCE
            | PortFlags::WDE
            | PortFlags::WOE
            | PortFlags::DR;

        self.flags() & preserved
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn port(portsc: u32) -> Port {
        Port {
            portsc: Mmio::new(portsc),
            portpmsc: Mmio::new(0),
            portli: Mmio::new(0),
            porthlpmc: Mmio::new(0),
        }
    }

    #[test]
    fn change_bits_are_written_back() {
        let mut p = port((PortFlags::CCS | PortFlags::PED | PortFlags::CSC | PortFlags::PP).bits());
        p.clear_changes();
        // PED is RW1CS and must never be written as 1
        assert_eq!(p.flags(), PortFlags::CCS | PortFlags::CSC | PortFlags::PP);
    }

    #[test]
    fn usb2_port_in_polling_needs_reset() {
        let p = port((PortFlags::CCS | PortFlags::PP).bits() | (7 << 5));
        assert!(p.needs_reset());
        let p = port((PortFlags::CCS | PortFlags::PP | PortFlags::PED).bits());
        assert!(!p.needs_reset());
    }

    #[test]
    fn speed_field() {
        let p = port(4 << 10);
        assert_eq!(p.speed(), Some(Speed::Super));
    }
}
