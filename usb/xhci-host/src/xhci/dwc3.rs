//! Synopsys DWC3 global registers wrapped around the xHCI core.
//!
//! They sit at `0xC100` from the xHCI base and control the core reset, the
//! PHYs, and whether the port runs as host or device.

use std::thread;
use std::time::Duration;

use common::io::{Io, Mmio};
use log::{debug, info, warn};

use crate::config::{PollConfig, TimingSection};
use crate::error::{Error, Result};

pub const GLOBALS_REGS_START: usize = 0xC100;

#[repr(C)]
pub struct GlobalRegs {
    pub gsbuscfg0: Mmio<u32>,
    pub gsbuscfg1: Mmio<u32>,
    pub gtxthrcfg: Mmio<u32>,
    pub grxthrcfg: Mmio<u32>,
    pub gctl: Mmio<u32>,
    pub gevten: Mmio<u32>,
    pub gsts: Mmio<u32>,
    pub guctl1: Mmio<u32>,
    pub gsnpsid: Mmio<u32>,
    pub ggpio: Mmio<u32>,
    pub guid: Mmio<u32>,
    pub guctl: Mmio<u32>,
    pub gbuserraddr0: Mmio<u32>,
    pub gbuserraddr1: Mmio<u32>,
    pub gprtbimap0: Mmio<u32>,
    pub gprtbimap1: Mmio<u32>,
    pub ghwparams: [Mmio<u32>; 8],
    _rsvd0: [Mmio<u32>; 40],
    pub gusb2phycfg: Mmio<u32>,
    _rsvd1: [Mmio<u32>; 47],
    pub gusb3pipectl: Mmio<u32>,
    _rsvd2: [Mmio<u32>; 271],
    pub dcfg: Mmio<u32>,
    pub dctl: Mmio<u32>,
}

pub const GSBUSCFG0_REQINFO_MASK: u32 = 0xFFFF_0000;
/// DATRDREQINFO, DESRDREQINFO, DATWRREQINFO and DESWRREQINFO all set to 0xF.
pub const GSBUSCFG0_REQINFO_ALL: u32 = 0xFFFF_0000;

pub const GCTL_DSBLCLKGTNG: u32 = 1 << 0;
pub const GCTL_GBLHIBERNATIONEN: u32 = 1 << 1;
pub const GCTL_DISSCRAMBLE: u32 = 1 << 3;
pub const GCTL_SCALEDOWN_MASK: u32 = 3 << 4;
pub const GCTL_CORESOFTRESET: u32 = 1 << 11;
pub const GCTL_PRTCAPDIR_MASK: u32 = 3 << 12;
pub const GCTL_PRTCAPDIR_HOST: u32 = 1 << 12;

pub const GUCTL_USBHSTINAUTORETRYEN: u32 = 1 << 14;
pub const GUCTL1_DEV_L1_EXIT_BY_HW: u32 = 1 << 24;

pub const GHWPARAMS1_EN_PWROPT_SHIFT: u8 = 24;
pub const GHWPARAMS1_EN_PWROPT_MASK: u32 = 3 << GHWPARAMS1_EN_PWROPT_SHIFT;

pub const GUSB2PHYCFG_SUSPHY: u32 = 1 << 6;
pub const GUSB2PHYCFG_PHYSOFTRST: u32 = 1 << 31;

pub const GUSB3PIPECTL_SUSPHY: u32 = 1 << 17;
pub const GUSB3PIPECTL_UX_EXIT_PX: u32 = 1 << 27;
pub const GUSB3PIPECTL_U2SSINACTP3OK: u32 = 1 << 29;
pub const GUSB3PIPECTL_PHYSOFTRST: u32 = 1 << 31;

pub const DCTL_CSFTRST: u32 = 1 << 30;
pub const DCTL_RUN_STOP: u32 = 1 << 31;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CoreRevision {
    Dwc3(u16),
    Dwc31(u16),
    Dwc32(u16),
}

impl CoreRevision {
    pub fn from_gsnpsid(id: u32) -> Result<Self> {
        let revision = id as u16;
        match id >> 16 {
            0x5533 => Ok(CoreRevision::Dwc3(revision)),
            0x3331 => Ok(CoreRevision::Dwc31(revision)),
            0x3332 => Ok(CoreRevision::Dwc32(revision)),
            _ => Err(Error::UnknownCore(id)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerOption {
    None,
    ClockGating,
    Hibernation,
}

impl GlobalRegs {
    pub fn revision(&self) -> Result<CoreRevision> {
        CoreRevision::from_gsnpsid(self.gsnpsid.read())
    }

    pub fn power_option(&self) -> PowerOption {
        match (self.ghwparams[1].read() & GHWPARAMS1_EN_PWROPT_MASK) >> GHWPARAMS1_EN_PWROPT_SHIFT
        {
            1 => PowerOption::ClockGating,
            2 => PowerOption::Hibernation,
            _ => PowerOption::None,
        }
    }

    /// Device-side soft reset, which resets the whole core.
    pub fn core_soft_reset(&mut self, poll: &PollConfig) -> Result<()> {
        self.dctl.writef(DCTL_CSFTRST, true);
        let timeout = poll.timeout();
        while self.dctl.readf(DCTL_CSFTRST) {
            timeout.run().map_err(|()| {
                log::error!("timeout on DCTL_CSFTRST");
                Error::Timeout("DWC3 core soft reset")
            })?;
        }
        Ok(())
    }

    /// Clock and link tuning applied after every core reset.
    pub fn tune(&mut self) {
        self.guctl1.writef(GUCTL1_DEV_L1_EXIT_BY_HW, false);
        self.guctl.writef(GUCTL_USBHSTINAUTORETRYEN, true);

        let mut gctl = self.gctl.read() & !(GCTL_SCALEDOWN_MASK | GCTL_DISSCRAMBLE);
        match self.power_option() {
            PowerOption::None | PowerOption::ClockGating => gctl |= GCTL_DSBLCLKGTNG,
            PowerOption::Hibernation => gctl &= !GCTL_GBLHIBERNATIONEN,
        }
        self.gctl.write(gctl);
    }

    /// Reset both PHYs with the core held in reset.
    pub fn phy_reset(&mut self, settle: Duration) {
        self.gctl.writef(GCTL_CORESOFTRESET, true);
        self.gctl.write(0);

        let mut pipe = self.gusb3pipectl.read();
        pipe &= !(GUSB3PIPECTL_UX_EXIT_PX | GUSB3PIPECTL_SUSPHY);
        pipe |= GUSB3PIPECTL_U2SSINACTP3OK;
        self.gusb3pipectl.write(pipe);
        self.gusb2phycfg.writef(GUSB2PHYCFG_SUSPHY, false);

        self.gusb3pipectl.writef(GUSB3PIPECTL_PHYSOFTRST, true);
        self.gusb2phycfg.writef(GUSB2PHYCFG_PHYSOFTRST, true);
        thread::sleep(settle);
        self.gusb3pipectl.writef(GUSB3PIPECTL_PHYSOFTRST, false);
        self.gusb2phycfg.writef(GUSB2PHYCFG_PHYSOFTRST, false);
        thread::sleep(settle);

        self.gctl.writef(GCTL_CORESOFTRESET, false);
    }

    pub fn set_host_mode(&mut self) {
        let gctl = self.gctl.read() & !GCTL_PRTCAPDIR_MASK;
        self.gctl.write(gctl | GCTL_PRTCAPDIR_HOST);
    }

    pub fn set_burst_request_info(&mut self) {
        let cfg = self.gsbuscfg0.read() & !GSBUSCFG0_REQINFO_MASK;
        self.gsbuscfg0.write(cfg | GSBUSCFG0_REQINFO_ALL);
    }

    /// The DWC3 half of the controller reset: core reset, revision check and
    /// tuning. PHY reset follows the xHCI reset.
    pub fn reset(&mut self, timing: &TimingSection) -> Result<CoreRevision> {
        self.core_soft_reset(&timing.core_reset)?;
        let revision = self.revision()?;
        info!("DWC3 core {:?}, power option {:?}", revision, self.power_option());
        self.tune();
        debug!("GCTL {:#010x} GUCTL {:#010x}", self.gctl.read(), self.guctl.read());
        if self.dctl.readf(DCTL_RUN_STOP) {
            warn!("DWC3 device controller left running, stopping it");
            self.dctl.writef(DCTL_RUN_STOP, false);
        }
        Ok(revision)
    }
}
