use std::time::Duration;

use lazy_static::lazy_static;
use serde::Deserialize;
use smallvec::SmallVec;

use common::timeout::Timeout;

use crate::error::Result;

lazy_static! {
    static ref DEFAULT_CONFIG: ControllerConfig = toml::from_slice(include_bytes!("../config.toml"))
        .expect("Failed to parse internally embedded config file");
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub controller: ControllerSection,
    pub timing: TimingSection,
    pub drivers: SmallVec<[DriverConfig; 4]>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    /// Upper bound on enabled device slots; clamped to what the hardware offers.
    pub max_slots: u8,
    pub new_device_queue: usize,
    pub command_ring_trbs: usize,
    pub event_ring_segments: usize,
    pub event_ring_trbs: usize,
    pub transfer_ring_trbs: usize,
    pub dma_buffers: usize,
    pub dma_buffer_size: usize,
    pub transactions: usize,
    pub pipes: usize,
    /// The root port wired to the USB2 PHY; every other root port is SuperSpeed.
    pub usb2_root_port: u8,
    /// Reset the USB2 root port again before the second AddressDevice.
    pub usb2_port_reset_on_readdress: bool,
    pub expected_operational_offset: Option<usize>,
    pub expected_doorbell_offset: Option<usize>,
    pub expected_runtime_offset: Option<usize>,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            max_slots: 64,
            new_device_queue: 16,
            command_ring_trbs: 4096,
            event_ring_segments: 1,
            event_ring_trbs: 256,
            transfer_ring_trbs: 256,
            dma_buffers: 64,
            dma_buffer_size: 512,
            transactions: 32,
            pipes: 64,
            usb2_root_port: 1,
            usb2_port_reset_on_readdress: false,
            expected_operational_offset: None,
            expected_doorbell_offset: None,
            expected_runtime_offset: None,
        }
    }
}

/// A polling budget: `polls` checks, `interval_us` apart.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct PollConfig {
    pub polls: u32,
    pub interval_us: u64,
}

impl PollConfig {
    pub const fn new(polls: u32, interval_us: u64) -> Self {
        Self { polls, interval_us }
    }

    pub fn timeout(&self) -> Timeout {
        Timeout::from_micros(self.polls, self.interval_us)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub core_reset: PollConfig,
    pub controller_reset: PollConfig,
    pub legacy_handoff: PollConfig,
    pub run: PollConfig,
    pub usb2_port_reset: PollConfig,
    pub usb3_port_reset: PollConfig,
    pub phy_settle_ms: u64,
    pub start_settle_ms: u64,
}

impl TimingSection {
    pub fn phy_settle(&self) -> Duration {
        Duration::from_millis(self.phy_settle_ms)
    }
    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            core_reset: PollConfig::new(2000, 50),
            controller_reset: PollConfig::new(2000, 50),
            legacy_handoff: PollConfig::new(2000, 1000),
            run: PollConfig::new(2000, 1000),
            usb2_port_reset: PollConfig::new(2000, 1000),
            usb3_port_reset: PollConfig::new(200, 10_000),
            phy_settle_ms: 5,
            start_settle_ms: 100,
        }
    }
}

/// Binds a class driver, registered under `name`, to a device class.
#[derive(Clone, Debug, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    pub class: u8,
    #[serde(default = "any_subclass")]
    pub subclass: i16, // The subclass may be meaningless for some drivers, hence negative values (and values above 255) mean "undefined".
}

fn any_subclass() -> i16 {
    -1
}

impl DriverConfig {
    pub fn subclass(&self) -> Option<u8> {
        if self.subclass >= 0 && self.subclass <= 255 {
            Some(self.subclass as u8)
        } else {
            None
        }
    }

    pub fn matches(&self, class: u8, subclass: u8) -> bool {
        self.class == class && self.subclass().map_or(true, |s| s == subclass)
    }
}

impl ControllerConfig {
    /// The configuration shipped with the crate.
    pub fn embedded() -> Self {
        DEFAULT_CONFIG.clone()
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn embedded_defaults() {
        let config = ControllerConfig::embedded();
        assert_eq!(config.controller.new_device_queue, 16);
        assert_eq!(config.controller.command_ring_trbs, 4096);
        assert_eq!(config.controller.expected_doorbell_offset, Some(0x480));
        assert_eq!(config.timing.usb3_port_reset.polls, 200);
        assert_eq!(config.drivers.len(), 2);
        assert!(config.drivers[0].matches(9, 0));
    }

    #[test]
    fn partial_override() {
        let config = ControllerConfig::from_toml(
            "[controller]\nmax_slots = 8\n[timing]\nstart_settle_ms = 0\n",
        )
        .unwrap();
        assert_eq!(config.controller.max_slots, 8);
        assert_eq!(config.controller.dma_buffer_size, 512);
        assert_eq!(config.timing.start_settle_ms, 0);
        assert_eq!(config.timing.core_reset.polls, 2000);
        assert!(config.drivers.is_empty());
    }

    #[test]
    fn subclass_matching() {
        let driver = DriverConfig {
            name: "storage".into(),
            class: 8,
            subclass: 6,
        };
        assert!(driver.matches(8, 6));
        assert!(!driver.matches(8, 1));
        assert!(!driver.matches(3, 6));
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(ControllerConfig::from_toml("[controller]\nmax_slots = \"many\"\n").is_err());
    }
}
