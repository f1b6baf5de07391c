use std::sync::Arc;

use smallvec::SmallVec;

use super::ring::Ring;
use crate::driver_interface::{ClassDriver, DeviceInfo, ParentPort, PipeId, PortId};
use crate::usb::{Configuration, DeviceDescriptor, EndpointDescriptor, EndpointTy, Speed};

/// Slot state as software tracks it, following the controller's slot
/// state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceState {
    Disabled,
    Default,
    Addressed,
    Configured,
}

/// Where the device is in its journey from connect to class driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// The slot is unused or sits in the free pool.
    Free,
    /// Holds the controller-wide addressing lock.
    Addressing,
    /// Past addressing; configuration and endpoints are being set up.
    Configuring,
    Ready,
    /// A Reset Device command is outstanding.
    Detaching,
}

pub const STRING_MANUFACTURER: usize = 0;
pub const STRING_PRODUCT: usize = 1;
pub const STRING_SERIAL: usize = 2;

/// An endpoint opened through a [`PipeId`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pipe {
    pub slot: u8,
    /// Device context index.
    pub endpoint: u8,
    pub ty: EndpointTy,
    pub input: bool,
}

pub struct DeviceSlot {
    pub id: u8,
    pub state: DeviceState,
    pub phase: Phase,
    pub port: PortId,
    pub parent: Option<ParentPort>,
    pub speed: Speed,
    pub packet_size: u16,
    pub block_set_address: bool,
    pub descriptor: Option<DeviceDescriptor>,
    pub strings: [Option<String>; 3],
    pub configuration: Option<Configuration>,
    pub hub_ports: Option<u8>,
    /// Endpoints of the last ConfigureEndpoint; pipes can be opened on these.
    pub endpoints: SmallVec<[EndpointDescriptor; 8]>,
    pub driver: Option<Arc<dyn ClassDriver>>,
    pub interface: Option<u8>,
    pub control_pipe: Option<PipeId>,
    pub pipes: SmallVec<[PipeId; 4]>,
    /// Transfer rings by device context index; 1 is the control endpoint.
    /// Rings are allocated on first use and kept across device lifetimes.
    pub rings: [Option<Ring>; 32],
}

impl DeviceSlot {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            state: DeviceState::Disabled,
            phase: Phase::Free,
            port: PortId::root(0),
            parent: None,
            speed: Speed::Super,
            packet_size: 0,
            block_set_address: false,
            descriptor: None,
            strings: Default::default(),
            configuration: None,
            hub_ports: None,
            endpoints: SmallVec::new(),
            driver: None,
            interface: None,
            control_pipe: None,
            pipes: SmallVec::new(),
            rings: Default::default(),
        }
    }

    /// Take the slot for a newly connected device. Software state of any
    /// previous device is dropped; rings are kept but emptied.
    pub fn assign(&mut self, port: PortId, parent: Option<ParentPort>, speed: Speed, block_set_address: bool) {
        self.phase = Phase::Addressing;
        self.port = port;
        self.parent = parent;
        self.speed = speed;
        self.packet_size = speed.default_control_packet_size();
        self.block_set_address = block_set_address;
        self.descriptor = None;
        self.strings = Default::default();
        self.configuration = None;
        self.hub_ports = None;
        self.endpoints.clear();
        self.driver = None;
        self.interface = None;
        self.control_pipe = None;
        self.pipes.clear();
        for ring in self.rings.iter_mut().flatten() {
            ring.reset();
        }
    }

    pub fn is_enumerating(&self) -> bool {
        matches!(self.phase, Phase::Addressing | Phase::Configuring)
    }

    pub fn in_use(&self) -> bool {
        !matches!(self.phase, Phase::Free)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            slot: self.id,
            port: self.port,
            parent: self.parent,
            speed: self.speed,
            descriptor: self.descriptor,
            manufacturer: self.strings[STRING_MANUFACTURER].clone(),
            product: self.strings[STRING_PRODUCT].clone(),
            serial: self.strings[STRING_SERIAL].clone(),
        }
    }

    /// String descriptor index for `which`, 0 if the device has none.
    pub fn string_index(&self, which: usize) -> u8 {
        self.descriptor.map_or(0, |desc| match which {
            STRING_MANUFACTURER => desc.manufacturer_str,
            STRING_PRODUCT => desc.product_str,
            STRING_SERIAL => desc.serial_str,
            _ => 0,
        })
    }

    pub fn ring_mut(&mut self, endpoint: u8) -> Option<&mut Ring> {
        self.rings.get_mut(usize::from(endpoint))?.as_mut()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn assign_clears_previous_device() {
        let mut slot = DeviceSlot::new(3);
        slot.assign(PortId::root(1), None, Speed::High, true);
        assert_eq!(slot.phase, Phase::Addressing);
        assert_eq!(slot.packet_size, 64);
        assert!(slot.is_enumerating());

        slot.strings[STRING_PRODUCT] = Some("keyboard".into());
        slot.hub_ports = Some(4);
        slot.phase = Phase::Free;
        assert!(!slot.in_use());

        slot.assign(PortId::root(2), None, Speed::Super, false);
        assert_eq!(slot.packet_size, 512);
        assert_eq!(slot.info().product, None);
        assert_eq!(slot.hub_ports, None);
        assert_eq!(slot.string_index(STRING_SERIAL), 0);
    }
}
