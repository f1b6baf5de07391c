use plain::Plain;
use smallvec::SmallVec;

use super::{
    DescriptorKind, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
    SuperSpeedCompanionDescriptor,
};

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl Plain for ConfigDescriptor {}

/// Any descriptor that can be stored in the configuration "data" area.
#[derive(Clone, Copy, Debug)]
pub enum AnyDescriptor {
    Device(DeviceDescriptor),
    Config(ConfigDescriptor),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    SuperSpeedCompanion(SuperSpeedCompanionDescriptor),
    /// Class-specific or unknown descriptors, kept as length and type.
    Other { kind: u8, length: u8 },
}

impl AnyDescriptor {
    /// Parse one descriptor from the front of `bytes`, returning it and its length.
    pub fn parse(bytes: &[u8]) -> Option<(Self, usize)> {
        if bytes.len() < 2 {
            return None;
        }

        let len = bytes[0];
        let kind = bytes[1];

        if len < 2 || bytes.len() < len.into() {
            return None;
        }
        let body = &bytes[..len.into()];

        let descriptor = match kind {
            k if k == DescriptorKind::Device as u8 => Self::Device(*plain::from_bytes(body).ok()?),
            k if k == DescriptorKind::Configuration as u8 => {
                Self::Config(*plain::from_bytes(body).ok()?)
            }
            k if k == DescriptorKind::Interface as u8 => {
                Self::Interface(*plain::from_bytes(body).ok()?)
            }
            k if k == DescriptorKind::Endpoint as u8 => {
                Self::Endpoint(*plain::from_bytes(body).ok()?)
            }
            k if k == DescriptorKind::SuperSpeedCompanion as u8 => {
                Self::SuperSpeedCompanion(*plain::from_bytes(body).ok()?)
            }
            kind => Self::Other { kind, length: len },
        };
        Some((descriptor, len.into()))
    }
}

/// One interface (alternate setting) with the endpoints that follow it.
#[derive(Clone, Debug)]
pub struct Interface {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: SmallVec<[EndpointDescriptor; 4]>,
    pub companions: SmallVec<[Option<SuperSpeedCompanionDescriptor>; 4]>,
}

impl Interface {
    pub fn number(&self) -> u8 {
        self.descriptor.number
    }
    pub fn class(&self) -> u8 {
        self.descriptor.class
    }
    pub fn sub_class(&self) -> u8 {
        self.descriptor.sub_class
    }
}

/// A configuration descriptor together with everything behind it.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub descriptor: ConfigDescriptor,
    pub interfaces: SmallVec<[Interface; 4]>,
}

impl Configuration {
    /// Parse a full configuration as returned by GET_DESCRIPTOR(Configuration).
    ///
    /// Parsing stops at the first malformed descriptor; whatever was read up
    /// to that point is kept. Returns `None` if even the header is missing.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let descriptor: ConfigDescriptor = match AnyDescriptor::parse(bytes)? {
            (AnyDescriptor::Config(desc), _) => desc,
            _ => return None,
        };
        let total = usize::from(descriptor.total_length).min(bytes.len());
        let mut i = usize::from(descriptor.length);
        let mut interfaces = SmallVec::<[Interface; 4]>::new();

        while i < total {
            let (item, len) = match AnyDescriptor::parse(&bytes[i..total]) {
                Some(next) => next,
                None => break,
            };
            i += len;

            match item {
                AnyDescriptor::Interface(descriptor) => interfaces.push(Interface {
                    descriptor,
                    endpoints: SmallVec::new(),
                    companions: SmallVec::new(),
                }),
                AnyDescriptor::Endpoint(endpoint) => {
                    if let Some(interface) = interfaces.last_mut() {
                        interface.endpoints.push(endpoint);
                        interface.companions.push(None);
                    }
                }
                AnyDescriptor::SuperSpeedCompanion(companion) => {
                    if let Some(slot) = interfaces
                        .last_mut()
                        .and_then(|interface| interface.companions.last_mut())
                    {
                        *slot = Some(companion);
                    }
                }
                _ => (),
            }
        }

        Some(Self {
            descriptor,
            interfaces,
        })
    }

    pub fn value(&self) -> u8 {
        self.descriptor.configuration_value
    }

    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces
            .iter()
            .find(|interface| interface.number() == number && interface.descriptor.alternate_setting == 0)
    }

    /// SuperSpeed companion of the endpoint at bus address `address`.
    pub fn companion(&self, address: u8) -> Option<SuperSpeedCompanionDescriptor> {
        self.interfaces.iter().find_map(|interface| {
            interface
                .endpoints
                .iter()
                .position(|endpoint| endpoint.address == address)
                .and_then(|i| interface.companions[i])
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // A keyboard: one interface, a HID class descriptor and one interrupt IN endpoint.
    pub const KEYBOARD: [u8; 34] = [
        9, 2, 34, 0, 1, 1, 0, 0xA0, 50, // configuration
        9, 4, 0, 0, 1, 3, 1, 1, 0, // interface
        9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0, // hid
        7, 5, 0x81, 3, 8, 0, 10, // endpoint
    ];

    #[test]
    fn keyboard() {
        let config = Configuration::parse(&KEYBOARD).unwrap();
        assert_eq!(config.value(), 1);
        assert_eq!(config.interfaces.len(), 1);
        let interface = config.interface(0).unwrap();
        assert_eq!(interface.class(), 3);
        assert_eq!(interface.endpoints.len(), 1);
        assert_eq!(interface.endpoints[0].address, 0x81);
        assert!(interface.companions[0].is_none());
    }

    #[test]
    fn truncated() {
        // the endpoint got cut off
        let config = Configuration::parse(&KEYBOARD[..30]).unwrap();
        assert_eq!(config.interfaces.len(), 1);
        assert!(config.interfaces[0].endpoints.is_empty());

        assert!(Configuration::parse(&KEYBOARD[9..]).is_none());
        assert!(Configuration::parse(&[]).is_none());
    }

    #[test]
    fn superspeed_companion() {
        let bytes = [
            9, 2, 31, 0, 1, 1, 0, 0x80, 50, //
            9, 4, 0, 0, 1, 8, 6, 0x50, 0, //
            7, 5, 0x01, 2, 0, 4, 0, //
            6, 48, 15, 0, 0, 0,
        ];
        let config = Configuration::parse(&bytes).unwrap();
        let companion = config.interfaces[0].companions[0].unwrap();
        assert_eq!(companion.max_burst, 15);
        assert_eq!(config.interfaces[0].endpoints[0].max_packet_size(), 1024);
    }
}
