//! USB bus-level definitions: descriptors, standard requests and speeds.
//!
//! Everything here is independent of the host controller. The xHCI side only
//! uses these to build control transfers and to interpret what devices send
//! back. Layouts follow chapter 9 of the USB 2.0 and USB 3.2 specifications.
pub use self::config::{AnyDescriptor, ConfigDescriptor, Configuration, Interface};
pub use self::device::{DeviceDescriptor, DeviceDescriptor8Byte};
pub use self::endpoint::{
    EndpointDescriptor, EndpointTy, SuperSpeedCompanionDescriptor, ENDP_ATTR_TY_MASK,
};
pub use self::interface::InterfaceDescriptor;
pub use self::setup::{ReqDirection, ReqRecipient, ReqType, Setup, SetupReq};

/// Descriptor types a device can report (USB32 Table 9-6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    None = 0,
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    OnTheGo = 9,
    BinaryObjectStorage = 15,
    Hid = 33,
    Hub = 41,
    SuperSpeedCompanion = 48,
}

/// Class codes the host looks at itself. Everything else is opaque and up to
/// the class driver table.
pub mod class {
    /// The class is defined per interface.
    pub const PER_INTERFACE: u8 = 0x00;
    pub const HID: u8 = 0x03;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
    pub const VENDOR_SPECIFIC: u8 = 0xFF;
}

/// Language id requested for string descriptors (English, United States).
pub const LANGUAGE_EN_US: u16 = 0x0409;

/// Strings longer than this are cut off after decoding.
pub const MAX_STRING_CHARS: usize = 63;

/// Bus speed as encoded in the port speed ID and the slot context.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Speed {
    Full = 1,
    Low = 2,
    High = 3,
    Super = 4,
    SuperPlus = 5,
}

impl Speed {
    /// Default protocol speed IDs; controllers with custom PSI tables are not handled.
    pub fn from_psiv(psiv: u8) -> Option<Self> {
        match psiv {
            1 => Some(Speed::Full),
            2 => Some(Speed::Low),
            3 => Some(Speed::High),
            4 => Some(Speed::Super),
            5 => Some(Speed::SuperPlus),
            _ => None,
        }
    }

    /// Max packet size of endpoint 0 until the device descriptor says otherwise.
    pub fn default_control_packet_size(self) -> u16 {
        match self {
            Speed::Low => 8,
            Speed::Full | Speed::High => 64,
            Speed::Super | Speed::SuperPlus => 512,
        }
    }

    pub fn is_superspeed(self) -> bool {
        matches!(self, Speed::Super | Speed::SuperPlus)
    }
}

/// Decode a string descriptor (`bLength`, `bDescriptorType`, UTF-16LE code units).
///
/// Returns `None` when the header is malformed.
pub fn decode_string(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 2 || bytes[1] != DescriptorKind::String as u8 {
        return None;
    }
    let len = usize::from(bytes[0]).min(bytes.len());
    if len < 2 {
        return None;
    }
    let units: Vec<u16> = bytes[2..len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(
        String::from_utf16_lossy(&units)
            .chars()
            .take(MAX_STRING_CHARS)
            .collect(),
    )
}

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod interface;
pub(crate) mod setup;
