use super::DescriptorKind;

/// The 8-byte SETUP packet of a control transfer (USB32 9.3).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqType {
    /// Standard device requests, such as SET_ADDRESS and SET_CONFIGURATION.
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    // 4..=30 are reserved
    VendorSpecific = 31,
}

#[repr(u8)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_DIR_SHIFT: u8 = 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;
pub const USB_SETUP_RECIPIENT_SHIFT: u8 = 0;

impl Setup {
    /// Build a request from its parts. Class drivers use this for their
    /// class and vendor requests.
    pub const fn new(
        direction: ReqDirection,
        ty: ReqType,
        recipient: ReqRecipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: ((direction as u8) << USB_SETUP_DIR_SHIFT)
                | ((ty as u8) << USB_SETUP_REQ_TY_SHIFT)
                | ((recipient as u8) << USB_SETUP_RECIPIENT_SHIFT),
            request,
            value,
            index,
            length,
        }
    }

    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }
    pub fn is_device_to_host(&self) -> bool {
        self.direction() == ReqDirection::DeviceToHost
    }
    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }
    pub const fn req_recipient(&self) -> u8 {
        (self.kind & USB_SETUP_RECIPIENT_MASK) >> USB_SETUP_RECIPIENT_SHIFT
    }

    /// The packet as the Setup Stage TRB carries it immediately in its data field.
    pub const fn to_u64(&self) -> u64 {
        (self.kind as u64)
            | ((self.request as u64) << 8)
            | ((self.value as u64) << 16)
            | ((self.index as u64) << 32)
            | ((self.length as u64) << 48)
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self {
            kind: raw as u8,
            request: (raw >> 8) as u8,
            value: (raw >> 16) as u16,
            index: (raw >> 32) as u16,
            length: (raw >> 48) as u16,
        }
    }

    pub const fn get_status() -> Self {
        Self {
            kind: 0b1000_0000,
            request: 0x00,
            value: 0,
            index: 0,
            length: 2,
        }
    }

    pub const fn clear_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x01,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x03,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: 0b1000_0000,
            request: 0x06,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    pub const fn get_configuration() -> Self {
        Self {
            kind: 0b1000_0000,
            request: 0x08,
            value: 0,
            index: 0,
            length: 1,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x09,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self {
            kind: 0b0000_0001,
            request: 0x0B,
            value: alternate_setting as u16,
            index: interface as u16,
            length: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packing() {
        let setup = Setup::get_descriptor(DescriptorKind::String, 2, 0x0409, 0xFF);
        assert_eq!(setup.to_u64(), 0x00FF_0409_0302_0680);
        assert_eq!(Setup::from_u64(setup.to_u64()), setup);
        assert!(setup.is_device_to_host());
        assert!(!Setup::set_configuration(1).is_device_to_host());
    }

    #[test]
    fn class_request() {
        // HID SET_IDLE
        let setup = Setup::new(
            ReqDirection::HostToDevice,
            ReqType::Class,
            ReqRecipient::Interface,
            0x0A,
            0,
            1,
            0,
        );
        assert_eq!(setup.kind, 0x21);
        assert_eq!(setup.req_ty(), ReqType::Class as u8);
        assert_eq!(setup.req_recipient(), ReqRecipient::Interface as u8);
    }
}
