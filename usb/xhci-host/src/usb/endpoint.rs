use plain::Plain;

/// The descriptor for a USB Endpoint.
///
/// Only delivered as part of a configuration descriptor. See USB32 9.6.6.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// Mask that is ANDed to the [EndpointDescriptor].attributes buffer to get the endpoint type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

pub const ENDP_ADDR_DIR_BIT: u8 = 1 << 7;
pub const ENDP_ADDR_NUMBER_MASK: u8 = 0x0F;

const ENDP_MAX_PACKET_SIZE_MASK: u16 = 0x07FF;
const ENDP_ADDITIONAL_TRANSACTIONS_SHIFT: u8 = 11;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointDescriptor {
    pub fn ty(&self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }
    pub fn number(&self) -> u8 {
        self.address & ENDP_ADDR_NUMBER_MASK
    }
    pub fn is_input(&self) -> bool {
        self.address & ENDP_ADDR_DIR_BIT != 0
    }
    pub fn max_packet_size(&self) -> u16 {
        let raw = self.max_packet_size;
        raw & ENDP_MAX_PACKET_SIZE_MASK
    }
    /// Extra transactions per microframe for high speed periodic endpoints.
    pub fn additional_transactions(&self) -> u8 {
        let raw = self.max_packet_size;
        ((raw >> ENDP_ADDITIONAL_TRANSACTIONS_SHIFT) & 0x3) as u8
    }
}

unsafe impl Plain for EndpointDescriptor {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SuperSpeedCompanionDescriptor {
    pub length: u8,
    pub kind: u8,
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}
unsafe impl Plain for SuperSpeedCompanionDescriptor {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fields() {
        let desc: EndpointDescriptor = *plain::from_bytes(&[7, 5, 0x81, 0x03, 0x08, 0x08, 10]).unwrap();
        assert_eq!(desc.ty(), EndpointTy::Interrupt);
        assert_eq!(desc.number(), 1);
        assert!(desc.is_input());
        assert_eq!(desc.max_packet_size(), 8);
        assert_eq!(desc.additional_transactions(), 1);
    }
}
