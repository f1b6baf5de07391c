use plain::Plain;

/// The 18-byte device descriptor (USB32 9.6.1).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub manufacturer_str: u8,
    pub product_str: u8,
    pub serial_str: u8,
    pub configurations: u8,
}

unsafe impl Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub fn minor_usb_vers(&self) -> u8 {
        (self.usb & 0xFF) as u8
    }
    pub fn major_usb_vers(&self) -> u8 {
        ((self.usb >> 8) & 0xFF) as u8
    }
    /// Endpoint 0 max packet size; USB 3 devices report it as an exponent.
    pub fn control_packet_size(&self) -> u16 {
        control_packet_size(self.major_usb_vers(), self.packet_size)
    }
}

/// The first eight bytes of [`DeviceDescriptor`], which is all a device must
/// answer before its endpoint 0 packet size is known.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor8Byte {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
}

unsafe impl Plain for DeviceDescriptor8Byte {}

impl DeviceDescriptor8Byte {
    pub fn major_usb_vers(&self) -> u8 {
        ((self.usb >> 8) & 0xFF) as u8
    }
    pub fn control_packet_size(&self) -> u16 {
        control_packet_size(self.major_usb_vers(), self.packet_size)
    }
}

fn control_packet_size(major: u8, raw: u8) -> u16 {
    if major >= 3 {
        1u16 << raw.min(15)
    } else {
        u16::from(raw)
    }
}
