//! What class drivers (hubs, HID, ...) see of the host controller.
//!
//! A class driver is bound to a device by the `[[drivers]]` table once the
//! device has been addressed. From then on it owns the device: it decides
//! which endpoints to configure, opens pipes on them and posts transfers.
//! Completions are delivered either to a boxed callback, invoked from inside
//! the event dispatcher, or to a [`TransferFuture`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use log::warn;

use crate::error::{Error, Result};
use crate::usb::{Configuration, DeviceDescriptor, EndpointDescriptor, Setup, Speed};
use crate::xhci::TrbCompletionCode;

/// Root hub port number plus the route string through any hubs below it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PortId {
    pub root_hub_port_num: u8,
    pub route_string: u32,
}

/// Hubs can be chained at most this deep below the root port.
pub const MAX_HUB_DEPTH: u8 = 5;

impl PortId {
    pub const fn root(root_hub_port_num: u8) -> Self {
        Self {
            root_hub_port_num,
            route_string: 0,
        }
    }

    pub fn hub_depth(&self) -> u8 {
        let mut hub_depth = 0;
        let mut route_string = self.route_string;
        while route_string != 0 {
            route_string >>= 4;
            hub_depth += 1;
        }
        hub_depth
    }

    /// The port `value` of the hub sitting at `self`.
    pub fn child(&self, value: u8) -> Result<Self> {
        let depth = self.hub_depth();
        if depth >= MAX_HUB_DEPTH {
            return Err(Error::RouteTooDeep(depth));
        }
        if value == 0 || value & 0xF0 != 0 {
            return Err(Error::InvalidPort(value));
        }
        Ok(Self {
            root_hub_port_num: self.root_hub_port_num,
            route_string: self.route_string | u32::from(value) << (depth * 4),
        })
    }

    pub fn parent(&self) -> Option<(Self, u8)> {
        let depth = self.hub_depth();
        let parent_depth = depth.checked_sub(1)?;
        let parent_shift = parent_depth * 4;
        let parent_mask = 0xF << parent_shift;
        Some((
            Self {
                root_hub_port_num: self.root_hub_port_num,
                route_string: self.route_string & !parent_mask,
            },
            ((self.route_string & parent_mask) >> parent_shift) as u8,
        ))
    }

    /// Whether `self` is `ancestor` or sits anywhere below it.
    pub fn is_within(&self, ancestor: &PortId) -> bool {
        let depth = ancestor.hub_depth();
        let mask = (1u32 << (depth * 4)) - 1;
        self.root_hub_port_num == ancestor.root_hub_port_num
            && self.hub_depth() >= depth
            && self.route_string & mask == ancestor.route_string
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root_hub_port_num)?;
        // USB 3.1 Revision 1.1 Specification Section 8.9 Route String Field
        let mut route_string = self.route_string;
        while route_string != 0 {
            write!(f, ".{}", route_string & 0xF)?;
            route_string >>= 4;
        }
        Ok(())
    }
}

/// The hub a device hangs off, for devices that are not on a root port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParentPort {
    /// Slot of the hub.
    pub slot: u8,
    /// Hub port the device is connected to.
    pub port: u8,
    /// Speed the hub reported for the port.
    pub speed: Speed,
}

/// Snapshot of an enumerated device, handed to class drivers.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub slot: u8,
    pub port: PortId,
    pub parent: Option<ParentPort>,
    pub speed: Speed,
    pub descriptor: Option<DeviceDescriptor>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl DeviceInfo {
    pub fn class(&self) -> u8 {
        self.descriptor.map_or(0, |desc| desc.class)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (vendor, product) = self
            .descriptor
            .map_or((0, 0), |desc| (desc.vendor, desc.product));
        write!(
            f,
            "slot {} port {} {:04x}:{:04x} {:?}",
            self.slot, self.port, vendor, product, self.speed
        )?;
        if let Some(ref name) = self.product {
            write!(f, " \"{}\"", name)?;
        }
        Ok(())
    }
}

/// Handle of an open pipe.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PipeId(pub usize);

/// A completed transfer as seen by a callback. `data` holds what the device
/// sent for IN transfers and is empty otherwise.
#[derive(Debug)]
pub struct Transfer<'a> {
    pub slot: u8,
    pub endpoint: u8,
    pub code: TrbCompletionCode,
    pub residual: usize,
    pub arg: u64,
    pub data: &'a [u8],
}

pub type TransferCallback = Box<dyn FnOnce(&dyn UsbHost, &Transfer<'_>) + Send>;

/// Direction and payload of a normal (bulk or interrupt) transfer.
#[derive(Clone, Copy, Debug)]
pub enum TransferRequest<'a> {
    In(usize),
    Out(&'a [u8]),
}

impl TransferRequest<'_> {
    pub fn len(&self) -> usize {
        match *self {
            TransferRequest::In(length) => length,
            TransferRequest::Out(data) => data.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned result delivered through a [`TransferFuture`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferResult {
    pub code: TrbCompletionCode,
    pub residual: usize,
    pub data: Vec<u8>,
}

/// Resolves once the event-data record of the transfer has been seen.
///
/// Transfers that fail never resolve on their own; their completion is
/// dropped when the device is detached, and the future then yields
/// [`Error::Cancelled`].
pub struct TransferFuture {
    receiver: oneshot::Receiver<TransferResult>,
}

impl TransferFuture {
    pub(crate) fn new() -> (oneshot::Sender<TransferResult>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }
}

impl Future for TransferFuture {
    type Output = Result<TransferResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| Error::Cancelled))
    }
}

/// A class driver, registered by name and bound through the configuration.
pub trait ClassDriver: Send + Sync {
    /// Called when the serialized addressing phase of a device is over.
    /// Hubs may do their own class setup here; everyone else just wants the
    /// configuration.
    fn enumerate(&self, host: &dyn UsbHost, device: &DeviceInfo) {
        if let Err(err) = host.fetch_configuration(device.slot) {
            warn!("failed to fetch configuration of {}: {}", device, err);
        }
    }

    /// The configuration has been read and selected. `interface` is the
    /// interface the driver was bound by, or `None` for a device class match.
    /// The driver is expected to call [`UsbHost::configure_endpoints`].
    fn configuration_ready(
        &self,
        host: &dyn UsbHost,
        device: &DeviceInfo,
        configuration: &Configuration,
        interface: Option<u8>,
    );

    /// The endpoints passed to `configure_endpoints` are running.
    fn interfaces_enabled(&self, host: &dyn UsbHost, device: &DeviceInfo);

    /// The device is gone; its pipes are already closed.
    fn detached(&self, _host: &dyn UsbHost, _device: &DeviceInfo) {}
}

/// Operations class drivers can request from the host controller.
///
/// Everything here may be called from inside a completion callback.
pub trait UsbHost: Send + Sync {
    fn device(&self, slot: u8) -> Result<DeviceInfo>;

    /// Queue enumeration of a device a hub found on one of its ports.
    fn new_device(&self, parent: ParentPort) -> Result<()>;

    /// Tear a device down and return its slot to the free pool.
    fn detach_device(&self, slot: u8) -> Result<()>;

    /// Run the standard configuration handshake; ends in
    /// [`ClassDriver::configuration_ready`].
    fn fetch_configuration(&self, slot: u8) -> Result<()>;

    /// Configure `endpoints` with one `ConfigureEndpoint` command. Set
    /// `hub_ports` for hubs. Ends in [`ClassDriver::interfaces_enabled`].
    fn configure_endpoints(
        &self,
        slot: u8,
        hub_ports: Option<u8>,
        endpoints: &[EndpointDescriptor],
    ) -> Result<()>;

    fn control_pipe(&self, slot: u8) -> Result<PipeId>;
    /// Open a pipe on a configured endpoint, by bus address (`0x81`, ...).
    fn open_pipe(&self, slot: u8, address: u8) -> Result<PipeId>;
    fn close_pipe(&self, pipe: PipeId) -> Result<()>;

    /// Post a control transfer. Host-to-device requests carry `data` as their
    /// data stage and have `wLength` set from it. Without a callback no
    /// completion is produced, which is only allowed for requests without a
    /// data stage.
    fn post_control(
        &self,
        pipe: PipeId,
        setup: Setup,
        data: &[u8],
        arg: u64,
        callback: Option<TransferCallback>,
    ) -> Result<()>;

    /// Post a normal transfer on a bulk or interrupt pipe.
    fn post_transfer(
        &self,
        pipe: PipeId,
        request: TransferRequest<'_>,
        arg: u64,
        callback: TransferCallback,
    ) -> Result<()>;

    /// Post a bare event-data record; `callback` runs once everything before
    /// it on the pipe's ring has been processed.
    fn post_event(&self, pipe: PipeId, arg: u64, callback: TransferCallback) -> Result<()>;

    fn control(&self, pipe: PipeId, setup: Setup, data: &[u8]) -> Result<TransferFuture>;
    fn transfer(&self, pipe: PipeId, request: TransferRequest<'_>) -> Result<TransferFuture>;
    fn sync(&self, pipe: PipeId) -> Result<TransferFuture>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn route_strings() {
        let root = PortId::root(1);
        assert_eq!(root.hub_depth(), 0);
        let hub = root.child(3).unwrap();
        let device = hub.child(15).unwrap();
        assert_eq!(device.route_string, 0xF3);
        assert_eq!(device.hub_depth(), 2);
        assert_eq!(device.to_string(), "1.3.15");
        assert_eq!(device.parent(), Some((hub, 15)));
        assert_eq!(root.parent(), None);

        assert!(device.is_within(&hub));
        assert!(device.is_within(&root));
        assert!(hub.is_within(&hub));
        assert!(!hub.is_within(&device));
        assert!(!device.is_within(&PortId::root(2)));
        assert!(!device.is_within(&root.child(4).unwrap()));
    }

    #[test]
    fn route_strings_are_bounded() {
        assert!(matches!(PortId::root(1).child(16), Err(Error::InvalidPort(16))));
        assert!(matches!(PortId::root(1).child(0), Err(Error::InvalidPort(0))));

        let mut port = PortId::root(2);
        for _ in 0..MAX_HUB_DEPTH {
            port = port.child(1).unwrap();
        }
        assert!(matches!(port.child(1), Err(Error::RouteTooDeep(5))));
    }
}
