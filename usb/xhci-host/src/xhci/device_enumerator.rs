//! Device enumeration, from the port connect to the class driver.
//!
//! Every step is driven by a completion: command completions arrive through
//! [`Xhci::command_step`], control transfer completions through
//! [`Xhci::transfer_step`]. A step only ever submits the next command or
//! transfer and returns, so the whole chain runs inside the event dispatcher.
//!
//! Only one device may sit at the default address, so the part up to and
//! including the string descriptors is serialized controller-wide. Further
//! requests wait in a bounded queue until the current device lets go.

use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};
use plain::Plain;
use smallvec::SmallVec;

use super::command::Pending;
use super::context::{
    endpoint_burst, endpoint_index, endpoint_interval, EndpointSetup, EndpointType,
    INPUT_CONTEXT_A0, INPUT_CONTEXT_A1,
};
use super::device::{DeviceState, Phase};
use super::transaction::Completion;
use super::trb::{Record, TrbCompletionCode};
use super::Xhci;
use crate::driver_interface::{ClassDriver, DeviceInfo, ParentPort, PipeId, PortId};
use crate::error::{Error, Result};
use crate::usb::{
    class, decode_string, ConfigDescriptor, Configuration, DescriptorKind, DeviceDescriptor,
    DeviceDescriptor8Byte, EndpointDescriptor, EndpointTy, Setup, Speed, LANGUAGE_EN_US,
};

const EARLY_DESCRIPTOR_LENGTH: u16 = 8;
const DEVICE_DESCRIPTOR_LENGTH: u16 = 18;
const CONFIG_HEADER_LENGTH: u16 = 9;

/// A device waiting to be addressed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct NewDeviceRequest {
    pub port: PortId,
    pub parent: Option<ParentPort>,
}

/// The continuation of an enumeration, stored with the command or
/// transaction whose completion advances it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EnumStep {
    // command completions
    SlotEnabled(NewDeviceRequest),
    Addressed(u8),
    PacketSizeEvaluated(u8),
    Readdressed(u8),
    EndpointsConfigured(u8),

    // control transfer completions
    EarlyDescriptor(u8),
    FullDescriptor(u8),
    /// Length probe of string `which`.
    StringLength(u8, usize),
    StringDescriptor(u8, usize),
    AddressPhaseComplete(u8),
    ConfigHeader(u8),
    /// SET_CONFIGURATION done; carries wTotalLength of the configuration.
    ConfigurationSet(u8, u16),
    FullConfiguration(u8),
    InterfacesEnabled(u8),
}

impl EnumStep {
    pub fn slot(&self) -> Option<u8> {
        match *self {
            EnumStep::SlotEnabled(_) => None,
            EnumStep::Addressed(slot)
            | EnumStep::PacketSizeEvaluated(slot)
            | EnumStep::Readdressed(slot)
            | EnumStep::EndpointsConfigured(slot)
            | EnumStep::EarlyDescriptor(slot)
            | EnumStep::FullDescriptor(slot)
            | EnumStep::StringLength(slot, _)
            | EnumStep::StringDescriptor(slot, _)
            | EnumStep::AddressPhaseComplete(slot)
            | EnumStep::ConfigHeader(slot)
            | EnumStep::ConfigurationSet(slot, _)
            | EnumStep::FullConfiguration(slot)
            | EnumStep::InterfacesEnabled(slot) => Some(slot),
        }
    }
}

fn average_trb_length(ty: EndpointTy) -> u16 {
    match ty {
        EndpointTy::Ctrl => 8,
        EndpointTy::Interrupt => 1024,
        _ => 3072,
    }
}

fn parse<T: Plain + Copy>(data: &[u8], what: &'static str) -> Result<T> {
    plain::from_bytes::<T>(data)
        .map(|desc| *desc)
        .map_err(|_| Error::BadDescriptor(what))
}

impl<const N: usize> Xhci<N> {
    /// Queue a device for addressing, or start right away when no other
    /// device holds the addressing lock.
    pub(crate) fn request_new_device(&self, request: NewDeviceRequest) -> Result<()> {
        let guard = self.cmd.lock();
        {
            let mut state = guard.borrow_mut();
            let addressing = state.addressing;
            match addressing {
                None => state.addressing = Some(request.port),
                Some(current) if current == request.port => {
                    debug!("port {} is already being addressed", request.port);
                    return Ok(());
                }
                Some(current) => {
                    if state.waiting.contains(&request.port) {
                        debug!("port {} is already queued", request.port);
                        return Ok(());
                    }
                    if state.queue_tx.try_send(request).is_err() {
                        warn!(
                            "dropping device on port {}: {} requests already wait behind port {}",
                            request.port,
                            state.queued(),
                            current
                        );
                        return Err(Error::QueueFull);
                    }
                    state.waiting.insert(request.port);
                    debug!("port {} queued behind port {}", request.port, current);
                    return Ok(());
                }
            }
        }

        self.start_addressing(request).map_err(|err| {
            error!("failed to start addressing port {}: {}", request.port, err);
            self.finish_addressing();
            err
        })
    }

    fn start_addressing(&self, request: NewDeviceRequest) -> Result<()> {
        let reused = self.cmd.lock().borrow_mut().free_slots.pop_front();
        match reused {
            Some(slot) => {
                debug!("port {}: reusing slot {}", request.port, slot);
                self.address_new_device(slot, request).map_err(|err| {
                    self.release_slot(slot);
                    err
                })
            }
            None => {
                self.submit_command(
                    Record::EnableSlot { slot_type: 0 },
                    Some(Pending::Enumeration(EnumStep::SlotEnabled(request))),
                );
                Ok(())
            }
        }
    }

    /// Release the addressing lock and start the next queued device.
    pub(crate) fn finish_addressing(&self) {
        let guard = self.cmd.lock();
        loop {
            let next = {
                let mut state = guard.borrow_mut();
                let next = state.queue_rx.try_recv().ok();
                state.addressing = next.map(|request| request.port);
                if let Some(request) = next {
                    state.waiting.remove(&request.port);
                }
                next
            };
            let request = match next {
                Some(request) => request,
                None => return,
            };
            if self.device_on(request.port) {
                debug!("port {} already has a device", request.port);
                continue;
            }
            match self.start_addressing(request) {
                Ok(()) => return,
                Err(err) => error!("failed to start addressing port {}: {}", request.port, err),
            }
        }
    }

    fn address_new_device(&self, slot: u8, request: NewDeviceRequest) -> Result<()> {
        let root = request.port.root_hub_port_num;
        let usb2 = request.parent.is_none() && root == self.config.controller.usb2_root_port;
        let speed = match request.parent {
            Some(parent) => parent.speed,
            None => self.port_speed(root).unwrap_or(if usb2 {
                Speed::High
            } else {
                Speed::Super
            }),
        };

        if self.slot(slot)?.lock().rings[1].is_none() {
            let ring = self.new_transfer_ring()?;
            self.slot(slot)?.lock().rings[1] = Some(ring);
        }
        let control = self.open_control_pipe(slot)?;
        {
            let mut dev = self.slot(slot)?.lock();
            dev.assign(request.port, request.parent, speed, usb2);
            dev.control_pipe = Some(control);
        }
        debug!(
            "slot {}: addressing port {} at {:?} speed{}",
            slot,
            request.port,
            speed,
            if usb2 { ", blocking SET_ADDRESS" } else { "" }
        );
        self.address_device(slot, usb2, EnumStep::Addressed(slot))
    }

    fn address_device(&self, slot: u8, block_set_address: bool, step: EnumStep) -> Result<()> {
        let (port, parent, speed, packet_size, dequeue) = {
            let mut dev = self.slot(slot)?.lock();
            dev.block_set_address = block_set_address;
            let dequeue = dev.rings[1]
                .as_ref()
                .ok_or(Error::InvalidEndpoint(0))?
                .register();
            (dev.port, dev.parent, dev.speed, dev.packet_size, dequeue)
        };
        // low and full speed devices behind a high speed hub go through its
        // transaction translator
        let translator = match parent {
            Some(parent) if matches!(speed, Speed::Low | Speed::Full) => {
                let hub_speed = self.slot(parent.slot)?.lock().speed;
                if hub_speed == Speed::High {
                    Some(parent)
                } else {
                    None
                }
            }
            _ => None,
        };

        let input_context = {
            let mut contexts = self.contexts.lock();
            let input = contexts.input_mut(slot);
            input.prepare(INPUT_CONTEXT_A0 | INPUT_CONTEXT_A1, None);

            let context = &mut input.device.slot;
            context.set_route(port.route_string);
            context.set_speed(speed);
            context.set_context_entries(1);
            context.set_root_port(port.root_hub_port_num);
            if let Some(hub) = translator {
                context.set_parent_hub(hub.slot, hub.port);
            }

            input.device.endpoint_mut(1).configure(&EndpointSetup {
                ty: EndpointType::Control,
                max_packet_size: packet_size,
                max_burst: 0,
                interval: 0,
                max_esit_payload: 0,
                average_trb_length: average_trb_length(EndpointTy::Ctrl),
                dequeue,
            });
            input.publish(&*self.cache);
            input.physical() as u64
        };

        self.submit_command(
            Record::AddressDevice {
                input_context,
                slot,
                block_set_address,
            },
            Some(Pending::Enumeration(step)),
        );
        Ok(())
    }

    /// Second AddressDevice of a device first addressed with BSR set.
    fn readdress(&self, slot: u8) -> Result<()> {
        if self.config.controller.usb2_port_reset_on_readdress {
            let root = self.slot(slot)?.lock().port.root_hub_port_num;
            self.reset_port(root)?;
        }
        self.address_device(slot, false, EnumStep::Readdressed(slot))
    }

    fn evaluate_packet_size(&self, slot: u8) -> Result<()> {
        let packet_size = self.slot(slot)?.lock().packet_size;
        let input_context = {
            let mut contexts = self.contexts.lock();
            let input = contexts.input_from_output(slot, INPUT_CONTEXT_A1, &*self.cache);
            input.device.endpoint_mut(1).set_max_packet_size(packet_size);
            input.publish(&*self.cache);
            input.physical() as u64
        };
        self.submit_command(
            Record::EvaluateContext {
                input_context,
                slot,
            },
            Some(Pending::Enumeration(EnumStep::PacketSizeEvaluated(slot))),
        );
        Ok(())
    }

    fn get_descriptor(
        &self,
        slot: u8,
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
        step: EnumStep,
    ) -> Result<()> {
        self.submit_control(
            slot,
            1,
            Setup::get_descriptor(kind, index, language, length),
            &[],
            Some(Completion::Enumeration(step)),
            0,
        )
    }

    fn request_device_descriptor(&self, slot: u8) -> Result<()> {
        self.get_descriptor(
            slot,
            DescriptorKind::Device,
            0,
            0,
            DEVICE_DESCRIPTOR_LENGTH,
            EnumStep::FullDescriptor(slot),
        )
    }

    /// Whether steps for `slot` still belong to a device being set up.
    fn live(&self, slot: u8) -> bool {
        self.slot(slot)
            .map_or(false, |dev| !matches!(dev.lock().phase, Phase::Free | Phase::Detaching))
    }

    pub(crate) fn command_step(&self, step: EnumStep, code: TrbCompletionCode, event_slot: u8) {
        if let EnumStep::SlotEnabled(request) = step {
            return self.slot_enabled(request, code, event_slot);
        }
        let slot = match step.slot() {
            Some(slot) => slot,
            None => return,
        };
        if !self.live(slot) {
            debug!("slot {}: ignoring {:?} of a detached device", slot, step);
            return;
        }
        if !code.is_success() {
            return self.abandon(slot, format!("{:?} completed with {:?}", step, code));
        }

        let result = match step {
            EnumStep::Addressed(slot) | EnumStep::Readdressed(slot) => self.addressed(slot, step),
            EnumStep::PacketSizeEvaluated(slot) => match self.slot(slot) {
                Ok(dev) if dev.lock().block_set_address => self.readdress(slot),
                Ok(_) => self.request_device_descriptor(slot),
                Err(err) => Err(err),
            },
            EnumStep::EndpointsConfigured(slot) => {
                if let Ok(dev) = self.slot(slot) {
                    dev.lock().state = DeviceState::Configured;
                }
                self.submit_event(
                    slot,
                    1,
                    Completion::Enumeration(EnumStep::InterfacesEnabled(slot)),
                    0,
                )
            }
            other => {
                warn!("slot {}: {:?} is not a command step", slot, other);
                Ok(())
            }
        };
        if let Err(err) = result {
            self.abandon(slot, err);
        }
    }

    fn slot_enabled(&self, request: NewDeviceRequest, code: TrbCompletionCode, slot: u8) {
        if !code.is_success() {
            error!("enable slot for port {} failed with {:?}", request.port, code);
            return self.finish_addressing();
        }
        let dev = match self.slot(slot) {
            Ok(dev) => dev,
            Err(_) => {
                error!("controller enabled slot {} beyond the enabled slots", slot);
                return self.finish_addressing();
            }
        };
        dev.lock().state = DeviceState::Default;

        if let Err(err) = self.address_new_device(slot, request) {
            error!("slot {}: failed to address port {}: {}", slot, request.port, err);
            self.release_slot(slot);
            self.finish_addressing();
        }
    }

    /// AddressDevice completed. With BSR set the device is still at the
    /// default address; the first read only learns the control packet size.
    fn addressed(&self, slot: u8, step: EnumStep) -> Result<()> {
        let address = {
            let contexts = self.contexts.lock();
            let output = contexts.output(slot);
            output.refresh(&*self.cache);
            output.slot.device_address()
        };
        {
            let mut dev = self.slot(slot)?.lock();
            dev.state = if dev.block_set_address {
                DeviceState::Default
            } else {
                DeviceState::Addressed
            };
        }
        debug!("slot {}: {:?}, device address {}", slot, step, address);

        match step {
            EnumStep::Readdressed(_) => self.request_device_descriptor(slot),
            _ => self.get_descriptor(
                slot,
                DescriptorKind::Device,
                0,
                0,
                EARLY_DESCRIPTOR_LENGTH,
                EnumStep::EarlyDescriptor(slot),
            ),
        }
    }

    pub(crate) fn transfer_step(&self, step: EnumStep, data: &[u8]) {
        let slot = match step.slot() {
            Some(slot) => slot,
            None => return,
        };
        if !self.live(slot) {
            debug!("slot {}: ignoring {:?} of a detached device", slot, step);
            return;
        }
        if let Err(err) = self.advance(step, data) {
            self.abandon(slot, err);
        }
    }

    fn advance(&self, step: EnumStep, data: &[u8]) -> Result<()> {
        match step {
            EnumStep::EarlyDescriptor(slot) => {
                let early: DeviceDescriptor8Byte = parse(data, "device")?;
                let packet_size = early.control_packet_size();
                if packet_size == 0 {
                    return Err(Error::BadDescriptor("device"));
                }
                let (changed, block_set_address) = {
                    let mut dev = self.slot(slot)?.lock();
                    let changed = dev.packet_size != packet_size;
                    dev.packet_size = packet_size;
                    (changed, dev.block_set_address)
                };
                if changed {
                    debug!("slot {}: control packet size is {}", slot, packet_size);
                    self.evaluate_packet_size(slot)
                } else if block_set_address {
                    self.readdress(slot)
                } else {
                    self.request_device_descriptor(slot)
                }
            }
            EnumStep::FullDescriptor(slot) => {
                let descriptor: DeviceDescriptor = parse(data, "device")?;
                if descriptor.kind != DescriptorKind::Device as u8 {
                    return Err(Error::BadDescriptor("device"));
                }
                let port = {
                    let mut dev = self.slot(slot)?.lock();
                    dev.descriptor = Some(descriptor);
                    dev.port
                };
                let (vendor, product, class) =
                    (descriptor.vendor, descriptor.product, descriptor.class);
                info!(
                    "port {}: USB {:x}.{:02x} device {:04x}:{:04x} class {:#04x} in slot {}",
                    port,
                    descriptor.major_usb_vers(),
                    descriptor.minor_usb_vers(),
                    vendor,
                    product,
                    class,
                    slot
                );
                self.next_string(slot, 0)
            }
            EnumStep::StringLength(slot, which) => match data.first() {
                Some(&length) if length >= 2 => {
                    let index = self.slot(slot)?.lock().string_index(which);
                    self.get_descriptor(
                        slot,
                        DescriptorKind::String,
                        index,
                        LANGUAGE_EN_US,
                        u16::from(length),
                        EnumStep::StringDescriptor(slot, which),
                    )
                }
                _ => {
                    warn!("slot {}: string {} has a malformed length, skipping it", slot, which);
                    self.next_string(slot, which + 1)
                }
            },
            EnumStep::StringDescriptor(slot, which) => {
                match decode_string(data) {
                    Some(string) => {
                        debug!("slot {}: string {} is {:?}", slot, which, string);
                        self.slot(slot)?.lock().strings[which] = Some(string);
                    }
                    None => warn!("slot {}: string {} is malformed", slot, which),
                }
                self.next_string(slot, which + 1)
            }
            EnumStep::AddressPhaseComplete(slot) => {
                let info = {
                    let mut dev = self.slot(slot)?.lock();
                    dev.phase = Phase::Configuring;
                    dev.info()
                };
                self.finish_addressing();

                let class = info.class();
                let sub_class = info.descriptor.map_or(0, |desc| desc.sub_class);
                let bound = if class != class::PER_INTERFACE {
                    self.find_driver(class, sub_class)
                } else {
                    None
                };
                match bound {
                    Some((name, driver)) => {
                        info!("{}: bound to {}", info, name);
                        self.slot(slot)?.lock().driver = Some(Arc::clone(&driver));
                        driver.enumerate(self, &info);
                        Ok(())
                    }
                    None => self.fetch_configuration(slot),
                }
            }
            EnumStep::ConfigHeader(slot) => {
                let header: ConfigDescriptor = parse(data, "configuration")?;
                if header.kind != DescriptorKind::Configuration as u8 {
                    return Err(Error::BadDescriptor("configuration"));
                }
                let (value, total) = (header.configuration_value, header.total_length);
                self.submit_control(
                    slot,
                    1,
                    Setup::set_configuration(value),
                    &[],
                    Some(Completion::Enumeration(EnumStep::ConfigurationSet(slot, total))),
                    0,
                )
            }
            EnumStep::ConfigurationSet(slot, total) => {
                let limit = self.buffers.lock().buffer_size();
                let length = usize::from(total).min(limit);
                if length < usize::from(CONFIG_HEADER_LENGTH) {
                    return Err(Error::BadDescriptor("configuration"));
                }
                if usize::from(total) > limit {
                    warn!(
                        "slot {}: configuration of {} bytes cut to {}",
                        slot, total, limit
                    );
                }
                self.get_descriptor(
                    slot,
                    DescriptorKind::Configuration,
                    0,
                    0,
                    length as u16,
                    EnumStep::FullConfiguration(slot),
                )
            }
            EnumStep::FullConfiguration(slot) => {
                let configuration =
                    Configuration::parse(data).ok_or(Error::BadDescriptor("configuration"))?;
                self.configuration_read(slot, configuration)
            }
            EnumStep::InterfacesEnabled(slot) => {
                let (info, driver) = {
                    let mut dev = self.slot(slot)?.lock();
                    dev.phase = Phase::Ready;
                    (dev.info(), dev.driver.clone())
                };
                info!("{}: configured", info);
                if let Some(driver) = driver {
                    driver.interfaces_enabled(self, &info);
                }
                Ok(())
            }
            other => {
                warn!("{:?} is not a transfer step", other);
                Ok(())
            }
        }
    }

    /// Probe the next string descriptor from `from` on, or end the
    /// addressing phase once all are read.
    fn next_string(&self, slot: u8, from: usize) -> Result<()> {
        let next = {
            let dev = self.slot(slot)?.lock();
            (from..dev.strings.len())
                .map(|which| (which, dev.string_index(which)))
                .find(|&(_, index)| index != 0)
        };
        match next {
            Some((which, index)) => self.get_descriptor(
                slot,
                DescriptorKind::String,
                index,
                LANGUAGE_EN_US,
                1,
                EnumStep::StringLength(slot, which),
            ),
            None => self.submit_event(
                slot,
                1,
                Completion::Enumeration(EnumStep::AddressPhaseComplete(slot)),
                0,
            ),
        }
    }

    /// Start the configuration handshake of `slot`.
    pub(crate) fn fetch_configuration(&self, slot: u8) -> Result<()> {
        {
            let dev = self.slot(slot)?.lock();
            if !matches!(dev.phase, Phase::Configuring | Phase::Ready) {
                return Err(Error::NoSuchSlot(slot));
            }
        }
        self.get_descriptor(
            slot,
            DescriptorKind::Configuration,
            0,
            0,
            CONFIG_HEADER_LENGTH,
            EnumStep::ConfigHeader(slot),
        )
    }

    fn configuration_read(&self, slot: u8, configuration: Configuration) -> Result<()> {
        let (info, bound) = {
            let mut dev = self.slot(slot)?.lock();
            dev.configuration = Some(configuration.clone());
            (dev.info(), dev.driver.clone())
        };
        debug!(
            "{}: configuration {} with {} interfaces",
            info,
            configuration.value(),
            configuration.interfaces.len()
        );

        let (driver, interface) = match bound {
            Some(driver) => (driver, None),
            None => match self.bind_driver(&info, &configuration) {
                Some((name, driver, interface)) => {
                    match interface {
                        Some(number) => info!("{}: interface {} bound to {}", info, number, name),
                        None => info!("{}: bound to {}", info, name),
                    }
                    (driver, interface)
                }
                None => {
                    info!("{}: no class driver, leaving it addressed", info);
                    self.slot(slot)?.lock().phase = Phase::Ready;
                    return Ok(());
                }
            },
        };
        {
            let mut dev = self.slot(slot)?.lock();
            dev.driver = Some(Arc::clone(&driver));
            dev.interface = interface;
        }
        driver.configuration_ready(self, &info, &configuration, interface);
        Ok(())
    }

    /// Device class first; devices that defer to their interfaces are bound
    /// by the first interface a driver is registered for.
    fn bind_driver(
        &self,
        info: &DeviceInfo,
        configuration: &Configuration,
    ) -> Option<(String, Arc<dyn ClassDriver>, Option<u8>)> {
        let class = info.class();
        if class != class::PER_INTERFACE {
            let sub_class = info.descriptor.map_or(0, |desc| desc.sub_class);
            return self
                .find_driver(class, sub_class)
                .map(|(name, driver)| (name, driver, None));
        }
        configuration
            .interfaces
            .iter()
            .filter(|interface| interface.descriptor.alternate_setting == 0)
            .find_map(|interface| {
                self.find_driver(interface.class(), interface.sub_class())
                    .map(|(name, driver)| (name, driver, Some(interface.number())))
            })
    }

    pub(crate) fn configure_endpoints(
        &self,
        slot: u8,
        hub_ports: Option<u8>,
        endpoints: &[EndpointDescriptor],
    ) -> Result<()> {
        let mut indices = SmallVec::<[u8; 8]>::new();
        for endpoint in endpoints {
            let dci = endpoint_index(endpoint.address)?;
            if dci == 1
                || matches!(endpoint.ty(), EndpointTy::Ctrl | EndpointTy::Isoch)
                || indices.contains(&dci)
            {
                return Err(Error::InvalidEndpoint(endpoint.address));
            }
            indices.push(dci);
        }

        let missing: SmallVec<[u8; 8]> = {
            let dev = self.slot(slot)?.lock();
            if !matches!(dev.phase, Phase::Configuring | Phase::Ready) {
                return Err(Error::NoSuchSlot(slot));
            }
            indices
                .iter()
                .copied()
                .filter(|&dci| dev.rings[usize::from(dci)].is_none())
                .collect()
        };
        for dci in missing {
            let ring = self.new_transfer_ring()?;
            self.slot(slot)?.lock().rings[usize::from(dci)] = Some(ring);
        }

        let (setups, multi_tt) = {
            let mut dev = self.slot(slot)?.lock();
            let speed = dev.speed;
            let mut setups = SmallVec::<[(u8, EndpointSetup); 8]>::new();
            for (endpoint, &dci) in endpoints.iter().zip(&indices) {
                let companion = dev
                    .configuration
                    .as_ref()
                    .and_then(|configuration| configuration.companion(endpoint.address));
                let ring = dev
                    .ring_mut(dci)
                    .ok_or(Error::InvalidEndpoint(endpoint.address))?;
                ring.reset();
                let dequeue = ring.register();

                let ty = endpoint.ty();
                let (max_burst, max_esit_payload) =
                    endpoint_burst(speed, endpoint, companion.as_ref());
                setups.push((
                    dci,
                    EndpointSetup {
                        ty: EndpointType::new(ty, endpoint.is_input()),
                        max_packet_size: endpoint.max_packet_size(),
                        max_burst,
                        interval: endpoint_interval(speed, ty, endpoint.interval),
                        max_esit_payload,
                        average_trb_length: average_trb_length(ty),
                        dequeue,
                    },
                ));
            }
            dev.hub_ports = hub_ports;
            dev.endpoints = endpoints.iter().copied().collect();
            // hubs with one transaction translator per port report protocol 2
            let multi_tt = dev.descriptor.map_or(false, |desc| desc.protocol == 2);
            (setups, multi_tt)
        };

        let add = setups
            .iter()
            .fold(INPUT_CONTEXT_A0, |add, &(dci, _)| add | 1 << dci);
        let entries = setups.iter().map(|&(dci, _)| dci).max().unwrap_or(1);

        let input_context = {
            let mut contexts = self.contexts.lock();
            let input = contexts.input_from_output(slot, add, &*self.cache);
            input.device.slot.set_context_entries(entries);
            if let Some(ports) = hub_ports {
                input.device.slot.set_hub(ports, multi_tt);
            }
            for (dci, setup) in &setups {
                input.device.endpoint_mut(*dci).configure(setup);
            }
            input.dump_control();
            input.publish(&*self.cache);
            input.physical() as u64
        };

        debug!("slot {}: configuring {} endpoints", slot, setups.len());
        self.submit_command(
            Record::ConfigureEndpoint {
                input_context,
                slot,
                deconfigure: false,
            },
            Some(Pending::Enumeration(EnumStep::EndpointsConfigured(slot))),
        );
        Ok(())
    }

    /// A hub found a device on one of its ports.
    pub(crate) fn new_hub_device(&self, parent: ParentPort) -> Result<()> {
        let port = {
            let hub = self.slot(parent.slot)?.lock();
            if !hub.in_use() || hub.phase == Phase::Detaching {
                return Err(Error::NoSuchSlot(parent.slot));
            }
            hub.port.child(parent.port)?
        };
        self.request_new_device(NewDeviceRequest {
            port,
            parent: Some(parent),
        })
    }

    /// Detach every device at or below `port`, deepest first.
    pub(crate) fn detach_tree(&self, port: PortId) -> usize {
        let mut doomed: SmallVec<[(u8, u8); 8]> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let dev = slot.lock();
                if dev.in_use() && dev.phase != Phase::Detaching && dev.port.is_within(&port) {
                    Some((dev.port.hub_depth(), dev.id))
                } else {
                    None
                }
            })
            .collect();
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for &(_, slot) in &doomed {
            self.detach_slot(slot);
        }
        doomed.len()
    }

    /// Close everything the device had open and reset its slot. The slot
    /// goes back to the free pool once the Reset Device command completes.
    pub(crate) fn detach_slot(&self, slot: u8) {
        let (was_addressing, driver, info) = {
            let mut dev = match self.slot(slot) {
                Ok(dev) => dev.lock(),
                Err(_) => return,
            };
            if !dev.in_use() || dev.phase == Phase::Detaching {
                return;
            }
            let was_addressing = dev.phase == Phase::Addressing;
            dev.phase = Phase::Detaching;
            (was_addressing, dev.driver.take(), dev.info())
        };
        info!("{}: detaching", info);

        self.close_pipes(slot);
        if was_addressing {
            self.finish_addressing();
        }
        if let Some(driver) = driver {
            driver.detached(self, &info);
        }
        self.submit_command(Record::ResetDevice { slot }, Some(Pending::Detach(slot)));
    }

    pub(crate) fn finish_detach(&self, slot: u8, code: TrbCompletionCode) {
        if !code.is_success() {
            warn!("slot {}: reset device completed with {:?}", slot, code);
        }
        let reclaimed = self.reclaim_transactions(slot);
        if let Ok(dev) = self.slot(slot) {
            let mut dev = dev.lock();
            dev.phase = Phase::Free;
            dev.state = DeviceState::Default;
        }
        self.cmd.lock().borrow_mut().free_slots.push_back(slot);
        debug!("slot {}: free, {} transactions reclaimed", slot, reclaimed);
    }

    /// Give back a slot that never got past addressing.
    fn release_slot(&self, slot: u8) {
        self.close_pipes(slot);
        if let Ok(dev) = self.slot(slot) {
            dev.lock().phase = Phase::Free;
        }
        self.cmd.lock().borrow_mut().free_slots.push_back(slot);
    }

    fn close_pipes(&self, slot: u8) {
        let open: SmallVec<[PipeId; 5]> = match self.slot(slot) {
            Ok(dev) => {
                let mut dev = dev.lock();
                let mut open: SmallVec<[PipeId; 5]> = dev.pipes.drain(..).collect();
                open.extend(dev.control_pipe.take());
                open
            }
            Err(_) => return,
        };
        let mut pipes = self.pipes.lock();
        for id in open {
            if pipes.contains(id.0) {
                pipes.release(id.0);
            }
        }
    }

    fn abandon(&self, slot: u8, reason: impl fmt::Display) {
        error!("slot {}: enumeration abandoned: {}", slot, reason);
        self.detach_slot(slot);
    }

    /// A transfer of `slot` failed. Devices still being set up are given up
    /// on; the class driver of a running device sees nothing.
    pub(crate) fn transfer_failed(&self, slot: u8) {
        let enumerating = self
            .slot(slot)
            .map_or(false, |dev| dev.lock().is_enumerating());
        if enumerating {
            self.abandon(slot, "control transfer failed");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::driver_interface::{Transfer, TransferRequest, UsbHost};
    use crate::xhci::harness::Harness;
    use crate::xhci::port::PortFlags;

    use super::TrbCompletionCode::Success;

    const CONNECTED: u32 = PortFlags::CCS.bits() | PortFlags::PP.bits() | PortFlags::CSC.bits();

    /// A USB3 boot keyboard that defers its class to interface 0.
    const KEYBOARD: [u8; 18] = [
        18, 1, 0x00, 0x03, 0, 0, 0, 9, 0x6d, 0x04, 0x1c, 0xc3, 0x00, 0x01, 1, 2, 0, 1,
    ];
    const KEYBOARD_CONFIG: [u8; 34] = [
        9, 2, 34, 0, 1, 1, 0, 0xA0, 50, // configuration
        9, 4, 0, 0, 1, 3, 1, 1, 0, // interface 0, HID boot keyboard
        9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0, // HID
        7, 5, 0x81, 3, 8, 0, 10, // interrupt IN
    ];

    #[derive(Default)]
    struct Keyboard {
        events: Mutex<Vec<String>>,
        reports: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ClassDriver for Keyboard {
        fn configuration_ready(
            &self,
            host: &dyn UsbHost,
            device: &DeviceInfo,
            configuration: &Configuration,
            interface: Option<u8>,
        ) {
            self.events
                .lock()
                .push(format!("configuration {:?}", interface));
            let interface = configuration.interface(interface.unwrap()).unwrap();
            host.configure_endpoints(device.slot, None, &interface.endpoints[..])
                .unwrap();
        }

        fn interfaces_enabled(&self, host: &dyn UsbHost, device: &DeviceInfo) {
            self.events.lock().push("enabled".to_string());
            let pipe = host.open_pipe(device.slot, 0x81).unwrap();
            let reports = Arc::clone(&self.reports);
            host.post_transfer(
                pipe,
                TransferRequest::In(8),
                0,
                Box::new(move |_: &dyn UsbHost, transfer: &Transfer<'_>| {
                    reports.lock().push(transfer.data.to_vec())
                }),
            )
            .unwrap();
        }

        fn detached(&self, _host: &dyn UsbHost, device: &DeviceInfo) {
            self.events.lock().push(format!("detached {}", device.slot));
        }
    }

    fn connect(harness: &Harness, port: u8) {
        harness.set_portsc(port, CONNECTED | PortFlags::PED.bits());
        harness.push_event(Record::PortStatusChange {
            port,
            code: Success,
        });
        harness.hci.handle_interrupt();
    }

    /// Connect a device on the USB3 port and address it into slot 1.
    fn address_on_port_2(harness: &Harness) {
        connect(harness, 2);
        assert_eq!(
            harness.hci.slot(1).unwrap().lock().state,
            DeviceState::Disabled
        );
        assert!(matches!(
            harness.complete_next_command(Success, 1),
            Record::EnableSlot { .. }
        ));
        assert_eq!(
            harness.hci.slot(1).unwrap().lock().state,
            DeviceState::Default
        );
        assert!(matches!(
            harness.complete_next_command(Success, 1),
            Record::AddressDevice {
                slot: 1,
                block_set_address: false,
                ..
            }
        ));
    }

    fn free_slots(harness: &Harness) -> Vec<u8> {
        harness
            .hci
            .cmd
            .lock()
            .borrow()
            .free_slots
            .iter()
            .copied()
            .collect()
    }

    fn addressing(harness: &Harness) -> Option<PortId> {
        harness.hci.cmd.lock().borrow().addressing
    }

    #[test]
    fn keyboard_enumerates_up_to_its_driver() {
        let harness = Harness::new();
        let keyboard = Arc::new(Keyboard::default());
        assert!(harness
            .hci
            .register_class_driver("usbhid", keyboard.clone()));

        address_on_port_2(&harness);
        assert_eq!(addressing(&harness), Some(PortId::root(2)));

        let (setup, _) = harness.respond_control(1, &KEYBOARD[..8]);
        assert_eq!(setup, Setup::get_descriptor(DescriptorKind::Device, 0, 0, 8));
        // 512 byte packets are the SuperSpeed default, nothing to evaluate
        let (setup, _) = harness.respond_control(1, &KEYBOARD);
        assert_eq!(setup, Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18));
        assert_eq!(harness.pending_commands(), 0);

        // manufacturer string has a broken length and is skipped
        let (setup, _) = harness.respond_control(1, &[1]);
        assert_eq!(
            setup,
            Setup::get_descriptor(DescriptorKind::String, 1, LANGUAGE_EN_US, 1)
        );
        let (setup, _) = harness.respond_control(1, &[8]);
        assert_eq!(
            setup,
            Setup::get_descriptor(DescriptorKind::String, 2, LANGUAGE_EN_US, 1)
        );
        let (setup, _) = harness.respond_control(1, &[8, 3, b'K', 0, b'b', 0, b'd', 0]);
        assert_eq!(
            setup,
            Setup::get_descriptor(DescriptorKind::String, 2, LANGUAGE_EN_US, 8)
        );

        harness.complete_event(1, 1);
        assert_eq!(addressing(&harness), None);
        assert_eq!(harness.hci.slot(1).unwrap().lock().phase, Phase::Configuring);

        let (setup, _) = harness.respond_control(1, &KEYBOARD_CONFIG[..9]);
        assert_eq!(
            setup,
            Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, 9)
        );
        let (setup, key) = harness.respond_control(1, &[]);
        assert_eq!(setup, Setup::set_configuration(1));
        assert!(key.is_some());
        let (setup, _) = harness.respond_control(1, &KEYBOARD_CONFIG);
        assert_eq!(
            setup,
            Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, 34)
        );
        assert_eq!(*keyboard.events.lock(), vec!["configuration Some(0)"]);

        assert!(matches!(
            harness.complete_next_command(Success, 1),
            Record::ConfigureEndpoint {
                slot: 1,
                deconfigure: false,
                ..
            }
        ));
        assert_eq!(
            harness.hci.slot(1).unwrap().lock().state,
            DeviceState::Configured
        );
        harness.complete_event(1, 1);
        assert_eq!(
            *keyboard.events.lock(),
            vec!["configuration Some(0)", "enabled"]
        );

        let info = harness.hci.device(1).unwrap();
        assert_eq!(info.manufacturer, None);
        assert_eq!(info.product.as_deref(), Some("Kbd"));
        assert_eq!(info.serial, None);
        assert_eq!(harness.hci.slot(1).unwrap().lock().phase, Phase::Ready);

        let report = [0, 0, 4, 0, 0, 0, 0, 0];
        harness.respond(1, 3, &report);
        assert_eq!(*keyboard.reports.lock(), vec![report.to_vec()]);

        // unplugged
        harness.set_portsc(2, PortFlags::PP.bits() | PortFlags::CSC.bits());
        harness.push_event(Record::PortStatusChange {
            port: 2,
            code: Success,
        });
        harness.hci.handle_interrupt();
        assert_eq!(keyboard.events.lock().last().unwrap(), "detached 1");
        assert!(matches!(harness.hci.device(1), Err(Error::NoSuchSlot(1))));
        assert_eq!(
            harness.complete_next_command(Success, 1),
            Record::ResetDevice { slot: 1 }
        );
        assert_eq!(free_slots(&harness), vec![1]);

        // plugged back in, the slot is reused without Enable Slot
        connect(&harness, 2);
        assert_eq!(harness.pending_commands(), 1);
        assert!(matches!(
            harness.next_command().1,
            Record::AddressDevice { slot: 1, .. }
        ));
        assert!(free_slots(&harness).is_empty());
    }

    #[test]
    fn usb2_device_is_addressed_twice() {
        let harness = Harness::new();
        connect(&harness, 1);
        harness.complete_next_command(Success, 1);
        assert!(matches!(
            harness.complete_next_command(Success, 1),
            Record::AddressDevice {
                slot: 1,
                block_set_address: true,
                ..
            }
        ));
        assert_eq!(harness.hci.slot(1).unwrap().lock().speed, Speed::High);

        // a full speed device with 8 byte control packets
        let (setup, _) = harness.respond_control(1, &[18, 1, 0x00, 0x02, 0, 0, 0, 8]);
        assert_eq!(setup.length, 8);
        assert_eq!(harness.hci.slot(1).unwrap().lock().packet_size, 8);
        assert!(matches!(
            harness.complete_next_command(Success, 1),
            Record::EvaluateContext { slot: 1, .. }
        ));
        assert!(matches!(
            harness.complete_next_command(Success, 1),
            Record::AddressDevice {
                slot: 1,
                block_set_address: false,
                ..
            }
        ));
        assert_eq!(
            harness.hci.slot(1).unwrap().lock().state,
            DeviceState::Addressed
        );
        // no strings, so the addressing phase ends right after
        let device = [18, 1, 0x00, 0x02, 0, 0, 0, 8, 0x34, 0x12, 0x78, 0x56, 0, 1, 0, 0, 0, 1];
        let (setup, _) = harness.respond_control(1, &device);
        assert_eq!(setup, Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18));
        harness.complete_event(1, 1);
        assert_eq!(addressing(&harness), None);
    }

    #[test]
    fn addressing_queue_is_bounded() {
        let harness = Harness::new();
        let request = |port| NewDeviceRequest { port, parent: None };
        let root = PortId::root(2);
        harness.hci.request_new_device(request(root)).unwrap();
        // the port being addressed is not queued twice
        harness.hci.request_new_device(request(root)).unwrap();

        for port in 1..=15 {
            let port = root.child(port).unwrap();
            harness.hci.request_new_device(request(port)).unwrap();
        }
        harness
            .hci
            .request_new_device(request(PortId::root(1)))
            .unwrap();
        assert_eq!(harness.hci.cmd.lock().borrow().queued(), 16);
        assert!(matches!(
            harness.hci.request_new_device(request(PortId::root(3))),
            Err(Error::QueueFull)
        ));
        assert_eq!(harness.pending_commands(), 1);
    }

    /// A USB3 device with no strings: two descriptor reads end its
    /// addressing phase.
    fn finish_addressing_slot_1(harness: &Harness) {
        let device = [18, 1, 0x00, 0x03, 0, 0, 0, 9, 0x34, 0x12, 0x78, 0x56, 0, 1, 0, 0, 0, 1];
        harness.respond_control(1, &device[..8]);
        harness.respond_control(1, &device);
        harness.complete_event(1, 1);
    }

    #[test]
    fn queued_ports_are_addressed_in_order() {
        let harness = Harness::new();
        let request = |port| NewDeviceRequest { port, parent: None };
        address_on_port_2(&harness);
        let child = PortId::root(2).child(4).unwrap();
        harness.hci.request_new_device(request(child)).unwrap();
        harness
            .hci
            .request_new_device(request(PortId::root(1)))
            .unwrap();
        assert_eq!(harness.hci.cmd.lock().borrow().queued(), 2);

        finish_addressing_slot_1(&harness);
        assert_eq!(addressing(&harness), Some(child));
        assert!(matches!(
            harness.complete_next_command(TrbCompletionCode::NoSlotsAvailable, 0),
            Record::EnableSlot { .. }
        ));
        assert_eq!(addressing(&harness), Some(PortId::root(1)));
        assert!(matches!(
            harness.complete_next_command(TrbCompletionCode::NoSlotsAvailable, 0),
            Record::EnableSlot { .. }
        ));
        assert_eq!(addressing(&harness), None);
        assert_eq!(harness.pending_commands(), 0);
    }

    #[test]
    fn queued_port_is_not_queued_twice() {
        let harness = Harness::new();
        let request = |port| NewDeviceRequest { port, parent: None };
        harness
            .hci
            .request_new_device(request(PortId::root(2)))
            .unwrap();
        for _ in 0..3 {
            harness
                .hci
                .request_new_device(request(PortId::root(1)))
                .unwrap();
        }
        assert_eq!(harness.hci.cmd.lock().borrow().queued(), 1);

        harness.complete_next_command(TrbCompletionCode::NoSlotsAvailable, 0);
        assert_eq!(addressing(&harness), Some(PortId::root(1)));
        assert!(harness.hci.cmd.lock().borrow().waiting.is_empty());
        // a new request once it left the queue is the one being addressed
        harness
            .hci
            .request_new_device(request(PortId::root(1)))
            .unwrap();
        assert_eq!(harness.hci.cmd.lock().borrow().queued(), 0);
    }

    #[test]
    fn queued_port_with_a_device_is_skipped() {
        let harness = Harness::new();
        let request = |port| NewDeviceRequest { port, parent: None };
        address_on_port_2(&harness);
        finish_addressing_slot_1(&harness);
        assert_eq!(addressing(&harness), None);

        harness
            .hci
            .request_new_device(request(PortId::root(1)))
            .unwrap();
        harness
            .hci
            .request_new_device(request(PortId::root(2)))
            .unwrap();
        assert_eq!(harness.hci.cmd.lock().borrow().queued(), 1);

        assert!(matches!(
            harness.complete_next_command(TrbCompletionCode::NoSlotsAvailable, 0),
            Record::EnableSlot { .. }
        ));
        // slot 1 still holds the device on port 2
        assert_eq!(addressing(&harness), None);
        assert_eq!(harness.pending_commands(), 0);
    }

    #[test]
    fn failed_enable_slot_moves_to_the_next_port() {
        let harness = Harness::new();
        let request = |port| NewDeviceRequest { port, parent: None };
        harness
            .hci
            .request_new_device(request(PortId::root(2)))
            .unwrap();
        harness
            .hci
            .request_new_device(request(PortId::root(1)))
            .unwrap();

        harness.complete_next_command(TrbCompletionCode::NoSlotsAvailable, 0);
        assert_eq!(addressing(&harness), Some(PortId::root(1)));
        assert_eq!(harness.pending_commands(), 1);
        assert!(matches!(
            harness.next_command().1,
            Record::EnableSlot { .. }
        ));
    }

    #[test]
    fn malformed_descriptor_abandons_the_device() {
        let harness = Harness::new();
        address_on_port_2(&harness);
        harness.respond_control(1, &[18, 1, 0x00, 0x03]);

        assert_eq!(addressing(&harness), None);
        assert!(!harness.has_td(1, 1));
        assert_eq!(harness.hci.slot(1).unwrap().lock().phase, Phase::Detaching);
        assert_eq!(
            harness.complete_next_command(Success, 1),
            Record::ResetDevice { slot: 1 }
        );
        assert_eq!(free_slots(&harness), vec![1]);
        assert_eq!(harness.hci.slot(1).unwrap().lock().phase, Phase::Free);
    }

    #[test]
    fn stalled_control_transfer_abandons_the_device() {
        let harness = Harness::new();
        address_on_port_2(&harness);
        let td = harness.next_td(1, 1);
        let key = Harness::event_key(&td).unwrap();
        harness.transfer_event(1, 1, key, 0, TrbCompletionCode::Stall);

        assert_eq!(addressing(&harness), None);
        assert!(matches!(
            harness.next_command().1,
            Record::ResetDevice { slot: 1 }
        ));
    }

    #[test]
    fn hub_children_get_routes() {
        let harness = Harness::new();
        harness.ready_device(1, 2);
        let parent = |port| ParentPort {
            slot: 1,
            port,
            speed: Speed::High,
        };
        assert!(matches!(
            harness.hci.new_device(parent(16)),
            Err(Error::InvalidPort(16))
        ));
        assert!(matches!(
            harness.hci.new_device(ParentPort {
                slot: 2,
                ..parent(1)
            }),
            Err(Error::NoSuchSlot(2))
        ));

        harness.hci.new_device(parent(3)).unwrap();
        assert_eq!(addressing(&harness), Some(PortId::root(2).child(3).unwrap()));
        assert!(matches!(
            harness.next_command().1,
            Record::EnableSlot { .. }
        ));
    }

    #[test]
    fn unsupported_endpoints_are_rejected() {
        let harness = Harness::new();
        harness.ready_device(1, 2);
        let endpoint = |address, attributes| EndpointDescriptor {
            length: 7,
            kind: 5,
            address,
            attributes,
            max_packet_size: 64,
            interval: 1,
        };

        for endpoints in &[
            vec![endpoint(0x81, 1)],
            vec![endpoint(0x00, 0)],
            vec![endpoint(0x82, 2), endpoint(0x82, 3)],
        ] {
            assert!(matches!(
                harness.hci.configure_endpoints(1, None, endpoints),
                Err(Error::InvalidEndpoint(_))
            ));
        }
        assert_eq!(harness.pending_commands(), 0);

        harness
            .hci
            .configure_endpoints(1, None, &[endpoint(0x82, 2), endpoint(0x02, 2)])
            .unwrap();
        assert!(matches!(
            harness.next_command().1,
            Record::ConfigureEndpoint { slot: 1, .. }
        ));
        let dev = harness.hci.slot(1).unwrap().lock();
        assert!(dev.rings[5].is_some() && dev.rings[4].is_some());
    }
}
