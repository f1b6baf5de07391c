use std::cell::RefCell;
use std::slice;
use std::sync::Arc;
use std::thread;

use common::cache::CacheMaintenance;
use common::dma::{BumpAllocator, DmaPool, MemoryBlock};
use common::io::Io;
use common::pool::Pool;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::config::{ControllerConfig, ControllerSection, DriverConfig, TimingSection};
use crate::driver_interface::{
    ClassDriver, DeviceInfo, ParentPort, PipeId, TransferCallback, TransferFuture,
    TransferRequest, UsbHost,
};
use crate::error::{Error, Result};
use crate::usb::{EndpointDescriptor, Setup, Speed};

use self::capability::CapabilityRegs;
use self::command::CommandState;
use self::context::{DeviceContextList, ScratchpadBufferArray, CONTEXT_64, CONTEXT_ALIGN};
use self::device::{DeviceSlot, Phase, Pipe};
use self::doorbell::Doorbell;
use self::dwc3::{CoreRevision, GlobalRegs, GLOBALS_REGS_START};
use self::event::EventRing;
use self::extended::{CapabilityId, ExtendedCapabilitiesIter, LegacySupport};
use self::operational::{
    OperationalRegs, CRCR_CA, CRCR_CRR, DN_CTRL_ALL, USB_CMD_HCRST, USB_CMD_HSEE, USB_CMD_INTE,
    USB_CMD_RS,
};
use self::port::{Port, PortFlags};
use self::ring::Ring;
use self::runtime::{RuntimeRegs, ERDP_EHB, IMAN_IE, IMAN_IP};
use self::transaction::{Completion, Transaction};

pub use self::context::CONTEXT_32;
pub use self::trb::{Record, TransferKind, Trb, TrbCompletionCode, TrbFlags, TrbType};

mod capability;
mod command;
mod context;
mod device;
mod device_enumerator;
mod doorbell;
mod dwc3;
mod event;
mod extended;
mod irq_reactor;
mod operational;
mod port;
mod ring;
mod runtime;
mod transaction;
mod trb;

#[cfg(test)]
pub(crate) mod harness;

/// Offset of the first port register set from the operational registers.
const PORT_REGS_OFFSET: usize = 0x400;

/// The controller's register window, carved into its register blocks.
pub struct Registers {
    cap: &'static CapabilityRegs,
    op: &'static mut OperationalRegs,
    ports: &'static mut [Port],
    dbs: &'static mut [Doorbell],
    run: &'static mut RuntimeRegs,
    globals: &'static mut GlobalRegs,
    base: *const u8,
}

fn check_offset(what: &'static str, found: usize, expected: Option<usize>) -> Result<()> {
    match expected {
        Some(expected) if expected != found => {
            error!("{} is {:#x}, expected {:#x}", what, found, expected);
            Err(Error::RegisterLayout {
                what,
                found,
                expected,
            })
        }
        _ => Ok(()),
    }
}

impl Registers {
    /// Locate every register block from the capability registers.
    ///
    /// # Safety
    /// `base` must point at the mapped register window of the controller,
    /// covering the DWC3 global registers, and stay mapped for the rest of the
    /// program. Nothing else may access the window.
    pub unsafe fn map(base: *mut u8, config: &ControllerSection) -> Result<Self> {
        let cap = &*(base as *const CapabilityRegs);

        let op_offset = usize::from(cap.len.read());
        let db_offset = cap.doorbell_offset();
        let rt_offset = cap.runtime_offset();
        check_offset("operational offset", op_offset, config.expected_operational_offset)?;
        check_offset("doorbell offset", db_offset, config.expected_doorbell_offset)?;
        check_offset("runtime offset", rt_offset, config.expected_runtime_offset)?;

        debug!("CAP REGS BASE {:p}", base);
        debug!("OP REGS BASE {:p} (+{:#x})", base.add(op_offset), op_offset);
        debug!("DB REGS BASE {:p} (+{:#x})", base.add(db_offset), db_offset);
        debug!("RT REGS BASE {:p} (+{:#x})", base.add(rt_offset), rt_offset);

        let op = &mut *(base.add(op_offset) as *mut OperationalRegs);
        let ports = slice::from_raw_parts_mut(
            base.add(op_offset + PORT_REGS_OFFSET) as *mut Port,
            usize::from(cap.max_ports()),
        );
        // doorbell 0 is the command ring, then one per slot
        let dbs = slice::from_raw_parts_mut(
            base.add(db_offset) as *mut Doorbell,
            usize::from(cap.max_slots()) + 1,
        );
        let run = &mut *(base.add(rt_offset) as *mut RuntimeRegs);
        let globals = &mut *(base.add(GLOBALS_REGS_START) as *mut GlobalRegs);

        Ok(Self {
            cap,
            op,
            ports,
            dbs,
            run,
            globals,
            base,
        })
    }

    /// Bring the core and the xHC back to their power-on state: stop the
    /// command ring, soft reset the DWC3 core, reset the xHC, then the PHYs.
    pub fn reset(&mut self, timing: &TimingSection) -> Result<CoreRevision> {
        if self.op.crcr.read() & CRCR_CRR != 0 {
            self.op.crcr.write(CRCR_CA);
            let timeout = timing.run.timeout();
            while self.op.crcr.read() & CRCR_CRR != 0 {
                if timeout.run().is_err() {
                    warn!("command ring did not stop, resetting anyway");
                    break;
                }
            }
        }

        let revision = self.globals.reset(timing)?;

        if !self.op.halted() {
            self.op.usb_cmd.writef(USB_CMD_RS, false);
            let timeout = timing.run.timeout();
            while !self.op.halted() {
                timeout.run().map_err(|()| {
                    error!("timeout on USBSTS_HCH");
                    Error::Timeout("controller halt")
                })?;
            }
        }

        debug!("xHC reset");
        self.op.usb_cmd.writef(USB_CMD_HCRST, true);
        let timeout = timing.controller_reset.timeout();
        while self.op.usb_cmd.readf(USB_CMD_HCRST) || self.op.not_ready() {
            timeout.run().map_err(|()| {
                error!("timeout on USBCMD_HCRST");
                Error::Timeout("controller reset")
            })?;
        }

        self.globals.phy_reset(timing.phy_settle());
        Ok(revision)
    }
}

pub struct Xhci<const N: usize> {
    pub(crate) config: ControllerConfig,
    pub(crate) cache: Arc<dyn CacheMaintenance>,

    cap: &'static CapabilityRegs,
    pub(crate) op: Mutex<&'static mut OperationalRegs>,
    pub(crate) ports: Mutex<&'static mut [Port]>,
    pub(crate) dbs: Mutex<&'static mut [Doorbell]>,
    pub(crate) run: Mutex<&'static mut RuntimeRegs>,

    pub(crate) cmd: ReentrantMutex<RefCell<CommandState>>,
    pub(crate) event_ring: Mutex<EventRing>,
    pub(crate) contexts: Mutex<DeviceContextList<N>>,
    scratchpad: Option<ScratchpadBufferArray>,
    allocator: Mutex<BumpAllocator>,
    pub(crate) buffers: Mutex<DmaPool>,
    pub(crate) transactions: Mutex<Pool<Transaction>>,
    pub(crate) pipes: Mutex<Pool<Pipe>>,
    /// Slot `id` lives at index `id - 1`.
    pub(crate) slots: Box<[Mutex<DeviceSlot>]>,
    drivers: RwLock<Vec<(DriverConfig, Arc<dyn ClassDriver>)>>,
}

unsafe impl<const N: usize> Send for Xhci<N> {}
unsafe impl<const N: usize> Sync for Xhci<N> {}

impl<const N: usize> Xhci<N> {
    /// Take over a halted controller and program its rings and contexts.
    /// All DMA structures are carved out of `memory`.
    pub fn new(
        registers: Registers,
        memory: MemoryBlock,
        cache: Arc<dyn CacheMaintenance>,
        config: ControllerConfig,
    ) -> Result<Self> {
        let Registers {
            cap,
            op,
            ports,
            dbs,
            run,
            globals,
            base,
        } = registers;

        if !op.halted() {
            return Err(Error::NotHalted);
        }
        let csz = cap.csz();
        if csz != (N == CONTEXT_64) {
            return Err(Error::RegisterLayout {
                what: "context size",
                found: if csz { 64 } else { 32 },
                expected: if N == CONTEXT_64 { 64 } else { 32 },
            });
        }

        let max_slots = cap.max_slots().min(config.controller.max_slots);
        let page_size = op.page_size();
        debug!(
            "xHCI {:x}: {} of {} slots, {} ports, {} interrupters, page size {:#x}, context {} bytes, 64-bit {}",
            cap.hci_ver.read(),
            max_slots,
            cap.max_slots(),
            cap.max_ports(),
            cap.max_interrupters(),
            page_size,
            if csz { 64 } else { 32 },
            cap.ac64(),
        );

        let mut allocator = BumpAllocator::new(memory);
        let mut contexts = DeviceContextList::<N>::new(&mut allocator, max_slots)?;
        let scratchpad = match cap.max_scratchpad_bufs() {
            0 => None,
            count => {
                let array = ScratchpadBufferArray::new(&mut allocator, count, page_size)?;
                array.publish(&*cache);
                contexts.set_scratchpad(array.register());
                debug!("{} scratchpad buffers at {:#x}", count, array.register());
                Some(array)
            }
        };
        contexts.publish(&*cache);

        let segments = config
            .controller
            .event_ring_segments
            .clamp(1, cap.max_erst_entries() as usize);
        if segments != config.controller.event_ring_segments {
            warn!(
                "event ring limited to {} segments by the controller",
                segments
            );
        }
        let event_ring = EventRing::new(
            &mut allocator,
            segments,
            config.controller.event_ring_trbs,
            Arc::clone(&cache),
        )?;
        let command_ring = Ring::new(
            &mut allocator,
            config.controller.command_ring_trbs,
            true,
            Arc::clone(&cache),
        )?;
        let buffers = DmaPool::new(
            &mut allocator,
            config.controller.dma_buffers,
            config.controller.dma_buffer_size,
            CONTEXT_ALIGN,
        )
        .ok_or(Error::OutOfMemory(
            config.controller.dma_buffers * config.controller.dma_buffer_size,
        ))?;

        let ext = cap.ext_caps_offset();
        if ext != 0 {
            for (reg, id) in unsafe { ExtendedCapabilitiesIter::new(base.add(ext)) } {
                if id != CapabilityId::UsbLegacySupport as u8 {
                    continue;
                }
                let legacy = unsafe { &mut *(reg.as_ptr() as *mut LegacySupport) };
                legacy.request_ownership();
                let timeout = config.timing.legacy_handoff.timeout();
                while !legacy.os_owned() {
                    if timeout.run().is_err() {
                        warn!("firmware did not release the controller, taking it anyway");
                        break;
                    }
                }
            }
        }

        globals.set_host_mode();
        globals.set_burst_request_info();

        op.set_max_slots_enabled(max_slots);
        op.dcbaap.write(contexts.dcbaap());
        op.crcr.write(command_ring.register());
        op.dn_ctrl.write(DN_CTRL_ALL);
        debug!(
            "DCBAAP {:#x} CRCR {:#x}",
            contexts.dcbaap(),
            command_ring.register()
        );

        let int = &mut run.ints[0];
        int.iman.write(IMAN_IE | IMAN_IP);
        int.imod.write(0);
        int.erstsz.write(event_ring.erstsz());
        int.erdp.write(event_ring.erdp() | ERDP_EHB);
        int.erstba.write(event_ring.erstba());

        let sts = op.usb_sts.read();
        op.ack_status(sts);

        let slots = (1..=max_slots)
            .map(|id| Mutex::new(DeviceSlot::new(id)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            cmd: ReentrantMutex::new(RefCell::new(CommandState::new(
                command_ring,
                config.controller.new_device_queue,
            ))),
            event_ring: Mutex::new(event_ring),
            contexts: Mutex::new(contexts),
            scratchpad,
            allocator: Mutex::new(allocator),
            buffers: Mutex::new(buffers),
            transactions: Mutex::new(Pool::with_capacity(config.controller.transactions)),
            pipes: Mutex::new(Pool::with_capacity(config.controller.pipes)),
            slots,
            drivers: RwLock::new(Vec::new()),
            cap,
            op: Mutex::new(op),
            ports: Mutex::new(ports),
            dbs: Mutex::new(dbs),
            run: Mutex::new(run),
            cache,
            config,
        })
    }

    /// Set Run/Stop and wait for the controller to leave halt.
    pub fn start(&self) -> Result<()> {
        let mut op = self.op.lock();
        op.usb_cmd
            .writef(USB_CMD_RS | USB_CMD_INTE | USB_CMD_HSEE, true);
        thread::sleep(self.config.timing.start_settle());

        let timeout = self.config.timing.run.timeout();
        while op.halted() || op.not_ready() {
            timeout.run().map_err(|()| {
                error!("timeout on USBSTS_HCH");
                Error::Timeout("controller start")
            })?;
        }
        info!(
            "xHC running with {} slots and {} ports",
            self.slots.len(),
            self.cap.max_ports()
        );
        Ok(())
    }

    /// Reset root port `port` and wait for Port Reset Change.
    pub fn reset_port(&self, port: u8) -> Result<()> {
        let index = usize::from(port)
            .checked_sub(1)
            .ok_or(Error::InvalidPort(port))?;
        let poll = if port == self.config.controller.usb2_root_port {
            &self.config.timing.usb2_port_reset
        } else {
            &self.config.timing.usb3_port_reset
        };

        let mut ports = self.ports.lock();
        let regs = ports.get_mut(index).ok_or(Error::InvalidPort(port))?;
        debug!("port {}: reset, PORTSC {:#010x}", port, regs.read());
        regs.set_pr();

        let timeout = poll.timeout();
        while !regs.flags().contains(PortFlags::PRC) {
            timeout.run().map_err(|()| {
                warn!("port {}: timeout on PORTSC_PRC", port);
                Error::Timeout("port reset")
            })?;
        }
        regs.clear_prc();
        if !regs.flags().contains(PortFlags::PED) {
            warn!("port {}: not enabled after reset", port);
        }
        Ok(())
    }

    /// Speed of the device on root port `port`, if the port reports one.
    pub fn port_speed(&self, port: u8) -> Option<Speed> {
        let index = usize::from(port).checked_sub(1)?;
        self.ports.lock().get(index)?.speed()
    }

    /// Look at every root port, as if each had reported a status change.
    /// Used once after start for devices connected before the controller ran.
    pub fn poll_ports(&self) {
        let count = self.ports.lock().len();
        for port in 1..=count as u8 {
            let connected = self.ports.lock()[usize::from(port) - 1]
                .flags()
                .intersects(PortFlags::CCS | PortFlags::CSC);
            if connected {
                self.port_changed(port);
            }
        }
    }

    /// Make `driver` available under `name`. Returns false if no configured
    /// driver entry names it, in which case it is never bound.
    pub fn register_class_driver(&self, name: &str, driver: Arc<dyn ClassDriver>) -> bool {
        let mut drivers = self.drivers.write();
        drivers.retain(|(entry, _)| entry.name != name);
        for entry in self.config.drivers.iter().filter(|entry| entry.name == name) {
            drivers.push((entry.clone(), Arc::clone(&driver)));
        }
        let known = drivers.iter().any(|(entry, _)| entry.name == name);
        if known {
            debug!("class driver {} registered", name);
        } else {
            warn!("class driver {} has no configured class", name);
        }
        known
    }

    pub(crate) fn find_driver(
        &self,
        class: u8,
        sub_class: u8,
    ) -> Option<(String, Arc<dyn ClassDriver>)> {
        self.drivers
            .read()
            .iter()
            .find(|(entry, _)| entry.matches(class, sub_class))
            .map(|(entry, driver)| (entry.name.clone(), Arc::clone(driver)))
    }

    pub(crate) fn slot(&self, id: u8) -> Result<&Mutex<DeviceSlot>> {
        usize::from(id)
            .checked_sub(1)
            .and_then(|index| self.slots.get(index))
            .ok_or(Error::NoSuchSlot(id))
    }

    pub(crate) fn new_transfer_ring(&self) -> Result<Ring> {
        Ring::new(
            &mut self.allocator.lock(),
            self.config.controller.transfer_ring_trbs,
            true,
            Arc::clone(&self.cache),
        )
    }

    pub fn has_scratchpad(&self) -> bool {
        self.scratchpad.is_some()
    }
}

impl<const N: usize> UsbHost for Xhci<N> {
    fn device(&self, slot: u8) -> Result<DeviceInfo> {
        let dev = self.slot(slot)?.lock();
        if !dev.in_use() || dev.phase == Phase::Detaching {
            return Err(Error::NoSuchSlot(slot));
        }
        Ok(dev.info())
    }

    fn new_device(&self, parent: ParentPort) -> Result<()> {
        self.new_hub_device(parent)
    }

    fn detach_device(&self, slot: u8) -> Result<()> {
        let port = {
            let dev = self.slot(slot)?.lock();
            if !dev.in_use() {
                return Err(Error::NoSuchSlot(slot));
            }
            dev.port
        };
        self.detach_tree(port);
        Ok(())
    }

    fn fetch_configuration(&self, slot: u8) -> Result<()> {
        Xhci::fetch_configuration(self, slot)
    }

    fn configure_endpoints(
        &self,
        slot: u8,
        hub_ports: Option<u8>,
        endpoints: &[EndpointDescriptor],
    ) -> Result<()> {
        Xhci::configure_endpoints(self, slot, hub_ports, endpoints)
    }

    fn control_pipe(&self, slot: u8) -> Result<PipeId> {
        let dev = self.slot(slot)?.lock();
        if !dev.in_use() {
            return Err(Error::NoSuchSlot(slot));
        }
        dev.control_pipe.ok_or(Error::NoSuchSlot(slot))
    }

    fn open_pipe(&self, slot: u8, address: u8) -> Result<PipeId> {
        self.open_endpoint_pipe(slot, address)
    }

    fn close_pipe(&self, pipe: PipeId) -> Result<()> {
        self.release_pipe(pipe)
    }

    fn post_control(
        &self,
        pipe: PipeId,
        setup: Setup,
        data: &[u8],
        arg: u64,
        callback: Option<TransferCallback>,
    ) -> Result<()> {
        let pipe = self.control_on(pipe)?;
        self.submit_control(
            pipe.slot,
            pipe.endpoint,
            setup,
            data,
            callback.map(Completion::Callback),
            arg,
        )
    }

    fn post_transfer(
        &self,
        pipe: PipeId,
        request: TransferRequest<'_>,
        arg: u64,
        callback: TransferCallback,
    ) -> Result<()> {
        let pipe = self.pipe(pipe)?;
        self.submit_normal(pipe, request, Completion::Callback(callback), arg)
    }

    fn post_event(&self, pipe: PipeId, arg: u64, callback: TransferCallback) -> Result<()> {
        let pipe = self.pipe(pipe)?;
        self.submit_event(pipe.slot, pipe.endpoint, Completion::Callback(callback), arg)
    }

    fn control(&self, pipe: PipeId, setup: Setup, data: &[u8]) -> Result<TransferFuture> {
        self.control_future(pipe, setup, data)
    }

    fn transfer(&self, pipe: PipeId, request: TransferRequest<'_>) -> Result<TransferFuture> {
        self.transfer_future(pipe, request)
    }

    fn sync(&self, pipe: PipeId) -> Result<TransferFuture> {
        self.sync_future(pipe)
    }
}

#[cfg(test)]
mod test {
    use super::harness::{Harness, RegisterBlock};
    use super::*;
    use common::cache::Coherent;

    struct Nothing;

    impl ClassDriver for Nothing {
        fn configuration_ready(
            &self,
            _host: &dyn UsbHost,
            _device: &DeviceInfo,
            _configuration: &crate::usb::Configuration,
            _interface: Option<u8>,
        ) {
        }

        fn interfaces_enabled(&self, _host: &dyn UsbHost, _device: &DeviceInfo) {}
    }

    #[test]
    fn map_checks_the_layout() {
        let block = RegisterBlock::new();
        let config = Harness::config();
        let registers = unsafe { Registers::map(block.base(), &config.controller) }.unwrap();
        assert_eq!(registers.ports.len(), 2);
        assert_eq!(registers.dbs.len(), 65);
        assert_eq!(
            &*registers.run as *const RuntimeRegs as usize,
            block.base() as usize + 0x440
        );

        let mut config = Harness::config();
        config.controller.expected_doorbell_offset = Some(0x400);
        assert!(matches!(
            unsafe { Registers::map(block.base(), &config.controller) },
            Err(Error::RegisterLayout {
                what: "doorbell offset",
                found: 0x480,
                expected: 0x400
            })
        ));
    }

    #[test]
    fn reset_is_bounded() {
        let block = RegisterBlock::new();
        let config = Harness::config();
        let mut registers = unsafe { Registers::map(block.base(), &config.controller) }.unwrap();
        // the fake core never clears its soft reset bit
        assert!(matches!(
            registers.reset(&config.timing),
            Err(Error::Timeout("DWC3 core soft reset"))
        ));
    }

    #[test]
    fn running_controller_is_rejected() {
        let block = RegisterBlock::new();
        block.write32(0x24, 0);
        let config = Harness::config();
        let registers = unsafe { Registers::map(block.base(), &config.controller) }.unwrap();
        let memory = MemoryBlock::identity(1 << 20, 0x10000).unwrap();
        assert!(matches!(
            Xhci::<CONTEXT_32>::new(registers, memory, Arc::new(Coherent), config),
            Err(Error::NotHalted)
        ));
    }

    #[test]
    fn init_programs_the_controller() {
        let harness = Harness::new();
        let dcbaap = harness.hci.contexts.lock().dcbaap();
        assert_eq!(harness.reg64(0x50), dcbaap);
        // command ring pointer with the cycle bit
        assert_eq!(harness.reg64(0x38) & 1, 1);
        assert_eq!(harness.reg(0x58) & 0xFF, 64);
        assert_eq!(harness.reg(0x34), DN_CTRL_ALL);
        assert_eq!(harness.reg(0x460) & IMAN_IE, IMAN_IE);
        assert_eq!(harness.reg(0x468), 1);
        assert_eq!(harness.reg64(0x478) & ERDP_EHB, ERDP_EHB);
        assert!(!harness.hci.has_scratchpad());

        harness.hci.start().unwrap();
        assert_eq!(harness.reg(0x20) & USB_CMD_RS, USB_CMD_RS);
    }

    #[test]
    fn start_times_out_while_halted() {
        let harness = Harness::new();
        harness.write_reg(0x24, 1);
        assert!(matches!(
            harness.hci.start(),
            Err(Error::Timeout("controller start"))
        ));
    }

    #[test]
    fn port_reset_waits_for_prc() {
        let harness = Harness::new();
        assert!(matches!(
            harness.hci.reset_port(2),
            Err(Error::Timeout("port reset"))
        ));
        assert!(matches!(harness.hci.reset_port(0), Err(Error::InvalidPort(0))));
        assert!(matches!(harness.hci.reset_port(3), Err(Error::InvalidPort(3))));

        // PR was requested even though the fake port never completes it
        assert_ne!(harness.reg(0x430) & PortFlags::PR.bits(), 0);
        assert_eq!(harness.hci.port_speed(2), None);
    }

    #[test]
    fn drivers_bind_by_configured_class() {
        let harness = Harness::new();
        assert!(harness.hci.register_class_driver("usbhid", Arc::new(Nothing)));
        assert!(!harness.hci.register_class_driver("storage", Arc::new(Nothing)));
        assert_eq!(
            harness.hci.find_driver(3, 1).map(|(name, _)| name),
            Some("usbhid".to_string())
        );
        assert!(harness.hci.find_driver(9, 0).is_none());
        assert!(harness.hci.find_driver(8, 6).is_none());
    }

    #[test]
    fn unused_slots_are_not_devices() {
        let harness = Harness::new();
        assert!(matches!(harness.hci.device(1), Err(Error::NoSuchSlot(1))));
        assert!(matches!(harness.hci.device(0), Err(Error::NoSuchSlot(0))));
        assert!(matches!(harness.hci.device(65), Err(Error::NoSuchSlot(65))));
        assert!(matches!(harness.hci.control_pipe(1), Err(Error::NoSuchSlot(1))));
    }
}
