//! A controller over plain memory for unit tests. Register writes land in a
//! leaked buffer, and the tests play the controller's part by reading the
//! rings and pushing events.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr;
use std::sync::{Arc, Once};

use common::cache::{CacheMaintenance, Coherent};
use common::dma::MemoryBlock;
use common::io::Io;

use super::context::CONTEXT_32;
use super::device::{DeviceState, Phase};
use super::trb::{Record, Trb, TrbCompletionCode, TrbFlags};
use super::{Registers, Xhci};
use crate::config::{ControllerConfig, PollConfig};
use crate::driver_interface::{PipeId, PortId};
use crate::usb::{Setup, Speed};

const REGS_SIZE: usize = 0x10000;
const PORTSC_BASE: usize = 0x420;
const DOORBELL_BASE: usize = 0x480;

static LOGGING: Once = Once::new();

fn logging() {
    LOGGING.call_once(|| {
        common::setup_logging(
            "usb",
            "host",
            "xhci-test",
            log::LevelFilter::Trace,
            log::LevelFilter::Trace,
        );
    });
}

/// Zeroed register window with the capability registers of a DWC3 host
/// port: 64 slots, one interrupter, two root ports, 32-byte contexts.
#[derive(Clone, Copy)]
pub(crate) struct RegisterBlock {
    base: *mut u8,
}

impl RegisterBlock {
    pub fn new() -> Self {
        let words = Box::leak(vec![0u64; REGS_SIZE / 8].into_boxed_slice());
        let block = Self {
            base: words.as_mut_ptr() as *mut u8,
        };
        block.write32(0x00, 0x0100_0020);
        block.write32(0x04, 64 | (1 << 8) | (2 << 24));
        block.write32(0x10, 1);
        block.write32(0x14, 0x480);
        block.write32(0x18, 0x440);
        // USBSTS: halted
        block.write32(0x24, 1);
        // PAGESIZE: 4K
        block.write32(0x28, 1);
        block
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= REGS_SIZE);
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    pub fn read64(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= REGS_SIZE);
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u64) }
    }

    pub fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= REGS_SIZE);
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }
}

pub(crate) struct Harness {
    pub hci: Xhci<CONTEXT_32>,
    pub block: RegisterBlock,
    /// Events written so far.
    produced: Cell<usize>,
    /// Consumer position and cycle on the command ring.
    command: Cell<(usize, bool)>,
    /// Consumer position and cycle per transfer ring.
    cursors: RefCell<HashMap<(u8, u8), (usize, bool)>>,
}

impl Harness {
    /// The embedded configuration with every wait cut down to a few
    /// polls without sleeping.
    pub fn config() -> ControllerConfig {
        let mut config = ControllerConfig::embedded();
        let fast = PollConfig::new(4, 0);
        let timing = &mut config.timing;
        timing.core_reset = fast;
        timing.controller_reset = fast;
        timing.legacy_handoff = fast;
        timing.run = fast;
        timing.usb2_port_reset = fast;
        timing.usb3_port_reset = fast;
        timing.phy_settle_ms = 0;
        timing.start_settle_ms = 0;
        config
    }

    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        Self::build(config, Arc::new(Coherent))
    }

    pub fn with_cache(cache: Arc<dyn CacheMaintenance>) -> Self {
        Self::build(Self::config(), cache)
    }

    fn build(config: ControllerConfig, cache: Arc<dyn CacheMaintenance>) -> Self {
        logging();
        let block = RegisterBlock::new();
        let registers = unsafe { Registers::map(block.base(), &config.controller) }.unwrap();
        let memory = MemoryBlock::identity(1 << 20, 0x10000).unwrap();
        let hci = Xhci::new(registers, memory, cache, config).unwrap();
        Self {
            hci,
            block,
            produced: Cell::new(0),
            command: Cell::new((0, true)),
            cursors: RefCell::new(HashMap::new()),
        }
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.block.read32(offset)
    }

    pub fn reg64(&self, offset: usize) -> u64 {
        self.block.read64(offset)
    }

    pub fn write_reg(&self, offset: usize, value: u32) {
        self.block.write32(offset, value)
    }

    pub fn set_portsc(&self, port: u8, value: u32) {
        self.write_reg(PORTSC_BASE + 16 * (usize::from(port) - 1), value);
    }

    /// Last value written to doorbell `target`.
    pub fn doorbell(&self, target: u8) -> u32 {
        self.reg(DOORBELL_BASE + 4 * usize::from(target))
    }

    /// Write one event where the controller would, with its cycle bit.
    pub fn push_raw(&self, trb: Trb) {
        let n = self.produced.get();
        let mut ring = self.hci.event_ring.lock();
        let segments = ring.segments.len();
        let trbs = ring.segments[0].len();
        let (segment, i) = ((n / trbs) % segments, n % trbs);
        let cycle = (n / (trbs * segments)) % 2 == 0;
        let control = (trb.control.read() & !1) | u32::from(cycle);
        ring.segments[segment][i].store(&Trb::new(trb.read_data(), trb.status.read(), control));
        self.produced.set(n + 1);
    }

    pub fn push_event(&self, record: Record) {
        self.push_raw(record.encode(false));
    }

    pub fn pending_commands(&self) -> usize {
        let guard = self.hci.cmd.lock();
        let state = guard.borrow();
        let (mut i, mut cycle) = self.command.get();
        let mut count = 0;
        loop {
            let trb = state.ring.read(i);
            if trb.cycle() != cycle {
                return count;
            }
            match Record::decode(&trb) {
                Ok(Record::Link { .. }) => {
                    i = 0;
                    cycle = !cycle;
                }
                _ => {
                    count += 1;
                    i += 1;
                }
            }
        }
    }

    /// Next command software queued, with its physical address.
    pub fn next_command(&self) -> (u64, Record) {
        let guard = self.hci.cmd.lock();
        let state = guard.borrow();
        let (mut i, mut cycle) = self.command.get();
        loop {
            let trb = state.ring.read(i);
            assert_eq!(trb.cycle(), cycle, "no command queued");
            let record = Record::decode(&trb).unwrap();
            if let Record::Link { .. } = record {
                i = 0;
                cycle = !cycle;
                continue;
            }
            self.command.set((i + 1, cycle));
            return (state.ring.phys_of(i), record);
        }
    }

    pub fn complete(&self, command: u64, code: TrbCompletionCode, slot: u8) -> usize {
        self.push_event(Record::CommandCompletion {
            command,
            parameter: 0,
            code,
            vf: 0,
            slot,
        });
        self.hci.handle_interrupt()
    }

    /// Complete the oldest queued command and run the event handler.
    pub fn complete_next_command(&self, code: TrbCompletionCode, slot: u8) -> Record {
        let (phys, record) = self.next_command();
        self.complete(phys, code, slot);
        record
    }

    pub fn transfer_event(
        &self,
        slot: u8,
        endpoint: u8,
        key: u64,
        length: u32,
        code: TrbCompletionCode,
    ) -> usize {
        self.push_event(Record::TransferEvent {
            pointer: key,
            length,
            code,
            event_data: true,
            endpoint,
            slot,
        });
        self.hci.handle_interrupt()
    }

    /// Forget the ring positions of `slot`, for when its rings were reset.
    pub fn reset_cursors(&self, slot: u8) {
        self.cursors.borrow_mut().retain(|&(s, _), _| s != slot);
    }

    pub fn has_td(&self, slot: u8, endpoint: u8) -> bool {
        let dev = self.hci.slot(slot).unwrap().lock();
        let ring = match dev.rings[usize::from(endpoint)].as_ref() {
            Some(ring) => ring,
            None => return false,
        };
        let (i, cycle) = self
            .cursors
            .borrow()
            .get(&(slot, endpoint))
            .copied()
            .unwrap_or((0, true));
        ring.read(i).cycle() == cycle
    }

    /// The next TD queued on a transfer ring, link TRBs left out.
    pub fn next_td(&self, slot: u8, endpoint: u8) -> Vec<Record> {
        let dev = self.hci.slot(slot).unwrap().lock();
        let ring = dev.rings[usize::from(endpoint)]
            .as_ref()
            .expect("endpoint has no ring");
        let mut cursors = self.cursors.borrow_mut();
        let cursor = cursors.entry((slot, endpoint)).or_insert((0, true));

        let mut td = Vec::new();
        loop {
            let (i, cycle) = *cursor;
            let trb = ring.read(i);
            assert_eq!(trb.cycle(), cycle, "no TD queued on slot {} endpoint {}", slot, endpoint);
            let record = Record::decode(&trb).unwrap();
            match record {
                Record::Link { .. } => {
                    *cursor = (0, !cycle);
                    continue;
                }
                Record::NoOp { .. } => {
                    *cursor = (i + 1, cycle);
                    continue;
                }
                _ => {}
            }
            *cursor = (i + 1, cycle);
            td.push(record);

            let last = match record {
                Record::EventData { .. } => true,
                Record::StatusStage { flags, .. } | Record::Normal { flags, .. } => {
                    !flags.contains(TrbFlags::CH)
                }
                _ => false,
            };
            if last {
                return td;
            }
        }
    }

    pub fn event_key(td: &[Record]) -> Option<u64> {
        td.iter().find_map(|record| match *record {
            Record::EventData { data, .. } => Some(data),
            _ => None,
        })
    }

    /// Act as the device on the control endpoint of `slot`: take the next
    /// TD, fill its IN data stage with `bytes` and report completion.
    pub fn respond_control(&self, slot: u8, bytes: &[u8]) -> (Setup, Option<u64>) {
        let td = self.next_td(slot, 1);
        let setup = match td[0] {
            Record::SetupStage { setup, .. } => setup,
            ref other => panic!("expected a setup stage, got {:?}", other),
        };
        let mut length = 0;
        for record in &td {
            if let Record::DataStage {
                buffer,
                length: requested,
                input,
                ..
            } = *record
            {
                length = bytes.len().min(requested as usize);
                if input {
                    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), buffer as *mut u8, length) };
                }
            }
        }
        let key = Self::event_key(&td);
        if let Some(key) = key {
            self.transfer_event(slot, 1, key, length as u32, TrbCompletionCode::Success);
        }
        (setup, key)
    }

    /// Complete a normal TD, writing `bytes` into it if it reads.
    pub fn respond(&self, slot: u8, endpoint: u8, bytes: &[u8]) -> Vec<Record> {
        let td = self.next_td(slot, endpoint);
        let mut length = 0;
        for record in &td {
            if let Record::Normal {
                buffer,
                length: requested,
                ..
            } = *record
            {
                length = bytes.len().min(requested as usize);
                unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), buffer as *mut u8, length) };
            }
        }
        let key = Self::event_key(&td).expect("TD without completion");
        self.transfer_event(slot, endpoint, key, length as u32, TrbCompletionCode::Success);
        td
    }

    /// Complete a bare event-data TD.
    pub fn complete_event(&self, slot: u8, endpoint: u8) {
        let td = self.next_td(slot, endpoint);
        assert_eq!(td.len(), 1, "expected a lone event data TRB, got {:?}", td);
        let key = Self::event_key(&td).unwrap();
        self.transfer_event(slot, endpoint, key, 0, TrbCompletionCode::Success);
    }

    /// Put a running device into `slot` without enumerating it.
    pub fn ready_device(&self, slot: u8, root_port: u8) -> PipeId {
        let ring = self.hci.new_transfer_ring().unwrap();
        let pipe = self.hci.open_control_pipe(slot).unwrap();
        let mut dev = self.hci.slot(slot).unwrap().lock();
        dev.rings[1] = Some(ring);
        dev.assign(PortId::root(root_port), None, Speed::Super, false);
        dev.phase = Phase::Ready;
        dev.state = DeviceState::Addressed;
        dev.control_pipe = Some(pipe);
        drop(dev);
        self.reset_cursors(slot);
        pipe
    }
}
