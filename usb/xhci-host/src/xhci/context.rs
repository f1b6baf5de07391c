use common::cache::CacheMaintenance;
use common::dma::{BumpAllocator, Dma};
use common::io::{Io, Mmio};
use log::debug;
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::usb::{EndpointDescriptor, EndpointTy, Speed, SuperSpeedCompanionDescriptor};

pub const CONTEXT_32: usize = 0;
pub const CONTEXT_64: usize = 1;

/// Device and input contexts must sit on 64-byte boundaries.
pub const CONTEXT_ALIGN: usize = 64;

#[repr(C)]
struct Rsvd64<const N: usize>([[Mmio<u32>; 8]; N]);

#[repr(C)]
pub struct SlotContext<const N: usize> {
    pub a: Mmio<u32>,
    pub b: Mmio<u32>,
    pub c: Mmio<u32>,
    pub d: Mmio<u32>,
    _rsvd: [Mmio<u32>; 4],
    _rsvd64: Rsvd64<N>,
}

pub const SLOT_CONTEXT_ROUTE_MASK: u32 = 0x000F_FFFF;
pub const SLOT_CONTEXT_SPEED_SHIFT: u8 = 20;
pub const SLOT_CONTEXT_SPEED_MASK: u32 = 0x00F0_0000;
pub const SLOT_CONTEXT_MTT_BIT: u32 = 1 << 25;
pub const SLOT_CONTEXT_HUB_BIT: u32 = 1 << 26;
pub const SLOT_CONTEXT_ENTRIES_SHIFT: u8 = 27;
pub const SLOT_CONTEXT_ENTRIES_MASK: u32 = 0xF800_0000;

pub const SLOT_CONTEXT_ROOT_PORT_SHIFT: u8 = 16;
pub const SLOT_CONTEXT_ROOT_PORT_MASK: u32 = 0x00FF_0000;
pub const SLOT_CONTEXT_NUM_PORTS_SHIFT: u8 = 24;
pub const SLOT_CONTEXT_NUM_PORTS_MASK: u32 = 0xFF00_0000;

pub const SLOT_CONTEXT_TT_HUB_SLOT_MASK: u32 = 0x0000_00FF;
pub const SLOT_CONTEXT_TT_PORT_SHIFT: u8 = 8;
pub const SLOT_CONTEXT_TT_PORT_MASK: u32 = 0x0000_FF00;

pub const SLOT_CONTEXT_ADDRESS_MASK: u32 = 0x0000_00FF;
pub const SLOT_CONTEXT_STATE_MASK: u32 = 0xF800_0000;
pub const SLOT_CONTEXT_STATE_SHIFT: u8 = 27;

/// Slot state as the controller reports it in the output slot context.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    EnabledOrDisabled = 0,
    Default = 1,
    Addressed = 2,
    Configured = 3,
    Reserved,
}

fn set_field(reg: &mut Mmio<u32>, mask: u32, shift: u8, value: u32) {
    let old = reg.read() & !mask;
    reg.write(old | ((value << shift) & mask));
}

impl<const N: usize> SlotContext<N> {
    pub fn set_route(&mut self, route: u32) {
        set_field(&mut self.a, SLOT_CONTEXT_ROUTE_MASK, 0, route);
    }
    pub fn set_speed(&mut self, speed: Speed) {
        set_field(
            &mut self.a,
            SLOT_CONTEXT_SPEED_MASK,
            SLOT_CONTEXT_SPEED_SHIFT,
            speed as u32,
        );
    }
    pub fn set_context_entries(&mut self, entries: u8) {
        set_field(
            &mut self.a,
            SLOT_CONTEXT_ENTRIES_MASK,
            SLOT_CONTEXT_ENTRIES_SHIFT,
            u32::from(entries),
        );
    }
    pub fn context_entries(&self) -> u8 {
        ((self.a.read() & SLOT_CONTEXT_ENTRIES_MASK) >> SLOT_CONTEXT_ENTRIES_SHIFT) as u8
    }
    /// Mark the slot as a hub with `ports` downstream ports.
    pub fn set_hub(&mut self, ports: u8, multi_tt: bool) {
        self.a.writef(SLOT_CONTEXT_HUB_BIT, ports > 0);
        self.a.writef(SLOT_CONTEXT_MTT_BIT, ports > 0 && multi_tt);
        set_field(
            &mut self.b,
            SLOT_CONTEXT_NUM_PORTS_MASK,
            SLOT_CONTEXT_NUM_PORTS_SHIFT,
            u32::from(ports),
        );
    }
    pub fn set_root_port(&mut self, port: u8) {
        set_field(
            &mut self.b,
            SLOT_CONTEXT_ROOT_PORT_MASK,
            SLOT_CONTEXT_ROOT_PORT_SHIFT,
            u32::from(port),
        );
    }
    /// Transaction translator of a low/full speed device behind a high speed hub.
    pub fn set_parent_hub(&mut self, hub_slot: u8, hub_port: u8) {
        set_field(&mut self.c, SLOT_CONTEXT_TT_HUB_SLOT_MASK, 0, u32::from(hub_slot));
        set_field(
            &mut self.c,
            SLOT_CONTEXT_TT_PORT_MASK,
            SLOT_CONTEXT_TT_PORT_SHIFT,
            u32::from(hub_port),
        );
    }
    pub fn device_address(&self) -> u8 {
        (self.d.read() & SLOT_CONTEXT_ADDRESS_MASK) as u8
    }
    pub fn state(&self) -> SlotState {
        match (self.d.read() & SLOT_CONTEXT_STATE_MASK) >> SLOT_CONTEXT_STATE_SHIFT {
            0 => SlotState::EnabledOrDisabled,
            1 => SlotState::Default,
            2 => SlotState::Addressed,
            3 => SlotState::Configured,
            _ => SlotState::Reserved,
        }
    }
}

#[repr(C)]
pub struct EndpointContext<const N: usize> {
    pub a: Mmio<u32>,
    pub b: Mmio<u32>,
    pub trl: Mmio<u32>,
    pub trh: Mmio<u32>,
    pub c: Mmio<u32>,
    _rsvd: [Mmio<u32>; 3],
    _rsvd64: Rsvd64<N>,
}

pub const ENDPOINT_CONTEXT_STATUS_MASK: u32 = 0x7;
pub const ENDPOINT_CONTEXT_MULT_SHIFT: u8 = 8;
pub const ENDPOINT_CONTEXT_INTERVAL_SHIFT: u8 = 16;
pub const ENDPOINT_CONTEXT_ESIT_HI_SHIFT: u8 = 24;

pub const ENDPOINT_CONTEXT_CERR_SHIFT: u8 = 1;
pub const ENDPOINT_CONTEXT_TYPE_SHIFT: u8 = 3;
pub const ENDPOINT_CONTEXT_BURST_SHIFT: u8 = 8;
pub const ENDPOINT_CONTEXT_MPS_SHIFT: u8 = 16;
pub const ENDPOINT_CONTEXT_MPS_MASK: u32 = 0xFFFF_0000;

pub const ENDPOINT_CONTEXT_ESIT_LO_SHIFT: u8 = 16;

/// Retries before the controller halts a failing endpoint.
pub const ENDPOINT_ERROR_COUNT: u32 = 3;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointState {
    Disabled = 0,
    Running = 1,
    Halted = 2,
    Stopped = 3,
    Error = 4,
    Reserved,
}

/// Endpoint Type field of the endpoint context.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointType {
    NotValid = 0,
    IsochOut,
    BulkOut,
    InterruptOut,
    Control,
    IsochIn,
    BulkIn,
    InterruptIn,
}

impl EndpointType {
    pub fn new(ty: EndpointTy, input: bool) -> Self {
        match (ty, input) {
            (EndpointTy::Ctrl, _) => EndpointType::Control,
            (EndpointTy::Isoch, false) => EndpointType::IsochOut,
            (EndpointTy::Isoch, true) => EndpointType::IsochIn,
            (EndpointTy::Bulk, false) => EndpointType::BulkOut,
            (EndpointTy::Bulk, true) => EndpointType::BulkIn,
            (EndpointTy::Interrupt, false) => EndpointType::InterruptOut,
            (EndpointTy::Interrupt, true) => EndpointType::InterruptIn,
        }
    }
}

/// Everything the endpoint context needs at configure time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndpointSetup {
    pub ty: EndpointType,
    pub max_packet_size: u16,
    pub max_burst: u8,
    pub interval: u8,
    pub max_esit_payload: u32,
    pub average_trb_length: u16,
    /// Ring base physical address ORed with the dequeue cycle state.
    pub dequeue: u64,
}

impl<const N: usize> EndpointContext<N> {
    pub fn state(&self) -> EndpointState {
        match self.a.read() & ENDPOINT_CONTEXT_STATUS_MASK {
            0 => EndpointState::Disabled,
            1 => EndpointState::Running,
            2 => EndpointState::Halted,
            3 => EndpointState::Stopped,
            4 => EndpointState::Error,
            _ => EndpointState::Reserved,
        }
    }

    pub fn configure(&mut self, setup: &EndpointSetup) {
        self.a.write(
            (u32::from(setup.interval) << ENDPOINT_CONTEXT_INTERVAL_SHIFT)
                | ((setup.max_esit_payload >> 16) << ENDPOINT_CONTEXT_ESIT_HI_SHIFT),
        );
        self.b.write(
            (ENDPOINT_ERROR_COUNT << ENDPOINT_CONTEXT_CERR_SHIFT)
                | ((setup.ty as u32) << ENDPOINT_CONTEXT_TYPE_SHIFT)
                | (u32::from(setup.max_burst) << ENDPOINT_CONTEXT_BURST_SHIFT)
                | (u32::from(setup.max_packet_size) << ENDPOINT_CONTEXT_MPS_SHIFT),
        );
        self.set_dequeue(setup.dequeue);
        self.c.write(
            u32::from(setup.average_trb_length)
                | ((setup.max_esit_payload & 0xFFFF) << ENDPOINT_CONTEXT_ESIT_LO_SHIFT),
        );
    }

    pub fn set_dequeue(&mut self, dequeue: u64) {
        self.trl.write(dequeue as u32);
        self.trh.write((dequeue >> 32) as u32);
    }

    pub fn dequeue(&self) -> u64 {
        u64::from(self.trl.read()) | (u64::from(self.trh.read()) << 32)
    }

    pub fn max_packet_size(&self) -> u16 {
        (self.b.read() >> ENDPOINT_CONTEXT_MPS_SHIFT) as u16
    }

    pub fn set_max_packet_size(&mut self, size: u16) {
        set_field(
            &mut self.b,
            ENDPOINT_CONTEXT_MPS_MASK,
            ENDPOINT_CONTEXT_MPS_SHIFT,
            u32::from(size),
        );
    }
}

#[repr(C)]
pub struct DeviceContext<const N: usize> {
    pub slot: SlotContext<N>,
    pub endpoints: [EndpointContext<N>; 31],
}

impl<const N: usize> DeviceContext<N> {
    /// Endpoint context for device context index `dci` (1 is the control endpoint).
    pub fn endpoint(&self, dci: u8) -> &EndpointContext<N> {
        &self.endpoints[usize::from(dci) - 1]
    }
    pub fn endpoint_mut(&mut self, dci: u8) -> &mut EndpointContext<N> {
        &mut self.endpoints[usize::from(dci) - 1]
    }

    fn words(&self) -> &[Mmio<u32>] {
        let len = std::mem::size_of::<Self>() / 4;
        unsafe { std::slice::from_raw_parts(self as *const Self as *const Mmio<u32>, len) }
    }
    fn words_mut(&mut self) -> &mut [Mmio<u32>] {
        let len = std::mem::size_of::<Self>() / 4;
        unsafe { std::slice::from_raw_parts_mut(self as *mut Self as *mut Mmio<u32>, len) }
    }

    pub fn copy_from(&mut self, other: &DeviceContext<N>) {
        for (dst, src) in self.words_mut().iter_mut().zip(other.words()) {
            dst.write(src.read());
        }
    }

    pub fn clear(&mut self) {
        for word in self.words_mut() {
            word.write(0);
        }
    }
}

#[repr(C)]
pub struct InputContext<const N: usize> {
    pub drop_context: Mmio<u32>,
    pub add_context: Mmio<u32>,
    _rsvd: [Mmio<u32>; 5],
    pub control: Mmio<u32>,
    _rsvd64: Rsvd64<N>,
    pub device: DeviceContext<N>,
}

/// Add-context flag of the slot context.
pub const INPUT_CONTEXT_A0: u32 = 1 << 0;
/// Add-context flag of the default control endpoint.
pub const INPUT_CONTEXT_A1: u32 = 1 << 1;

impl<const N: usize> InputContext<N> {
    /// Start a fresh request: no drop flags, the given add flags, and the
    /// device part either zeroed or copied from the current output context.
    pub fn prepare(&mut self, add: u32, current: Option<&DeviceContext<N>>) {
        self.drop_context.write(0);
        self.add_context.write(add);
        self.control.write(0);
        match current {
            Some(current) => self.device.copy_from(current),
            None => self.device.clear(),
        }
    }

    pub fn dump_control(&self) {
        debug!(
            "INPUT CONTEXT: drop {:#010x} add {:#010x} control {:#010x}",
            self.drop_context.read(),
            self.add_context.read(),
            self.control.read()
        );
    }
}

const_assert_eq!(std::mem::size_of::<SlotContext<CONTEXT_32>>(), 32);
const_assert_eq!(std::mem::size_of::<DeviceContext<CONTEXT_32>>(), 1024);
const_assert_eq!(std::mem::size_of::<DeviceContext<CONTEXT_64>>(), 2048);

/// Device context index of the endpoint at bus address `address`.
///
/// Endpoint number 0 maps to the control context (1); IN endpoints take the
/// odd index of their pair. Addresses with reserved bits set are rejected.
pub fn endpoint_index(address: u8) -> Result<u8> {
    if address & 0x70 != 0 {
        return Err(Error::InvalidEndpoint(address));
    }
    let number = address & 0x0F;
    if number == 0 {
        return Ok(1);
    }
    let index = number * 2 + (address >> 7);
    debug_assert!(index <= 31);
    Ok(index)
}

/// Interval field in the controller's 125µs * 2^n encoding.
pub fn endpoint_interval(speed: Speed, ty: EndpointTy, b_interval: u8) -> u8 {
    let exponent = match (ty, speed) {
        (EndpointTy::Ctrl, _) | (EndpointTy::Bulk, _) => return 0,
        (EndpointTy::Interrupt, Speed::Low) | (EndpointTy::Interrupt, Speed::Full) => {
            // frames of 1ms, so 8 * bInterval microframes, rounded down to a power of two
            let microframes = u32::from(b_interval.max(1)) * 8;
            31 - microframes.leading_zeros()
        }
        (EndpointTy::Isoch, Speed::Full) => u32::from(b_interval.clamp(1, 16)) + 2,
        _ => u32::from(b_interval.clamp(1, 16)) - 1,
    };
    exponent.min(15) as u8
}

/// Max burst and max ESIT payload for `endpoint` at `speed`. SuperSpeed
/// endpoints take both from their companion descriptor when there is one.
pub fn endpoint_burst(
    speed: Speed,
    endpoint: &EndpointDescriptor,
    companion: Option<&SuperSpeedCompanionDescriptor>,
) -> (u8, u32) {
    let max_packet = u32::from(endpoint.max_packet_size());
    let periodic = matches!(endpoint.ty(), EndpointTy::Interrupt | EndpointTy::Isoch);
    let burst = match (speed, companion) {
        (speed, Some(companion)) if speed.is_superspeed() => companion.max_burst.min(15),
        (Speed::High, _) if periodic => endpoint.additional_transactions(),
        _ => 0,
    };
    if !periodic {
        return (burst, 0);
    }
    let esit = match companion {
        Some(companion) if speed.is_superspeed() && companion.bytes_per_interval != 0 => {
            u32::from(companion.bytes_per_interval)
        }
        _ => max_packet * (u32::from(burst) + 1),
    };
    (burst, esit)
}

pub struct DeviceContextList<const N: usize> {
    pub dcbaa: Dma<[u64]>,
    pub contexts: Vec<Dma<DeviceContext<N>>>,
    pub inputs: Vec<Dma<InputContext<N>>>,
}

impl<const N: usize> DeviceContextList<N> {
    pub fn new(allocator: &mut BumpAllocator, max_slots: u8) -> Result<Self> {
        let slots = usize::from(max_slots);
        let mut dcbaa = unsafe { allocator.alloc_slice::<u64>(slots + 1, CONTEXT_ALIGN) }
            .ok_or(Error::OutOfMemory((slots + 1) * 8))?;
        let mut contexts = Vec::with_capacity(slots);
        let mut inputs = Vec::with_capacity(slots);

        for i in 0..slots {
            let context: Dma<DeviceContext<N>> = unsafe { allocator.alloc_zeroed(CONTEXT_ALIGN) }
                .ok_or(Error::OutOfMemory(std::mem::size_of::<DeviceContext<N>>()))?;
            let input: Dma<InputContext<N>> = unsafe { allocator.alloc_zeroed(CONTEXT_ALIGN) }
                .ok_or(Error::OutOfMemory(std::mem::size_of::<InputContext<N>>()))?;
            dcbaa[i + 1] = context.physical() as u64;
            contexts.push(context);
            inputs.push(input);
        }

        Ok(DeviceContextList {
            dcbaa,
            contexts,
            inputs,
        })
    }

    pub fn dcbaap(&self) -> u64 {
        self.dcbaa.physical() as u64
    }

    pub fn set_scratchpad(&mut self, array: u64) {
        self.dcbaa[0] = array;
    }

    pub fn publish(&self, cache: &dyn CacheMaintenance) {
        self.dcbaa.publish(cache);
        for context in &self.contexts {
            context.publish(cache);
        }
    }

    pub fn output(&self, slot: u8) -> &Dma<DeviceContext<N>> {
        &self.contexts[usize::from(slot) - 1]
    }

    pub fn input_mut(&mut self, slot: u8) -> &mut Dma<InputContext<N>> {
        &mut self.inputs[usize::from(slot) - 1]
    }

    /// Build the input context of `slot` from the current output context,
    /// invalidating the output first since the controller writes it.
    pub fn input_from_output(
        &mut self,
        slot: u8,
        add: u32,
        cache: &dyn CacheMaintenance,
    ) -> &mut Dma<InputContext<N>> {
        let index = usize::from(slot) - 1;
        self.contexts[index].refresh(cache);
        let (contexts, inputs) = (&self.contexts, &mut self.inputs);
        inputs[index].prepare(add, Some(&contexts[index]));
        &mut inputs[index]
    }
}

#[repr(C)]
pub struct ScratchpadBufferEntry {
    pub value_low: Mmio<u32>,
    pub value_high: Mmio<u32>,
}
impl ScratchpadBufferEntry {
    pub fn set_addr(&mut self, addr: u64) {
        self.value_low.write(addr as u32);
        self.value_high.write((addr >> 32) as u32);
    }
}

pub struct ScratchpadBufferArray {
    pub entries: Dma<[ScratchpadBufferEntry]>,
    pub pages: Vec<Dma<[u8]>>,
}
impl ScratchpadBufferArray {
    pub fn new(allocator: &mut BumpAllocator, entries: u16, page_size: usize) -> Result<Self> {
        let count = usize::from(entries);
        let mut entries = unsafe { allocator.alloc_slice::<ScratchpadBufferEntry>(count, page_size) }
            .ok_or(Error::OutOfMemory(count * 8))?;

        let pages = entries
            .iter_mut()
            .map(|entry: &mut ScratchpadBufferEntry| -> Result<_> {
                let page = unsafe { allocator.alloc_slice::<u8>(page_size, page_size) }
                    .ok_or(Error::OutOfMemory(page_size))?;
                assert_eq!(page.physical() % page_size, 0);
                entry.set_addr(page.physical() as u64);
                Ok(page)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { entries, pages })
    }
    pub fn register(&self) -> u64 {
        self.entries.physical() as u64
    }
    pub fn publish(&self, cache: &dyn CacheMaintenance) {
        self.entries.publish(cache);
        for page in &self.pages {
            page.publish(cache);
        }
    }
}
