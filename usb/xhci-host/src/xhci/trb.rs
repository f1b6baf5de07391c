//! The 16-byte Transfer Request Block and its typed decoding.
//!
//! [`Trb`] is the raw record as it sits in ring memory. [`Record`] is the sum
//! type over every kind this host produces or consumes; `encode` and `decode`
//! convert between the two without touching reserved bits.

use std::convert::TryFrom;
use std::fmt;

use common::io::{Io, Mmio};
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::usb::Setup;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbType {
    Reserved,
    /* Transfer */
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    /* Command */
    EnableSlot,
    DisableSlot,
    AddressDevice,
    ConfigureEndpoint,
    EvaluateContext,
    ResetEndpoint,
    StopEndpoint,
    SetTrDequeuePointer,
    ResetDevice,
    ForceEvent,
    NegotiateBandwidth,
    SetLatencyToleranceValue,
    GetPortBandwidth,
    ForceHeader,
    NoOpCmd,
    GetExtendedProperty,
    SetExtendedProperty,
    /* Events */
    Transfer = 32,
    CommandCompletion,
    PortStatusChange,
    BandwidthRequest,
    Doorbell,
    HostController,
    DeviceNotification,
    MfindexWrap,
    /* Reserved from 40 to 47, vendor defined from 48 to 63 */
}

impl TryFrom<u8> for TrbType {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, DecodeError> {
        use TrbType::*;
        Ok(match raw {
            0 => Reserved,
            1 => Normal,
            2 => SetupStage,
            3 => DataStage,
            4 => StatusStage,
            5 => Isoch,
            6 => Link,
            7 => EventData,
            8 => NoOp,
            9 => EnableSlot,
            10 => DisableSlot,
            11 => AddressDevice,
            12 => ConfigureEndpoint,
            13 => EvaluateContext,
            14 => ResetEndpoint,
            15 => StopEndpoint,
            16 => SetTrDequeuePointer,
            17 => ResetDevice,
            18 => ForceEvent,
            19 => NegotiateBandwidth,
            20 => SetLatencyToleranceValue,
            21 => GetPortBandwidth,
            22 => ForceHeader,
            23 => NoOpCmd,
            24 => GetExtendedProperty,
            25 => SetExtendedProperty,
            32 => Transfer,
            33 => CommandCompletion,
            34 => PortStatusChange,
            35 => BandwidthRequest,
            36 => Doorbell,
            37 => HostController,
            38 => DeviceNotification,
            39 => MfindexWrap,
            other => return Err(DecodeError::Kind(other)),
        })
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbCompletionCode {
    Invalid = 0x00,
    Success = 0x01,
    DataBuffer = 0x02,
    BabbleDetected = 0x03,
    UsbTransaction = 0x04,
    Trb = 0x05,
    Stall = 0x06,
    Resource = 0x07,
    Bandwidth = 0x08,
    NoSlotsAvailable = 0x09,
    InvalidStreamType = 0x0A,
    SlotNotEnabled = 0x0B,
    EndpointNotEnabled = 0x0C,
    ShortPacket = 0x0D,
    RingUnderrun = 0x0E,
    RingOverrun = 0x0F,
    VfEventRingFull = 0x10,
    Parameter = 0x11,
    BandwidthOverrun = 0x12,
    ContextState = 0x13,
    NoPingResponse = 0x14,
    EventRingFull = 0x15,
    IncompatibleDevice = 0x16,
    MissedService = 0x17,
    CommandRingStopped = 0x18,
    CommandAborted = 0x19,
    Stopped = 0x1A,
    StoppedLengthInvalid = 0x1B,
    StoppedShortPacket = 0x1C,
    MaxExitLatencyTooLarge = 0x1D,
    Rsv30 = 0x1E,
    IsochBuffer = 0x1F,
    EventLost = 0x20,
    Undefined = 0x21,
    InvalidStreamId = 0x22,
    SecondaryBandwidth = 0x23,
    SplitTransaction = 0x24,
    /* Values from 37 to 191 are reserved */
    /* 192 to 223 are vendor defined errors */
    /* 224 to 255 are vendor defined information */
}

impl TrbCompletionCode {
    /// False for codes whose events carry no pointer to a source TRB.
    pub fn has_trb_pointer(self) -> bool {
        !matches!(
            self,
            Self::RingUnderrun | Self::RingOverrun | Self::VfEventRingFull
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::ShortPacket)
    }
}

impl TryFrom<u8> for TrbCompletionCode {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, DecodeError> {
        use TrbCompletionCode::*;
        const CODES: [TrbCompletionCode; 37] = [
            Invalid,
            Success,
            DataBuffer,
            BabbleDetected,
            UsbTransaction,
            Trb,
            Stall,
            Resource,
            Bandwidth,
            NoSlotsAvailable,
            InvalidStreamType,
            SlotNotEnabled,
            EndpointNotEnabled,
            ShortPacket,
            RingUnderrun,
            RingOverrun,
            VfEventRingFull,
            Parameter,
            BandwidthOverrun,
            ContextState,
            NoPingResponse,
            EventRingFull,
            IncompatibleDevice,
            MissedService,
            CommandRingStopped,
            CommandAborted,
            Stopped,
            StoppedLengthInvalid,
            StoppedShortPacket,
            MaxExitLatencyTooLarge,
            Rsv30,
            IsochBuffer,
            EventLost,
            Undefined,
            InvalidStreamId,
            SecondaryBandwidth,
            SplitTransaction,
        ];
        CODES
            .get(usize::from(raw))
            .copied()
            .ok_or(DecodeError::CompletionCode(raw))
    }
}

/// Transfer type of a Setup Stage TRB.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferKind {
    NoData,
    Reserved,
    Out,
    In,
}

impl TransferKind {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::NoData,
            1 => Self::Reserved,
            2 => Self::Out,
            _ => Self::In,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum DecodeError {
    #[error("unknown TRB type {0}")]
    Kind(u8),
    #[error("unknown completion code {0:#x}")]
    CompletionCode(u8),
}

bitflags! {
    /// Per-TRB control flags shared by the transfer TRB kinds.
    ///
    /// Bit 1 is Evaluate Next TRB on transfer TRBs and Toggle Cycle on Link.
    pub struct TrbFlags: u32 {
        const ENT = 1 << 1;
        const ISP = 1 << 2;
        const NS = 1 << 3;
        const CH = 1 << 4;
        const IOC = 1 << 5;
        const IDT = 1 << 6;
        const BEI = 1 << 9;
    }
}

pub const TRB_CONTROL_CYCLE_BIT: u32 = 1;

pub const TRB_STATUS_COMPLETION_CODE_SHIFT: u8 = 24;
pub const TRB_STATUS_COMPLETION_CODE_MASK: u32 = 0xFF00_0000;

pub const TRB_STATUS_COMPLETION_PARAM_SHIFT: u8 = 0;
pub const TRB_STATUS_COMPLETION_PARAM_MASK: u32 = 0x00FF_FFFF;

pub const TRB_STATUS_TRANSFER_LENGTH_SHIFT: u8 = 0;
pub const TRB_STATUS_TRANSFER_LENGTH_MASK: u32 = 0x0001_FFFF;

pub const TRB_STATUS_EVENT_LENGTH_MASK: u32 = 0x00FF_FFFF;

pub const TRB_STATUS_TD_SIZE_SHIFT: u8 = 17;
pub const TRB_STATUS_TD_SIZE_MASK: u32 = 0x003E_0000;

pub const TRB_STATUS_INTERRUPTER_SHIFT: u8 = 22;

pub const TRB_CONTROL_TRB_TYPE_SHIFT: u8 = 10;
pub const TRB_CONTROL_TRB_TYPE_MASK: u32 = 0x0000_FC00;

pub const TRB_CONTROL_EVENT_DATA_SHIFT: u8 = 2;
pub const TRB_CONTROL_EVENT_DATA_BIT: u32 = 1 << TRB_CONTROL_EVENT_DATA_SHIFT;

pub const TRB_CONTROL_BSR_BIT: u32 = 1 << 9;
pub const TRB_CONTROL_DIR_BIT: u32 = 1 << 16;

pub const TRB_CONTROL_ENDPOINT_ID_MASK: u32 = 0x001F_0000;
pub const TRB_CONTROL_ENDPOINT_ID_SHIFT: u8 = 16;

pub const TRB_CONTROL_SLOT_SHIFT: u8 = 24;

/// Largest byte count a single Normal or Data Stage TRB can carry.
pub const TRB_MAX_TRANSFER_LENGTH: u32 = 1 << 17;

#[repr(C)]
pub struct Trb {
    pub data_low: Mmio<u32>,
    pub data_high: Mmio<u32>,
    pub status: Mmio<u32>,
    pub control: Mmio<u32>,
}

const_assert_eq!(std::mem::size_of::<Trb>(), 16);

impl Clone for Trb {
    fn clone(&self) -> Self {
        Self::new(self.read_data(), self.status.read(), self.control.read())
    }
}

impl PartialEq for Trb {
    fn eq(&self, other: &Self) -> bool {
        self.read_data() == other.read_data()
            && self.status.read() == other.status.read()
            && self.control.read() == other.control.read()
    }
}

impl Eq for Trb {}

impl Trb {
    pub const fn new(data: u64, status: u32, control: u32) -> Self {
        Self {
            data_low: Mmio::new(data as u32),
            data_high: Mmio::new((data >> 32) as u32),
            status: Mmio::new(status),
            control: Mmio::new(control),
        }
    }

    pub fn set(&mut self, data: u64, status: u32, control: u32) {
        self.data_low.write(data as u32);
        self.data_high.write((data >> 32) as u32);
        self.status.write(status);
        self.control.write(control);
    }

    /// Store `value` field by field. The control word goes last so the cycle
    /// bit only flips once the rest of the record is in place.
    pub fn store(&mut self, value: &Trb) {
        self.set(value.read_data(), value.status.read(), value.control.read());
    }

    pub fn reserved(&mut self, cycle: bool) {
        self.set(0, 0, ((TrbType::Reserved as u32) << 10) | (cycle as u32));
    }

    pub fn read_data(&self) -> u64 {
        (self.data_low.read() as u64) | ((self.data_high.read() as u64) << 32)
    }

    pub fn cycle(&self) -> bool {
        self.control.readf(TRB_CONTROL_CYCLE_BIT)
    }

    pub fn trb_type(&self) -> u8 {
        ((self.control.read() & TRB_CONTROL_TRB_TYPE_MASK) >> TRB_CONTROL_TRB_TYPE_SHIFT) as u8
    }

    pub fn completion_code(&self) -> u8 {
        (self.status.read() >> TRB_STATUS_COMPLETION_CODE_SHIFT) as u8
    }
    pub fn completion_param(&self) -> u32 {
        self.status.read() & TRB_STATUS_COMPLETION_PARAM_MASK
    }
    pub fn event_slot(&self) -> u8 {
        (self.control.read() >> TRB_CONTROL_SLOT_SHIFT) as u8
    }
    pub fn endpoint_id(&self) -> u8 {
        ((self.control.read() & TRB_CONTROL_ENDPOINT_ID_MASK) >> TRB_CONTROL_ENDPOINT_ID_SHIFT)
            as u8
    }
    pub fn event_data_bit(&self) -> bool {
        self.control.readf(TRB_CONTROL_EVENT_DATA_BIT)
    }
}

impl fmt::Debug for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Trb {{ data: {:>016X}, status: {:>08X}, control: {:>08X} }}",
            self.read_data(),
            self.status.read(),
            self.control.read()
        )
    }
}

impl fmt::Display for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({:>016X}, {:>08X}, {:>08X})",
            self.read_data(),
            self.status.read(),
            self.control.read()
        )
    }
}

/// Every TRB kind this host writes or reads, keyed by the TRB type field.
///
/// Fields hold decoded values; the cycle bit is not part of a record and is
/// supplied by the ring at encode time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Record {
    Normal {
        buffer: u64,
        length: u32,
        td_size: u8,
        interrupter: u16,
        flags: TrbFlags,
    },
    SetupStage {
        setup: Setup,
        transfer: TransferKind,
        interrupter: u16,
        flags: TrbFlags,
    },
    DataStage {
        buffer: u64,
        length: u32,
        td_size: u8,
        interrupter: u16,
        input: bool,
        flags: TrbFlags,
    },
    StatusStage {
        interrupter: u16,
        input: bool,
        flags: TrbFlags,
    },
    Link {
        segment: u64,
        interrupter: u16,
        toggle_cycle: bool,
        flags: TrbFlags,
    },
    EventData {
        data: u64,
        interrupter: u16,
        flags: TrbFlags,
    },
    NoOp {
        interrupter: u16,
        flags: TrbFlags,
    },

    EnableSlot {
        slot_type: u8,
    },
    DisableSlot {
        slot: u8,
    },
    AddressDevice {
        input_context: u64,
        slot: u8,
        block_set_address: bool,
    },
    ConfigureEndpoint {
        input_context: u64,
        slot: u8,
        deconfigure: bool,
    },
    EvaluateContext {
        input_context: u64,
        slot: u8,
    },
    ResetEndpoint {
        slot: u8,
        endpoint: u8,
        preserve_transfer_state: bool,
    },
    StopEndpoint {
        slot: u8,
        endpoint: u8,
        suspend: bool,
    },
    SetTrDequeuePointer {
        dequeue: u64,
        stream: u16,
        slot: u8,
        endpoint: u8,
    },
    ResetDevice {
        slot: u8,
    },
    NoOpCommand,

    TransferEvent {
        pointer: u64,
        length: u32,
        code: TrbCompletionCode,
        event_data: bool,
        endpoint: u8,
        slot: u8,
    },
    CommandCompletion {
        command: u64,
        parameter: u32,
        code: TrbCompletionCode,
        vf: u8,
        slot: u8,
    },
    PortStatusChange {
        port: u8,
        code: TrbCompletionCode,
    },
    BandwidthRequest {
        slot: u8,
        code: TrbCompletionCode,
    },
    Doorbell {
        reason: u8,
        vf: u8,
        slot: u8,
        code: TrbCompletionCode,
    },
    HostController {
        code: TrbCompletionCode,
    },
    DeviceNotification {
        notification: u64,
        kind: u8,
        slot: u8,
        code: TrbCompletionCode,
    },
    MfindexWrap {
        code: TrbCompletionCode,
    },
}

fn control(kind: TrbType, cycle: bool) -> u32 {
    ((kind as u32) << TRB_CONTROL_TRB_TYPE_SHIFT) | u32::from(cycle)
}

fn transfer_status(length: u32, td_size: u8, interrupter: u16) -> u32 {
    assert!(length < TRB_MAX_TRANSFER_LENGTH, "TRB transfer length overflow");
    length | (u32::from(td_size.min(31)) << TRB_STATUS_TD_SIZE_SHIFT) | interrupter_bits(interrupter)
}

fn interrupter_bits(interrupter: u16) -> u32 {
    u32::from(interrupter & 0x3FF) << TRB_STATUS_INTERRUPTER_SHIFT
}

fn slot_bits(slot: u8) -> u32 {
    u32::from(slot) << TRB_CONTROL_SLOT_SHIFT
}

fn endpoint_bits(endpoint: u8) -> u32 {
    assert_eq!(endpoint & 0x1F, endpoint, "endpoint id out of range");
    u32::from(endpoint) << TRB_CONTROL_ENDPOINT_ID_SHIFT
}

fn code_bits(code: TrbCompletionCode) -> u32 {
    (code as u32) << TRB_STATUS_COMPLETION_CODE_SHIFT
}

fn context_pointer(ptr: u64) -> u64 {
    assert_eq!(ptr & !0xF, ptr, "unaligned input context ptr");
    ptr
}

impl Record {
    /// Setup Stage of a control transfer; the transfer type follows the
    /// request direction and whether a data stage exists.
    pub fn setup_stage(setup: Setup) -> Self {
        let transfer = match (setup.length, setup.is_device_to_host()) {
            (0, _) => TransferKind::NoData,
            (_, true) => TransferKind::In,
            (_, false) => TransferKind::Out,
        };
        Record::SetupStage {
            setup,
            transfer,
            interrupter: 0,
            flags: TrbFlags::IDT,
        }
    }

    pub fn data_stage(buffer: u64, length: u32, input: bool, td_size: u8) -> Self {
        Record::DataStage {
            buffer,
            length,
            td_size,
            interrupter: 0,
            input,
            flags: TrbFlags::ENT | TrbFlags::CH,
        }
    }

    /// Status Stage. With `chain` set, an Event Data TRB follows in the same TD;
    /// without it the Status Stage ends the TD silently.
    pub fn status_stage(input: bool, chain: bool) -> Self {
        let flags = if chain {
            TrbFlags::ENT | TrbFlags::CH
        } else {
            TrbFlags::empty()
        };
        Record::StatusStage {
            interrupter: 0,
            input,
            flags,
        }
    }

    pub fn normal(buffer: u64, length: u32, td_size: u8, chain: bool) -> Self {
        let flags = if chain {
            TrbFlags::ENT | TrbFlags::CH
        } else {
            TrbFlags::empty()
        };
        Record::Normal {
            buffer,
            length,
            td_size,
            interrupter: 0,
            flags,
        }
    }

    /// Completes the TD with a Transfer Event whose pointer field is `data`.
    pub fn event_data(data: u64) -> Self {
        Record::EventData {
            data,
            interrupter: 0,
            flags: TrbFlags::IOC,
        }
    }

    pub fn link(segment: u64, toggle_cycle: bool) -> Self {
        Record::Link {
            segment,
            interrupter: 0,
            toggle_cycle,
            flags: TrbFlags::CH,
        }
    }

    pub fn kind(&self) -> TrbType {
        match self {
            Record::Normal { .. } => TrbType::Normal,
            Record::SetupStage { .. } => TrbType::SetupStage,
            Record::DataStage { .. } => TrbType::DataStage,
            Record::StatusStage { .. } => TrbType::StatusStage,
            Record::Link { .. } => TrbType::Link,
            Record::EventData { .. } => TrbType::EventData,
            Record::NoOp { .. } => TrbType::NoOp,
            Record::EnableSlot { .. } => TrbType::EnableSlot,
            Record::DisableSlot { .. } => TrbType::DisableSlot,
            Record::AddressDevice { .. } => TrbType::AddressDevice,
            Record::ConfigureEndpoint { .. } => TrbType::ConfigureEndpoint,
            Record::EvaluateContext { .. } => TrbType::EvaluateContext,
            Record::ResetEndpoint { .. } => TrbType::ResetEndpoint,
            Record::StopEndpoint { .. } => TrbType::StopEndpoint,
            Record::SetTrDequeuePointer { .. } => TrbType::SetTrDequeuePointer,
            Record::ResetDevice { .. } => TrbType::ResetDevice,
            Record::NoOpCommand => TrbType::NoOpCmd,
            Record::TransferEvent { .. } => TrbType::Transfer,
            Record::CommandCompletion { .. } => TrbType::CommandCompletion,
            Record::PortStatusChange { .. } => TrbType::PortStatusChange,
            Record::BandwidthRequest { .. } => TrbType::BandwidthRequest,
            Record::Doorbell { .. } => TrbType::Doorbell,
            Record::HostController { .. } => TrbType::HostController,
            Record::DeviceNotification { .. } => TrbType::DeviceNotification,
            Record::MfindexWrap { .. } => TrbType::MfindexWrap,
        }
    }

    pub fn encode(&self, cycle: bool) -> Trb {
        let header = control(self.kind(), cycle);
        match *self {
            Record::Normal {
                buffer,
                length,
                td_size,
                interrupter,
                flags,
            } => Trb::new(
                buffer,
                transfer_status(length, td_size, interrupter),
                header | flags.bits(),
            ),
            Record::SetupStage {
                setup,
                transfer,
                interrupter,
                flags,
            } => Trb::new(
                setup.to_u64(),
                8 | interrupter_bits(interrupter),
                header | ((transfer as u32) << 16) | flags.bits(),
            ),
            Record::DataStage {
                buffer,
                length,
                td_size,
                interrupter,
                input,
                flags,
            } => Trb::new(
                buffer,
                transfer_status(length, td_size, interrupter),
                header | (u32::from(input) << 16) | flags.bits(),
            ),
            Record::StatusStage {
                interrupter,
                input,
                flags,
            } => Trb::new(
                0,
                interrupter_bits(interrupter),
                header | (u32::from(input) << 16) | flags.bits(),
            ),
            Record::Link {
                segment,
                interrupter,
                toggle_cycle,
                flags,
            } => Trb::new(
                segment & !0xF,
                interrupter_bits(interrupter),
                header | (u32::from(toggle_cycle) << 1) | (flags - TrbFlags::ENT).bits(),
            ),
            Record::EventData {
                data,
                interrupter,
                flags,
            } => Trb::new(data, interrupter_bits(interrupter), header | flags.bits()),
            Record::NoOp { interrupter, flags } => {
                Trb::new(0, interrupter_bits(interrupter), header | flags.bits())
            }

            Record::EnableSlot { slot_type } => {
                Trb::new(0, 0, header | (u32::from(slot_type & 0x1F) << 16))
            }
            Record::DisableSlot { slot } => Trb::new(0, 0, header | slot_bits(slot)),
            Record::AddressDevice {
                input_context,
                slot,
                block_set_address,
            } => Trb::new(
                context_pointer(input_context),
                0,
                header | slot_bits(slot) | (u32::from(block_set_address) << 9),
            ),
            Record::ConfigureEndpoint {
                input_context,
                slot,
                deconfigure,
            } => Trb::new(
                context_pointer(input_context),
                0,
                header | slot_bits(slot) | (u32::from(deconfigure) << 9),
            ),
            Record::EvaluateContext {
                input_context,
                slot,
            } => Trb::new(context_pointer(input_context), 0, header | slot_bits(slot)),
            Record::ResetEndpoint {
                slot,
                endpoint,
                preserve_transfer_state,
            } => Trb::new(
                0,
                0,
                header
                    | slot_bits(slot)
                    | endpoint_bits(endpoint)
                    | (u32::from(preserve_transfer_state) << 9),
            ),
            Record::StopEndpoint {
                slot,
                endpoint,
                suspend,
            } => Trb::new(
                0,
                0,
                header | slot_bits(slot) | (u32::from(suspend) << 23) | endpoint_bits(endpoint),
            ),
            Record::SetTrDequeuePointer {
                dequeue,
                stream,
                slot,
                endpoint,
            } => Trb::new(
                dequeue,
                u32::from(stream) << 16,
                header | slot_bits(slot) | endpoint_bits(endpoint),
            ),
            Record::ResetDevice { slot } => Trb::new(0, 0, header | slot_bits(slot)),
            Record::NoOpCommand => Trb::new(0, 0, header),

            Record::TransferEvent {
                pointer,
                length,
                code,
                event_data,
                endpoint,
                slot,
            } => Trb::new(
                pointer,
                (length & TRB_STATUS_EVENT_LENGTH_MASK) | code_bits(code),
                header
                    | (u32::from(event_data) << TRB_CONTROL_EVENT_DATA_SHIFT)
                    | endpoint_bits(endpoint)
                    | slot_bits(slot),
            ),
            Record::CommandCompletion {
                command,
                parameter,
                code,
                vf,
                slot,
            } => Trb::new(
                command,
                (parameter & TRB_STATUS_COMPLETION_PARAM_MASK) | code_bits(code),
                header | (u32::from(vf) << 16) | slot_bits(slot),
            ),
            Record::PortStatusChange { port, code } => {
                Trb::new(u64::from(port) << 24, code_bits(code), header)
            }
            Record::BandwidthRequest { slot, code } => {
                Trb::new(0, code_bits(code), header | slot_bits(slot))
            }
            Record::Doorbell {
                reason,
                vf,
                slot,
                code,
            } => Trb::new(
                u64::from(reason & 0x1F),
                code_bits(code),
                header | (u32::from(vf) << 16) | slot_bits(slot),
            ),
            Record::HostController { code } => Trb::new(0, code_bits(code), header),
            Record::DeviceNotification {
                notification,
                kind,
                slot,
                code,
            } => Trb::new(
                (notification << 8) | (u64::from(kind & 0xF) << 4),
                code_bits(code),
                header | slot_bits(slot),
            ),
            Record::MfindexWrap { code } => Trb::new(0, code_bits(code), header),
        }
    }

    pub fn decode(trb: &Trb) -> Result<Self, DecodeError> {
        let data = trb.read_data();
        let status = trb.status.read();
        let ctl = trb.control.read();
        let kind = TrbType::try_from(trb.trb_type())?;

        let interrupter = (status >> TRB_STATUS_INTERRUPTER_SHIFT) as u16;
        let td_size = ((status & TRB_STATUS_TD_SIZE_MASK) >> TRB_STATUS_TD_SIZE_SHIFT) as u8;
        let flags = TrbFlags::from_bits_truncate(ctl);
        let slot = trb.event_slot();
        let endpoint = trb.endpoint_id();
        let input = ctl & TRB_CONTROL_DIR_BIT != 0;
        let flag = |bit: u32| ctl & (1 << bit) != 0;
        let code = || TrbCompletionCode::try_from(trb.completion_code());

        Ok(match kind {
            TrbType::Normal => Record::Normal {
                buffer: data,
                length: status & TRB_STATUS_TRANSFER_LENGTH_MASK,
                td_size,
                interrupter,
                flags,
            },
            TrbType::SetupStage => Record::SetupStage {
                setup: Setup::from_u64(data),
                transfer: TransferKind::from_bits(ctl >> 16),
                interrupter,
                flags,
            },
            TrbType::DataStage => Record::DataStage {
                buffer: data,
                length: status & TRB_STATUS_TRANSFER_LENGTH_MASK,
                td_size,
                interrupter,
                input,
                flags,
            },
            TrbType::StatusStage => Record::StatusStage {
                interrupter,
                input,
                flags,
            },
            TrbType::Link => Record::Link {
                segment: data & !0xF,
                interrupter,
                toggle_cycle: flag(1),
                flags: flags - TrbFlags::ENT,
            },
            TrbType::EventData => Record::EventData {
                data,
                interrupter,
                flags,
            },
            TrbType::NoOp => Record::NoOp { interrupter, flags },

            TrbType::EnableSlot => Record::EnableSlot {
                slot_type: ((ctl >> 16) & 0x1F) as u8,
            },
            TrbType::DisableSlot => Record::DisableSlot { slot },
            TrbType::AddressDevice => Record::AddressDevice {
                input_context: data & !0xF,
                slot,
                block_set_address: flag(9),
            },
            TrbType::ConfigureEndpoint => Record::ConfigureEndpoint {
                input_context: data & !0xF,
                slot,
                deconfigure: flag(9),
            },
            TrbType::EvaluateContext => Record::EvaluateContext {
                input_context: data & !0xF,
                slot,
            },
            TrbType::ResetEndpoint => Record::ResetEndpoint {
                slot,
                endpoint,
                preserve_transfer_state: flag(9),
            },
            TrbType::StopEndpoint => Record::StopEndpoint {
                slot,
                endpoint,
                suspend: flag(23),
            },
            TrbType::SetTrDequeuePointer => Record::SetTrDequeuePointer {
                dequeue: data,
                stream: (status >> 16) as u16,
                slot,
                endpoint,
            },
            TrbType::ResetDevice => Record::ResetDevice { slot },
            TrbType::NoOpCmd => Record::NoOpCommand,

            TrbType::Transfer => Record::TransferEvent {
                pointer: data,
                length: status & TRB_STATUS_EVENT_LENGTH_MASK,
                code: code()?,
                event_data: trb.event_data_bit(),
                endpoint,
                slot,
            },
            TrbType::CommandCompletion => Record::CommandCompletion {
                command: data,
                parameter: trb.completion_param(),
                code: code()?,
                vf: (ctl >> 16) as u8,
                slot,
            },
            TrbType::PortStatusChange => Record::PortStatusChange {
                port: (data >> 24) as u8,
                code: code()?,
            },
            TrbType::BandwidthRequest => Record::BandwidthRequest {
                slot,
                code: code()?,
            },
            TrbType::Doorbell => Record::Doorbell {
                reason: (data & 0x1F) as u8,
                vf: (ctl >> 16) as u8,
                slot,
                code: code()?,
            },
            TrbType::HostController => Record::HostController { code: code()? },
            TrbType::DeviceNotification => Record::DeviceNotification {
                notification: data >> 8,
                kind: ((data >> 4) & 0xF) as u8,
                slot,
                code: code()?,
            },
            TrbType::MfindexWrap => Record::MfindexWrap { code: code()? },

            other => return Err(DecodeError::Kind(other as u8)),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::usb::{DescriptorKind, Setup};

    fn round_trip(record: Record) {
        for &cycle in &[false, true] {
            let trb = record.encode(cycle);
            assert_eq!(trb.cycle(), cycle);
            assert_eq!(trb.trb_type(), record.kind() as u8);
            assert_eq!(Record::decode(&trb), Ok(record), "{:?}", trb);
        }
    }

    #[test]
    fn size() {
        assert_eq!(std::mem::size_of::<Trb>(), 16);
        assert_eq!(std::mem::align_of::<Trb>(), 4);
    }

    #[test]
    fn address_device_layout() {
        let trb = Record::AddressDevice {
            input_context: 0x1234_5000,
            slot: 3,
            block_set_address: true,
        }
        .encode(true);
        assert_eq!(trb.read_data(), 0x1234_5000);
        assert_eq!(trb.status.read(), 0);
        assert_eq!(trb.control.read(), (3 << 24) | (11 << 10) | (1 << 9) | 1);
    }

    #[test]
    fn setup_stage_layout() {
        let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, 8);
        let trb = Record::setup_stage(setup).encode(false);
        assert_eq!(trb.read_data(), 0x0008_0000_0100_0680);
        assert_eq!(trb.status.read(), 8);
        // TRT = IN, IDT, type 2
        assert_eq!(trb.control.read(), (3 << 16) | (2 << 10) | (1 << 6));

        let set_config = Record::setup_stage(Setup::set_configuration(1)).encode(false);
        assert_eq!(set_config.control.read() >> 16, TransferKind::NoData as u32);
    }

    #[test]
    fn transfer_event_fields() {
        let trb = Trb::new(
            0xAB,
            (TrbCompletionCode::ShortPacket as u32) << 24 | 5,
            (7 << 24) | (3 << 16) | (32 << 10) | (1 << 2) | 1,
        );
        assert_eq!(
            Record::decode(&trb),
            Ok(Record::TransferEvent {
                pointer: 0xAB,
                length: 5,
                code: TrbCompletionCode::ShortPacket,
                event_data: true,
                endpoint: 3,
                slot: 7,
            })
        );
    }

    #[test]
    fn port_status_change_port() {
        let trb = Trb::new(2 << 24, 1 << 24, 34 << 10);
        assert_eq!(
            Record::decode(&trb),
            Ok(Record::PortStatusChange {
                port: 2,
                code: TrbCompletionCode::Success
            })
        );
    }

    #[test]
    fn variants_round_trip() {
        let setup = Setup::set_configuration(2);
        round_trip(Record::normal(0x8000, 512, 1, true));
        round_trip(Record::setup_stage(setup));
        round_trip(Record::data_stage(0x9000, 18, true, 2));
        round_trip(Record::status_stage(false, true));
        round_trip(Record::link(0x10000, true));
        round_trip(Record::event_data(17));
        round_trip(Record::NoOp {
            interrupter: 1,
            flags: TrbFlags::IOC,
        });
        round_trip(Record::EnableSlot { slot_type: 0 });
        round_trip(Record::ConfigureEndpoint {
            input_context: 0x2000,
            slot: 4,
            deconfigure: false,
        });
        round_trip(Record::EvaluateContext {
            input_context: 0x2040,
            slot: 9,
        });
        round_trip(Record::StopEndpoint {
            slot: 1,
            endpoint: 31,
            suspend: true,
        });
        round_trip(Record::SetTrDequeuePointer {
            dequeue: 0x4001,
            stream: 5,
            slot: 2,
            endpoint: 3,
        });
        round_trip(Record::ResetDevice { slot: 64 });
        round_trip(Record::NoOpCommand);
        round_trip(Record::CommandCompletion {
            command: 0x3010,
            parameter: 0x12,
            code: TrbCompletionCode::Success,
            vf: 0,
            slot: 5,
        });
        round_trip(Record::DeviceNotification {
            notification: 0xFF_FFFF,
            kind: 3,
            slot: 2,
            code: TrbCompletionCode::Success,
        });
        round_trip(Record::HostController {
            code: TrbCompletionCode::EventRingFull,
        });
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        assert_eq!(
            Record::decode(&Trb::new(0, 0, 45 << 10)),
            Err(DecodeError::Kind(45))
        );
        assert_eq!(
            Record::decode(&Trb::new(0, 0xC0 << 24, 37 << 10)),
            Err(DecodeError::CompletionCode(0xC0))
        );
    }
}
