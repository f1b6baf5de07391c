//! The event ring drain, run from the interrupt handler.
//!
//! Events are handled strictly in ring order and on the caller's stack.
//! Completions run from here and may queue more commands and transfers
//! before returning; only the drain itself is not reentrant.

use common::io::Io;
use log::{debug, error, info, trace, warn};

use super::command::Pending;
use super::device::Phase;
use super::device_enumerator::NewDeviceRequest;
use super::operational::{USB_STS_EINT, USB_STS_HSE, USB_STS_PCD};
use super::port::PortFlags;
use super::runtime::ERDP_EHB;
use super::trb::{Record, Trb, TrbCompletionCode};
use super::Xhci;
use crate::driver_interface::PortId;

impl<const N: usize> Xhci<N> {
    /// Drain the event ring and hand the dequeue pointer back to the
    /// controller. Returns the number of events handled; 0 as well when
    /// called while a drain is already running.
    pub fn handle_interrupt(&self) -> usize {
        let mut ring = match self.event_ring.try_lock() {
            Some(ring) => ring,
            None => return 0,
        };

        let sts = self.op.lock().usb_sts.read();
        if sts & USB_STS_HSE != 0 {
            error!("host system error, USBSTS {:#010x}", sts);
            return 0;
        }
        self.op.lock().ack_status(sts & (USB_STS_EINT | USB_STS_PCD));
        self.run.lock().ints[0].ack();

        let mut count = 0;
        while let Some(trb) = ring.poll() {
            self.dispatch(&trb);
            count += 1;
        }

        let erdp = ring.erdp();
        self.run.lock().ints[0].erdp.write(erdp | ERDP_EHB);
        if count > 0 {
            trace!("{} events, ERDP {:#x}", count, erdp);
        }
        count
    }

    fn dispatch(&self, trb: &Trb) {
        let record = match Record::decode(trb) {
            Ok(record) => record,
            Err(err) => {
                warn!("skipping event {}: {}", trb, err);
                return;
            }
        };
        match record {
            Record::CommandCompletion {
                command,
                code,
                slot,
                ..
            } => self.command_completed(command, code, slot),
            Record::TransferEvent {
                pointer,
                length,
                code,
                event_data,
                endpoint,
                slot,
            } => self.transfer_event(pointer, length, code, event_data, endpoint, slot),
            Record::PortStatusChange { port, .. } => self.port_changed(port),
            Record::HostController { code } => match code {
                TrbCompletionCode::EventRingFull => error!("event ring full, events were lost"),
                other => warn!("host controller event {:?}", other),
            },
            other => debug!("ignoring {:?}", other),
        }
    }

    fn command_completed(&self, command: u64, code: TrbCompletionCode, slot: u8) {
        let pending = self.cmd.lock().borrow_mut().pending.remove(&command);

        if !code.is_success() {
            let trb = {
                let guard = self.cmd.lock();
                let state = guard.borrow();
                state.ring.index_of(command).map(|i| state.ring.read(i))
            };
            match trb {
                Some(trb) => error!("command {} failed with {:?}", trb, code),
                None => error!("command at {:#x} failed with {:?}", command, code),
            }
            if self.slot(slot).is_ok() {
                let contexts = self.contexts.lock();
                let output = contexts.output(slot);
                output.refresh(&*self.cache);
                error!("slot {} is {:?}", slot, output.slot.state());
            }
        }

        match pending {
            Some(Pending::Enumeration(step)) => self.command_step(step, code, slot),
            Some(Pending::Detach(slot)) => self.finish_detach(slot, code),
            None => debug!("completion {:?} of untracked command {:#x}", code, command),
        }
    }

    fn transfer_event(
        &self,
        pointer: u64,
        length: u32,
        code: TrbCompletionCode,
        event_data: bool,
        endpoint: u8,
        slot: u8,
    ) {
        if event_data {
            return self.complete_transaction(pointer as usize, length, code, slot, endpoint);
        }
        if code.is_success() {
            trace!("slot {} endpoint {}: TRB {:#x} done", slot, endpoint, pointer);
            return;
        }

        let trb = self.slot(slot).ok().filter(|_| code.has_trb_pointer()).and_then(|dev| {
            let dev = dev.lock();
            let ring = dev.rings.get(usize::from(endpoint))?.as_ref()?;
            ring.index_of(pointer).map(|i| ring.read(i))
        });
        match trb {
            Some(trb) => error!(
                "slot {} endpoint {}: transfer {} failed with {:?}",
                slot, endpoint, trb, code
            ),
            None => error!(
                "slot {} endpoint {}: transfer at {:#x} failed with {:?}",
                slot, endpoint, pointer, code
            ),
        }
        if self.slot(slot).is_ok() && (1..32).contains(&endpoint) {
            let contexts = self.contexts.lock();
            let output = contexts.output(slot);
            output.refresh(&*self.cache);
            error!(
                "slot {} endpoint {} is {:?}",
                slot,
                endpoint,
                output.endpoint(endpoint).state()
            );
        }
        self.transfer_failed(slot);
    }

    /// React to the state of root port `port`: detach what was behind it,
    /// re-arm a USB2 reset, or queue the newly enabled device.
    pub(crate) fn port_changed(&self, port: u8) {
        let usb2 = port == self.config.controller.usb2_root_port;
        let (flags, reset) = {
            let mut ports = self.ports.lock();
            let count = ports.len();
            let regs = match usize::from(port)
                .checked_sub(1)
                .and_then(|index| ports.get_mut(index))
            {
                Some(regs) => regs,
                None => {
                    warn!("status change on port {} of {}", port, count);
                    return;
                }
            };
            let flags = regs.flags();
            let reset = usb2 && regs.needs_reset();
            regs.clear_changes();
            if reset {
                regs.set_pr();
            }
            (flags, reset)
        };
        debug!("port {}: {:?}", port, flags);

        let root = PortId::root(port);
        if !flags.contains(PortFlags::CCS) {
            let detached = self.detach_tree(root);
            if detached > 0 {
                info!("port {}: disconnected, {} devices detached", port, detached);
            }
            return;
        }
        if reset {
            debug!("port {}: connected, resetting", port);
            return;
        }
        if flags.contains(PortFlags::PED) && !self.device_on(root) {
            // failures are logged where they happen
            let _ = self.request_new_device(NewDeviceRequest {
                port: root,
                parent: None,
            });
        }
    }

    pub(crate) fn device_on(&self, port: PortId) -> bool {
        self.slots.iter().any(|slot| {
            let dev = slot.lock();
            dev.in_use() && dev.phase != Phase::Detaching && dev.port == port
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::xhci::harness::Harness;
    use common::cache::CacheMaintenance;

    #[derive(Default)]
    struct Recorder {
        invalidated: Mutex<Vec<(usize, usize)>>,
    }

    impl CacheMaintenance for Recorder {
        fn clean(&self, _addr: usize, _len: usize) {}
        fn invalidate(&self, addr: usize, len: usize) {
            self.invalidated.lock().push((addr, len));
        }
        fn clean_invalidate(&self, addr: usize, len: usize) {
            self.invalidate(addr, len);
        }
    }

    const CONNECTED: u32 = PortFlags::CCS.bits() | PortFlags::PP.bits() | PortFlags::CSC.bits();

    fn noop() -> Record {
        Record::HostController {
            code: TrbCompletionCode::Success,
        }
    }

    #[test]
    fn drain_is_not_reentrant() {
        let harness = Harness::new();
        harness.push_event(noop());
        {
            let _held = harness.hci.event_ring.lock();
            assert_eq!(harness.hci.handle_interrupt(), 0);
        }
        assert_eq!(harness.hci.handle_interrupt(), 1);
        assert_eq!(harness.hci.handle_interrupt(), 0);
    }

    #[test]
    fn host_system_error_stops_the_drain() {
        let harness = Harness::new();
        harness.push_event(noop());
        harness.write_reg(0x24, USB_STS_HSE);
        assert_eq!(harness.hci.handle_interrupt(), 0);
        harness.write_reg(0x24, USB_STS_EINT);
        assert_eq!(harness.hci.handle_interrupt(), 1);
    }

    #[test]
    fn dequeue_pointer_follows_the_drain() {
        let harness = Harness::new();
        for _ in 0..3 {
            harness.push_event(noop());
        }
        assert_eq!(harness.hci.handle_interrupt(), 3);
        let expected = harness.hci.event_ring.lock().segments[0].physical_of(3) as u64;
        assert_eq!(harness.reg64(0x478), expected | ERDP_EHB);
    }

    #[test]
    fn undecodable_events_are_skipped() {
        let harness = Harness::new();
        harness.push_raw(Trb::new(0, 0, 63 << 10));
        harness.push_event(noop());
        assert_eq!(harness.hci.handle_interrupt(), 2);
    }

    #[test]
    fn event_ring_is_invalidated_before_reading() {
        let recorder = Arc::new(Recorder::default());
        let harness = Harness::with_cache(recorder.clone());
        harness.push_event(noop());
        recorder.invalidated.lock().clear();
        harness.hci.handle_interrupt();

        let first = harness.hci.event_ring.lock().segments[0].physical_of(0);
        assert!(recorder
            .invalidated
            .lock()
            .iter()
            .any(|&(addr, len)| addr == first && len == 16));
    }

    #[test]
    fn usb2_port_reset_is_rearmed() {
        let harness = Harness::new();
        // connected, polling link state, not enabled
        harness.set_portsc(1, CONNECTED | (7 << 5));
        harness.push_event(Record::PortStatusChange {
            port: 1,
            code: TrbCompletionCode::Success,
        });
        assert_eq!(harness.hci.handle_interrupt(), 1);
        assert_ne!(harness.reg(0x420) & PortFlags::PR.bits(), 0);
        assert_eq!(harness.pending_commands(), 0);
    }

    #[test]
    fn enabled_port_starts_addressing() {
        let harness = Harness::new();
        harness.set_portsc(2, CONNECTED | PortFlags::PED.bits());
        harness.push_event(Record::PortStatusChange {
            port: 2,
            code: TrbCompletionCode::Success,
        });
        harness.hci.handle_interrupt();
        assert_eq!(harness.pending_commands(), 1);
        assert!(matches!(
            harness.next_command().1,
            Record::EnableSlot { slot_type: 0 }
        ));
    }

    #[test]
    fn port_scan_finds_connected_devices() {
        let harness = Harness::new();
        harness.set_portsc(2, CONNECTED | PortFlags::PED.bits());
        harness.hci.poll_ports();
        assert_eq!(harness.pending_commands(), 1);

        // an absent port does nothing
        harness.push_event(Record::PortStatusChange {
            port: 9,
            code: TrbCompletionCode::Success,
        });
        assert_eq!(harness.hci.handle_interrupt(), 1);
        assert_eq!(harness.pending_commands(), 1);
    }

    #[test]
    fn failed_untracked_command_is_only_logged() {
        let harness = Harness::new();
        harness.hci.submit_command(Record::NoOpCommand, None);
        let record = harness.complete_next_command(TrbCompletionCode::Trb, 0);
        assert_eq!(record, Record::NoOpCommand);
        assert!(harness.hci.cmd.lock().borrow().pending.is_empty());
    }
}
