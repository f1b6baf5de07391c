use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crossbeam_channel::{Receiver, Sender};
use log::trace;

use super::device_enumerator::{EnumStep, NewDeviceRequest};
use super::ring::Ring;
use super::trb::Record;
use super::Xhci;
use crate::driver_interface::PortId;

/// What to do once a command completes.
#[derive(Debug)]
pub(crate) enum Pending {
    Enumeration(EnumStep),
    /// Reset Device issued while detaching the slot.
    Detach(u8),
}

/// Everything behind the command lock.
///
/// The lock is reentrant: completion handlers run with it held and may
/// submit further commands or start the next device.
pub(crate) struct CommandState {
    pub ring: Ring,
    /// Outstanding commands by the physical address of their TRB.
    pub pending: BTreeMap<u64, Pending>,
    /// Slots that went through Reset Device and can be addressed again
    /// without Enable Slot.
    pub free_slots: VecDeque<u8>,
    /// Port of the device holding the addressing lock.
    pub addressing: Option<PortId>,
    /// Ports with a request in the queue.
    pub waiting: BTreeSet<PortId>,
    pub queue_tx: Sender<NewDeviceRequest>,
    pub queue_rx: Receiver<NewDeviceRequest>,
}

impl CommandState {
    pub fn new(ring: Ring, queue_len: usize) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(queue_len);
        Self {
            ring,
            pending: BTreeMap::new(),
            free_slots: VecDeque::new(),
            addressing: None,
            waiting: BTreeSet::new(),
            queue_tx,
            queue_rx,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue_rx.len()
    }
}

impl<const N: usize> Xhci<N> {
    /// Put a command on the command ring and ring doorbell 0. The pending
    /// action is recorded before the doorbell so the completion always finds it.
    pub(crate) fn submit_command(&self, record: Record, pending: Option<Pending>) -> u64 {
        let guard = self.cmd.lock();
        let phys = {
            let mut state = guard.borrow_mut();
            let phys = state.ring.push(1, &record);
            if let Some(pending) = pending {
                let previous = state.pending.insert(phys, pending);
                assert!(previous.is_none(), "command ring overran outstanding commands");
            }
            phys
        };
        trace!("command {:?} at {:#x}", record.kind(), phys);
        self.dbs.lock()[0].ring(0, 0);
        phys
    }
}
