use std::mem;
use std::sync::Arc;

use common::cache::CacheMaintenance;
use common::dma::{BumpAllocator, Dma};
use log::trace;

use super::trb::{Record, Trb, TrbFlags};
use crate::error::{Error, Result};

/// Ring segments must not straddle a 64K boundary.
const SEGMENT_BOUNDARY: usize = 0x10000;

pub(crate) fn segment_align(trbs: usize) -> usize {
    (trbs * mem::size_of::<Trb>())
        .next_power_of_two()
        .clamp(64, SEGMENT_BOUNDARY)
}

/// A producer ring: command ring or transfer ring.
///
/// The last slot is never handed out; it is where the Link TRB back to slot 0
/// lives once the producer reaches the end. A TD is only ever started where
/// all of its TRBs fit before that slot, so a TD never spans the link. Slots
/// skipped to get there are filled with No-Op TRBs of the current cycle.
pub struct Ring {
    pub link: bool,
    pub trbs: Dma<[Trb]>,
    pub i: usize,
    pub cycle: bool,
    cache: Arc<dyn CacheMaintenance>,
}

impl Ring {
    pub fn new(
        allocator: &mut BumpAllocator,
        length: usize,
        link: bool,
        cache: Arc<dyn CacheMaintenance>,
    ) -> Result<Ring> {
        assert!(length >= 2, "a ring needs room for a link TRB");
        let trbs = unsafe { allocator.alloc_slice::<Trb>(length, segment_align(length)) }
            .ok_or(Error::OutOfMemory(length * mem::size_of::<Trb>()))?;
        let ring = Ring {
            link,
            trbs,
            i: 0,
            cycle: true,
            cache,
        };
        ring.trbs.publish(&*ring.cache);
        Ok(ring)
    }

    /// Dequeue pointer as the controller wants it: physical address of the
    /// next producer slot with the cycle state in bit 0.
    pub fn register(&self) -> u64 {
        self.phys_of(self.i) | self.cycle as u64
    }

    /// TRBs a single TD may use.
    pub fn capacity(&self) -> usize {
        if self.link {
            self.trbs.len() - 1
        } else {
            self.trbs.len()
        }
    }

    /// Slot for the next TRB of a TD that still has `remaining` TRBs to
    /// write, counting this one. Wraps through a Link TRB first if they
    /// would not fit before the end of the ring.
    pub fn reserve_next(&mut self, remaining: usize) -> usize {
        assert!(
            remaining <= self.capacity(),
            "TD of {} TRBs does not fit a ring of {}",
            remaining,
            self.trbs.len()
        );
        if self.i + remaining > self.capacity() {
            assert!(self.link, "consumer rings are never written by software");
            let last = self.trbs.len() - 1;
            if self.i < last {
                // the controller walks these on its way to the link
                trace!(
                    "ring {:#x}: padding {}..{}",
                    self.trbs.physical(),
                    self.i,
                    last
                );
                let pad = Record::NoOp {
                    interrupter: 0,
                    flags: TrbFlags::empty(),
                }
                .encode(self.cycle);
                for trb in &mut self.trbs[self.i..last] {
                    trb.store(&pad);
                }
            }
            let link = Record::link(self.trbs.physical() as u64, true).encode(self.cycle);
            self.trbs[last].store(&link);
            self.trbs
                .publish_range(&*self.cache, self.i, self.trbs.len() - self.i);
            self.cycle = !self.cycle;
            self.i = 0;
        }
        self.i
    }

    /// Write `record` into the slot returned by [`Ring::reserve_next`] with
    /// the ring's cycle bit and publish it. Returns its physical address.
    pub fn commit(&mut self, index: usize, record: &Record) -> u64 {
        assert_eq!(index, self.i, "TRBs must be committed in ring order");
        let trb = record.encode(self.cycle);
        self.trbs[index].store(&trb);
        self.trbs.publish_range(&*self.cache, index, 1);
        self.i += 1;
        self.phys_of(index)
    }

    pub fn push(&mut self, remaining: usize, record: &Record) -> u64 {
        let index = self.reserve_next(remaining);
        self.commit(index, record)
    }

    pub fn phys_of(&self, index: usize) -> u64 {
        self.trbs.physical_of(index) as u64
    }

    pub fn index_of(&self, phys: u64) -> Option<usize> {
        let base = self.trbs.physical() as u64;
        let offset = phys.checked_sub(base)?;
        let index = (offset / mem::size_of::<Trb>() as u64) as usize;
        if offset % mem::size_of::<Trb>() as u64 != 0 || index >= self.trbs.len() {
            return None;
        }
        Some(index)
    }

    /// Fetch a TRB as the controller last left it.
    pub fn read(&self, index: usize) -> Trb {
        self.trbs.refresh_range(&*self.cache, index, 1);
        self.trbs[index].clone()
    }

    /// Forget everything on the ring. Only valid while the controller is not
    /// using it (endpoint disabled or slot reset).
    pub fn reset(&mut self) {
        for trb in self.trbs.iter_mut() {
            trb.set(0, 0, 0);
        }
        self.trbs.publish(&*self.cache);
        self.i = 0;
        self.cycle = true;
    }
}
