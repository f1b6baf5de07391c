use std::mem;
use std::sync::Arc;

use common::cache::CacheMaintenance;
use common::dma::{BumpAllocator, Dma};
use common::io::{Io, Mmio};
use static_assertions::const_assert_eq;

use super::ring::segment_align;
use super::trb::Trb;
use crate::error::{Error, Result};

#[repr(C)]
pub struct EventRingSte {
    pub address: Mmio<u64>,
    pub size: Mmio<u16>,
    _rsvd: Mmio<u16>,
    _rsvd2: Mmio<u32>,
}

const_assert_eq!(mem::size_of::<EventRingSte>(), 16);

/// The consumer side: the controller writes events, software reads them.
///
/// A record is new when its cycle bit matches `cycle`. The expected cycle
/// flips each time the reader wraps from the last segment back to the first.
pub struct EventRing {
    pub ste: Dma<[EventRingSte]>,
    pub segments: Vec<Dma<[Trb]>>,
    segment: usize,
    i: usize,
    cycle: bool,
    cache: Arc<dyn CacheMaintenance>,
}

impl EventRing {
    pub fn new(
        allocator: &mut BumpAllocator,
        segments: usize,
        trbs: usize,
        cache: Arc<dyn CacheMaintenance>,
    ) -> Result<EventRing> {
        assert!(segments > 0 && trbs >= 16);
        let mut ste = unsafe { allocator.alloc_slice::<EventRingSte>(segments, 64) }
            .ok_or(Error::OutOfMemory(segments * mem::size_of::<EventRingSte>()))?;

        let segments = (0..segments)
            .map(|_| unsafe { allocator.alloc_slice::<Trb>(trbs, segment_align(trbs)) })
            .collect::<Option<Vec<_>>>()
            .ok_or(Error::OutOfMemory(trbs * mem::size_of::<Trb>()))?;

        for (entry, segment) in ste.iter_mut().zip(&segments) {
            entry.address.write(segment.physical() as u64);
            entry.size.write(segment.len() as u16);
            segment.publish(&*cache);
        }
        ste.publish(&*cache);

        Ok(EventRing {
            ste,
            segments,
            segment: 0,
            i: 0,
            cycle: true,
            cache,
        })
    }

    /// Next event, if the controller has produced one.
    pub fn poll(&mut self) -> Option<Trb> {
        let segment = &self.segments[self.segment];
        segment.refresh_range(&*self.cache, self.i, 1);
        let trb = &segment[self.i];
        if trb.cycle() != self.cycle {
            return None;
        }
        let trb = trb.clone();

        self.i += 1;
        if self.i == segment.len() {
            self.i = 0;
            self.segment += 1;
            if self.segment == self.segments.len() {
                self.segment = 0;
                self.cycle = !self.cycle;
            }
        }
        Some(trb)
    }

    /// The record the controller will be told software is up to.
    pub fn erdp(&self) -> u64 {
        self.segments[self.segment].physical_of(self.i) as u64
    }
    pub fn erstba(&self) -> u64 {
        self.ste.physical() as u64
    }
    pub fn erstsz(&self) -> u32 {
        self.ste.len() as u32
    }
}
