use common::io::{Mmio, WriteOnly};

/// One doorbell register. Index 0 targets the command ring; index `n` targets
/// slot `n` and is written with the endpoint's device context index.
#[repr(C)]
pub struct Doorbell(WriteOnly<Mmio<u32>>);

impl Doorbell {
    pub fn ring(&mut self, target: u8, stream: u16) {
        self.0.write(u32::from(target) | (u32::from(stream) << 16));
    }
}
