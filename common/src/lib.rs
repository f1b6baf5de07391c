//! Shared building blocks for the board drivers: register access, bounded
//! polling, DMA memory carving, cache maintenance and fixed-capacity pools.

pub mod cache;
pub mod dma;
pub mod io;
pub mod logger;
pub mod pool;
pub mod timeout;

pub use logger::setup_logging;
