//! Host driver for the DWC3 core's eXtensible Host Controller Interface (XHCI)
//!
//! The controller is programmed through three kinds of rings of 16-byte TRBs:
//! a command ring software submits controller commands to, one transfer ring
//! per device endpoint, and an event ring the controller reports completions
//! and port changes on. [`Xhci`] owns all of them together with the device
//! contexts the controller reads, and drives every connected device from the
//! first port status change to a bound class driver.
//!
//! Nothing here spawns threads. All progress is made either on the stack of
//! the caller of a [`driver_interface::UsbHost`] method or inside
//! [`Xhci::handle_interrupt`], which runs the completions of commands and
//! transfers as it drains the event ring.
//!
//! This documentation will refer directly to the relevant standards, which are as follows:
//!
//! - XHCI  - [eXtensible Host Controller Interface for Universal Serial Bus (xHCI) Requirements Specification](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf)
//! - USB2  - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! - USB32 - [Universal Serial Bus 3.2 Specification Revision 1.1](https://usb.org/document-library/usb-32-revision-11-june-2022)

#[macro_use]
extern crate bitflags;

pub mod config;
pub mod driver_interface;
mod error;
pub mod usb;
pub mod xhci;

pub use crate::config::ControllerConfig;
pub use crate::error::{Error, Result};
pub use crate::xhci::{Registers, Xhci};
